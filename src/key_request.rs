//! Key Request Module
//!
//! A [`KeyRequest`] is one operator intent: which alias to (re)generate, with which
//! algorithm, signed by whom, and for how long. Requests are built per generation
//! cycle, passed by value through the lifecycle manager and dropped afterwards.
//!
//! # Example
//! ```rust
//! use keysmith::key_request::{Algorithm, KeyRequest, RsaKeySize, SigningMode};
//!
//! let request = KeyRequest::new("svc1", Algorithm::Rsa(RsaKeySize::Bits2048))
//!     .signing_mode(SigningMode::SelfSigned)
//!     .validity_days(30);
//! assert!(request.validate().is_ok());
//! ```

use crate::error::{KeyError, KeyResult};
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Name of the only curve used for ECDSA keys
pub const ECDSA_CURVE_NAME: &str = "prime256v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaKeySize {
    Bits2048,
    Bits3072,
    Bits4096,
}

impl RsaKeySize {
    pub const ALL: [RsaKeySize; 3] = [
        RsaKeySize::Bits2048,
        RsaKeySize::Bits3072,
        RsaKeySize::Bits4096,
    ];

    pub fn bits(self) -> u32 {
        match self {
            RsaKeySize::Bits2048 => 2048,
            RsaKeySize::Bits3072 => 3072,
            RsaKeySize::Bits4096 => 4096,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|size| size.bits() == bits)
    }
}

/// ECDSA size selection. Advisory only: keys are always generated on prime256v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaKeySize {
    Bits256,
    Bits384,
    Bits521,
}

impl EcdsaKeySize {
    pub const ALL: [EcdsaKeySize; 3] = [
        EcdsaKeySize::Bits256,
        EcdsaKeySize::Bits384,
        EcdsaKeySize::Bits521,
    ];

    pub fn bits(self) -> u32 {
        match self {
            EcdsaKeySize::Bits256 => 256,
            EcdsaKeySize::Bits384 => 384,
            EcdsaKeySize::Bits521 => 521,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|size| size.bits() == bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Rsa(RsaKeySize),
    Ecdsa(EcdsaKeySize),
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Rsa(size) => write!(f, "RSA-{}", size.bits()),
            Algorithm::Ecdsa(size) => {
                write!(f, "ECDSA-{} ({})", size.bits(), ECDSA_CURVE_NAME)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningMode {
    SelfSigned,
    CaSigned {
        ca_cert_path: PathBuf,
        ca_key_path: PathBuf,
    },
}

impl SigningMode {
    pub fn is_ca_signed(&self) -> bool {
        matches!(self, SigningMode::CaSigned { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub alias: String,
    pub algorithm: Algorithm,
    pub signing_mode: SigningMode,
    pub validity_days: u32,
}

impl KeyRequest {
    /// Create a self-signed request with the default validity of 365 days
    pub fn new(alias: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            alias: alias.into(),
            algorithm,
            signing_mode: SigningMode::SelfSigned,
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    pub fn signing_mode(mut self, mode: SigningMode) -> Self {
        self.signing_mode = mode;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Check the request before anything touches the disk
    ///
    /// The alias doubles as a file stem and as the registry key, so `:` (the
    /// registry delimiter), line breaks and path separators are rejected.
    pub fn validate(&self) -> KeyResult<()> {
        validate_alias(&self.alias)?;

        if self.validity_days == 0 {
            return Err(KeyError::validation(
                "validity days",
                "must be a positive number of days",
            ));
        }

        if let SigningMode::CaSigned {
            ca_cert_path,
            ca_key_path,
        } = &self.signing_mode
        {
            if ca_cert_path.as_os_str().is_empty() || ca_key_path.as_os_str().is_empty() {
                return Err(KeyError::validation(
                    "CA paths",
                    "both the CA certificate and CA key paths are required",
                ));
            }
        }
        Ok(())
    }
}

pub fn validate_alias(alias: &str) -> KeyResult<()> {
    if alias.trim().is_empty() {
        return Err(KeyError::validation("alias", "must not be empty"));
    }
    if alias != alias.trim() {
        return Err(KeyError::validation(
            "alias",
            "must not start or end with whitespace",
        ));
    }
    if let Some(c) = alias
        .chars()
        .find(|c| matches!(c, ':' | '\n' | '\r' | '/' | '\\') || c.is_control())
    {
        return Err(KeyError::validation(
            "alias",
            format!("contains reserved character {:?}", c),
        ));
    }
    if alias == "." || alias == ".." {
        return Err(KeyError::validation("alias", "must not be a relative path"));
    }
    Ok(())
}

//! Crypto Backend Module
//!
//! The lifecycle manager only decides *what* to ask for; the [`CryptoBackend`]
//! trait is the capability contract for *doing* it. [`OpensslBackend`] binds the
//! contract to the openssl library directly, no subprocesses involved.
//!
//! # Capabilities
//! - Raw private keys: RSA 2048/3072/4096, or ECDSA on prime256v1
//! - Certificate signing requests keyed to an alias, with the requested key
//!   parameters
//! - Signing a request with a CA certificate and key loaded from disk
//!
//! # Certificate Properties (CA-signed)
//! - **Version**: X.509v3
//! - **Serial Number**: Random 128-bit number
//! - **Subject**: taken from the CSR (`CN=<alias>, O, C`)
//! - **Issuer**: subject of the CA certificate
//! - **Validity**: the requested [`ValidityPeriod`], so `notAfter` falls on the
//!   registered expiry date
//! - **Signature Algorithm**: SHA-256
//! - **Basic Constraints**: CA=false, critical
//! - **Key Usage**: digitalSignature (+ keyEncipherment for RSA keys), critical

use crate::error::{KeyError, KeyResult};
use crate::expiry::{unix_timestamp, ValidityPeriod};
use crate::key_request::Algorithm;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509Req, X509};
use std::fs;
use std::path::Path;
use tracing::debug;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const X509_REQ_VERSION_1: i32 = 0;
const SERIAL_NUMBER_BITS: i32 = 128;

/// A certificate signing request and the private key it was made for, both PEM
pub struct SigningRequest {
    pub csr_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

pub trait CryptoBackend {
    /// PEM-encoded private key for `algorithm`
    fn generate_raw_key(&self, algorithm: Algorithm) -> KeyResult<Vec<u8>>;

    /// CSR with subject `CN=<alias>` over a fresh key of `algorithm`
    fn generate_signing_request(
        &self,
        alias: &str,
        algorithm: Algorithm,
    ) -> KeyResult<SigningRequest>;

    /// PEM certificate for `csr_pem` valid for `validity`, signed with the CA at
    /// the given paths
    ///
    /// Fails with [`KeyError::Ca`] when a CA file is missing, unreadable, not
    /// valid PEM, or when the key does not belong to the certificate.
    fn sign_certificate(
        &self,
        csr_pem: &[u8],
        ca_cert_path: &Path,
        ca_key_path: &Path,
        validity: ValidityPeriod,
    ) -> KeyResult<Vec<u8>>;
}

/// Subject fields added to every CSR next to the alias
#[derive(Debug, Clone)]
pub struct SubjectDefaults {
    pub organization: String,
    pub country: String,
}

#[derive(Debug, Clone)]
pub struct OpensslBackend {
    subject: SubjectDefaults,
}

impl OpensslBackend {
    pub fn new(subject: SubjectDefaults) -> Self {
        Self { subject }
    }

    fn generate_private_key(&self, algorithm: Algorithm) -> KeyResult<PKey<Private>> {
        let key = match algorithm {
            Algorithm::Rsa(size) => {
                let rsa = Rsa::generate(size.bits())
                    .map_err(|e| KeyError::backend("RSA key generation", e))?;
                PKey::from_rsa(rsa).map_err(|e| KeyError::backend("RSA key generation", e))?
            }
            // The size selection is advisory; the curve is fixed
            Algorithm::Ecdsa(_) => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
                    .map_err(|e| KeyError::backend("EC curve lookup", e))?;
                let ec = EcKey::generate(&group)
                    .map_err(|e| KeyError::backend("EC key generation", e))?;
                PKey::from_ec_key(ec).map_err(|e| KeyError::backend("EC key generation", e))?
            }
        };
        debug!(%algorithm, "private key generated");
        Ok(key)
    }

    fn subject_name(&self, alias: &str) -> KeyResult<X509Name> {
        let mut name_builder =
            X509Name::builder().map_err(|e| KeyError::backend("subject name", e))?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, alias)
            .map_err(|e| KeyError::backend("setting CN", e))?;
        if !self.subject.organization.is_empty() {
            name_builder
                .append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.subject.organization)
                .map_err(|e| KeyError::backend("setting organization", e))?;
        }
        if !self.subject.country.is_empty() {
            name_builder
                .append_entry_by_nid(Nid::COUNTRYNAME, &self.subject.country)
                .map_err(|e| KeyError::backend("setting country", e))?;
        }
        Ok(name_builder.build())
    }
}

impl CryptoBackend for OpensslBackend {
    fn generate_raw_key(&self, algorithm: Algorithm) -> KeyResult<Vec<u8>> {
        let key = self.generate_private_key(algorithm)?;
        key.private_key_to_pem_pkcs8()
            .map_err(|e| KeyError::backend("private key encoding", e))
    }

    fn generate_signing_request(
        &self,
        alias: &str,
        algorithm: Algorithm,
    ) -> KeyResult<SigningRequest> {
        let private_key = self.generate_private_key(algorithm)?;

        let mut builder = X509Req::builder().map_err(|e| KeyError::backend("CSR builder", e))?;
        builder
            .set_version(X509_REQ_VERSION_1)
            .map_err(|e| KeyError::backend("CSR version", e))?;
        let subject = self.subject_name(alias)?;
        builder
            .set_subject_name(&subject)
            .map_err(|e| KeyError::backend("CSR subject", e))?;
        builder
            .set_pubkey(&private_key)
            .map_err(|e| KeyError::backend("CSR public key", e))?;
        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| KeyError::backend("CSR signing", e))?;

        let csr_pem = builder
            .build()
            .to_pem()
            .map_err(|e| KeyError::backend("CSR encoding", e))?;
        let private_key_pem = private_key
            .private_key_to_pem_pkcs8()
            .map_err(|e| KeyError::backend("private key encoding", e))?;
        debug!(alias, "signing request created");
        Ok(SigningRequest {
            csr_pem,
            private_key_pem,
        })
    }

    fn sign_certificate(
        &self,
        csr_pem: &[u8],
        ca_cert_path: &Path,
        ca_key_path: &Path,
        validity: ValidityPeriod,
    ) -> KeyResult<Vec<u8>> {
        let ca_cert_data = fs::read(ca_cert_path).map_err(|e| KeyError::ca(ca_cert_path, e))?;
        let ca_cert = X509::from_pem(&ca_cert_data)
            .map_err(|e| KeyError::ca(ca_cert_path, format!("not a PEM certificate: {}", e)))?;
        let ca_key_data = fs::read(ca_key_path).map_err(|e| KeyError::ca(ca_key_path, e))?;
        let ca_key = PKey::private_key_from_pem(&ca_key_data)
            .map_err(|e| KeyError::ca(ca_key_path, format!("not a PEM private key: {}", e)))?;

        let ca_public_key = ca_cert
            .public_key()
            .map_err(|e| KeyError::ca(ca_cert_path, e))?;
        if !ca_public_key.public_eq(&ca_key) {
            return Err(KeyError::ca(
                ca_key_path,
                "key does not match the CA certificate",
            ));
        }

        let request =
            X509Req::from_pem(csr_pem).map_err(|e| KeyError::backend("CSR decoding", e))?;
        let request_key = request
            .public_key()
            .map_err(|e| KeyError::backend("CSR public key", e))?;
        if !request
            .verify(&request_key)
            .map_err(|e| KeyError::backend("CSR verification", e))?
        {
            return Err(KeyError::backend(
                "CSR verification",
                "signature does not match the request key",
            ));
        }

        // Build X509 certificate
        let mut builder = X509::builder().map_err(|e| KeyError::backend("X509 builder", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| KeyError::backend("setting version", e))?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_NUMBER_BITS, MsbOption::MAYBE_ZERO, false)?;
        let asn1_serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&asn1_serial)?;

        builder
            .set_subject_name(request.subject_name())
            .map_err(|e| KeyError::backend("setting subject", e))?;
        builder
            .set_issuer_name(ca_cert.subject_name())
            .map_err(|e| KeyError::backend("setting issuer", e))?;

        let not_before = asn1_time(validity.not_before)
            .map_err(|e| KeyError::backend("creating not_before", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| KeyError::backend("setting not_before", e))?;
        let not_after = asn1_time(validity.not_after)
            .map_err(|e| KeyError::backend("creating not_after", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| KeyError::backend("setting not_after", e))?;

        builder
            .set_pubkey(&request_key)
            .map_err(|e| KeyError::backend("setting public key", e))?;

        // End-entity certificate: no .ca()
        let basic_constraints = BasicConstraints::new()
            .critical()
            .build()
            .map_err(|e| KeyError::backend("building BasicConstraints", e))?;
        builder
            .append_extension(basic_constraints)
            .map_err(|e| KeyError::backend("adding BasicConstraints", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.digital_signature();
        if request_key.id() == Id::RSA {
            ku.key_encipherment();
        }
        let ku_extension = ku
            .build()
            .map_err(|e| KeyError::backend("building KeyUsage", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| KeyError::backend("adding KeyUsage", e))?;

        builder
            .sign(&ca_key, MessageDigest::sha256())
            .map_err(|e| KeyError::backend("signing certificate", e))?;

        let certificate = builder.build();
        debug!(ca = %ca_cert_path.display(), "certificate signed");
        certificate
            .to_pem()
            .map_err(|e| KeyError::backend("certificate encoding", e))
    }
}

fn asn1_time(at: chrono::NaiveDateTime) -> Result<Asn1Time, openssl::error::ErrorStack> {
    Asn1Time::from_unix(unix_timestamp(at))
}

/// Self-signed CA fixture written as `ca.pem` / `ca.key` into `dir`
#[cfg(test)]
pub(crate) fn write_test_ca(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "Test CA").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&openssl::asn1::Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    let cert_path = dir.join("ca.pem");
    let key_path = dir.join("ca.key");
    fs::write(&cert_path, builder.build().to_pem().unwrap()).unwrap();
    fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert_path, key_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::ValidityBase;
    use crate::key_request::{EcdsaKeySize, RsaKeySize};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn thirty_days() -> ValidityPeriod {
        ValidityBase::from_date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .period(30)
            .unwrap()
    }

    fn backend() -> OpensslBackend {
        OpensslBackend::new(SubjectDefaults {
            organization: "Keysmith".to_string(),
            country: "US".to_string(),
        })
    }

    #[test]
    fn test_raw_rsa_key_has_requested_size() {
        let pem = backend()
            .generate_raw_key(Algorithm::Rsa(RsaKeySize::Bits2048))
            .unwrap();
        let key = PKey::private_key_from_pem(&pem).unwrap();
        assert_eq!(key.id(), Id::RSA);
        assert_eq!(key.bits(), 2048);
    }

    #[test]
    fn test_ecdsa_curve_is_fixed() {
        let pem = backend()
            .generate_raw_key(Algorithm::Ecdsa(EcdsaKeySize::Bits521))
            .unwrap();
        let key = PKey::private_key_from_pem(&pem).unwrap();
        let ec = key.ec_key().unwrap();
        assert_eq!(ec.group().curve_name(), Some(Nid::X9_62_PRIME256V1));
    }

    #[test]
    fn test_ca_signed_certificate_keeps_requested_key_size() {
        let dir = TempDir::new().unwrap();
        let (ca_cert_path, ca_key_path) = write_test_ca(dir.path());
        let backend = backend();

        let request = backend
            .generate_signing_request("svc2", Algorithm::Rsa(RsaKeySize::Bits3072))
            .unwrap();
        let cert_pem = backend
            .sign_certificate(&request.csr_pem, &ca_cert_path, &ca_key_path, thirty_days())
            .unwrap();

        let cert = X509::from_pem(&cert_pem).unwrap();
        let ca_cert = X509::from_pem(&fs::read(&ca_cert_path).unwrap()).unwrap();
        assert!(cert.verify(&ca_cert.public_key().unwrap()).unwrap());
        assert_eq!(cert.public_key().unwrap().bits(), 3072);

        let cn = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "svc2");

        let private_key = PKey::private_key_from_pem(&request.private_key_pem).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&private_key));
    }

    #[test]
    fn test_certificate_validity_follows_requested_period() {
        let dir = TempDir::new().unwrap();
        let (ca_cert_path, ca_key_path) = write_test_ca(dir.path());
        let backend = backend();
        let period = thirty_days();

        let request = backend
            .generate_signing_request("svc2", Algorithm::Ecdsa(EcdsaKeySize::Bits256))
            .unwrap();
        let cert_pem = backend
            .sign_certificate(&request.csr_pem, &ca_cert_path, &ca_key_path, period)
            .unwrap();
        let cert = X509::from_pem(&cert_pem).unwrap();

        let expected_start = asn1_time(period.not_before).unwrap();
        let expected_end = asn1_time(period.not_after).unwrap();
        let start = cert.not_before().diff(&expected_start).unwrap();
        let end = cert.not_after().diff(&expected_end).unwrap();
        assert_eq!((start.days, start.secs), (0, 0));
        assert_eq!((end.days, end.secs), (0, 0));
    }

    #[test]
    fn test_missing_ca_key_is_ca_error() {
        let dir = TempDir::new().unwrap();
        let (ca_cert_path, _) = write_test_ca(dir.path());
        let backend = backend();
        let request = backend
            .generate_signing_request("svc2", Algorithm::Ecdsa(EcdsaKeySize::Bits256))
            .unwrap();

        let err = backend
            .sign_certificate(
                &request.csr_pem,
                &ca_cert_path,
                &dir.path().join("missing.key"),
                thirty_days(),
            )
            .unwrap_err();
        assert!(matches!(err, KeyError::Ca { .. }));
    }

    #[test]
    fn test_mismatched_ca_key_is_ca_error() {
        let dir = TempDir::new().unwrap();
        let (ca_cert_path, _) = write_test_ca(dir.path());
        let other_key = dir.path().join("other.key");
        fs::write(
            &other_key,
            backend()
                .generate_raw_key(Algorithm::Rsa(RsaKeySize::Bits2048))
                .unwrap(),
        )
        .unwrap();

        let request = backend()
            .generate_signing_request("svc2", Algorithm::Rsa(RsaKeySize::Bits2048))
            .unwrap();
        let err = backend()
            .sign_certificate(&request.csr_pem, &ca_cert_path, &other_key, thirty_days())
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_garbage_ca_certificate_is_ca_error() {
        let dir = TempDir::new().unwrap();
        let (_, ca_key_path) = write_test_ca(dir.path());
        let bogus = dir.path().join("bogus.pem");
        fs::write(&bogus, b"not a certificate").unwrap();

        let request = backend()
            .generate_signing_request("svc2", Algorithm::Rsa(RsaKeySize::Bits2048))
            .unwrap();
        let err = backend()
            .sign_certificate(&request.csr_pem, &bogus, &ca_key_path, thirty_days())
            .unwrap_err();
        assert!(matches!(err, KeyError::Ca { .. }));
    }
}

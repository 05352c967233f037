//! Key Lifecycle Module
//!
//! [`KeyLifecycleManager`] drives one [`KeyRequest`] from parameters to a persisted,
//! registered artifact and is the only writer of the registry and the key store.
//!
//! # Generation Steps
//!
//! 1. Validate the request
//! 2. Detect a collision: the alias is already registered or has material on disk
//! 3. Compute the validity period from the batch's [`ValidityBase`]
//! 4. Ask the [`CryptoBackend`] for the material (raw key, or CSR + CA signature
//!    over that same period)
//! 5. Stage the material, set the previous files aside and rename the new ones
//!    into place
//! 6. Replace the registry line for the alias
//!
//! Nothing on disk changes before step 5, so a failing backend or a bad CA leaves
//! the previous key (if any) and every other alias untouched.
//!
//! # Consistency
//!
//! An alias has a registry entry if and only if `<alias>.pem` exists, and the
//! entry describes that file. When step 5 or 6 fails, the new material is removed
//! and the files set aside are restored, so disk and registry are back where they
//! were before the request.

use crate::crypto_backend::CryptoBackend;
use crate::error::{KeyError, KeyResult};
use crate::expiry::{format_date, ValidityBase, ValidityPeriod};
use crate::key_request::{KeyRequest, SigningMode};
use crate::key_store::{DisplacedMaterial, KeyMaterial, KeyStore};
use crate::registry::{Registry, RegistryEntry};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

/// What a batch does after a key fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    #[default]
    ContinueOnError,
    StopOnFirstError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub alias: String,
    pub expiry_date: NaiveDate,
    pub size_bytes: u64,
    /// An earlier key under the same alias was replaced
    pub replaced: bool,
}

#[derive(Debug)]
pub struct BatchFailure {
    /// Zero-based position in the batch
    pub index: usize,
    pub alias: Option<String>,
    pub error: KeyError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<GenerationResult>,
    pub failed: Vec<BatchFailure>,
    /// Requests that were never attempted because the batch stopped
    pub skipped: usize,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped == 0
    }
}

/// Registry entries and key files that do not pair up
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RegistryAudit {
    /// Registered aliases without `<alias>.pem`
    pub missing_material: Vec<String>,
    /// `<alias>.pem` files without a registry entry
    pub untracked_material: Vec<String>,
}

impl RegistryAudit {
    pub fn is_consistent(&self) -> bool {
        self.missing_material.is_empty() && self.untracked_material.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum BaseSource {
    Clock,
    Fixed(ValidityBase),
}

impl BaseSource {
    fn capture(self) -> ValidityBase {
        match self {
            BaseSource::Clock => ValidityBase::now(),
            BaseSource::Fixed(base) => base,
        }
    }
}

pub struct KeyLifecycleManager<B: CryptoBackend> {
    backend: B,
    registry: Registry,
    store: KeyStore,
    base_source: BaseSource,
    base: ValidityBase,
}

impl<B: CryptoBackend> KeyLifecycleManager<B> {
    pub fn new(backend: B, registry: Registry, store: KeyStore) -> Self {
        Self {
            backend,
            registry,
            store,
            base_source: BaseSource::Clock,
            base: ValidityBase::now(),
        }
    }

    /// Pin every expiry computation to `base` instead of the clock
    pub fn with_base(mut self, base: ValidityBase) -> Self {
        self.base_source = BaseSource::Fixed(base);
        self.base = base;
        self
    }

    pub fn base(&self) -> ValidityBase {
        self.base
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Whether generating `alias` would replace an existing key
    pub fn is_live(&self, alias: &str) -> bool {
        self.registry.exists(alias) || self.store.has_material(alias)
    }

    /// Generate, persist and register the key described by `request`
    pub fn generate(&mut self, request: KeyRequest) -> KeyResult<GenerationResult> {
        request.validate()?;
        let alias = request.alias.clone();

        let replaced = self.is_live(&alias);
        if replaced {
            warn!(alias = %alias, "alias already in use, existing key will be replaced");
        }

        let period = self.base.period(request.validity_days)?;
        let expiry_date = period.expiry_date();
        let material = self.produce_material(&request, period)?;

        let staged = self.store.stage(&material)?;
        let previous = self.store.set_aside(&alias)?;
        let size_bytes = match staged.commit() {
            Ok(size_bytes) => size_bytes,
            Err(e) => {
                error!(alias = %alias, error = %e, "key material could not be placed");
                self.roll_back(&alias, previous);
                return Err(e);
            }
        };

        let entry = RegistryEntry::new(alias.clone(), expiry_date, size_bytes);
        if let Err(e) = self.registry.upsert(entry) {
            error!(alias = %alias, error = %e, "registry update failed");
            self.roll_back(&alias, previous);
            return Err(e);
        }
        drop(previous);

        info!(
            alias = %alias,
            algorithm = %request.algorithm,
            ca_signed = request.signing_mode.is_ca_signed(),
            expiry = %format_date(expiry_date),
            size_bytes,
            "key generated"
        );
        Ok(GenerationResult {
            alias,
            expiry_date,
            size_bytes,
            replaced,
        })
    }

    /// Run `count` generations, collecting each request from `next_request`
    ///
    /// `next_request` sees the manager as it stands before each key, so it can
    /// tell the operator about collisions.
    ///
    /// The validity base is captured once for the whole batch and the registry is
    /// reloaded from disk first; a registry that cannot be reloaded fails the batch
    /// before any request is collected.
    pub fn generate_batch<F>(
        &mut self,
        count: usize,
        policy: BatchPolicy,
        mut next_request: F,
    ) -> BatchReport
    where
        F: FnMut(usize, &Self) -> KeyResult<KeyRequest>,
    {
        let mut report = BatchReport::default();
        self.base = self.base_source.capture();

        match Registry::load(self.registry.path()) {
            Ok(registry) => self.registry = registry,
            Err(e) => {
                error!(error = %e, "registry could not be reloaded, batch aborted");
                report.failed.push(BatchFailure {
                    index: 0,
                    alias: None,
                    error: e,
                });
                report.skipped = count;
                return report;
            }
        }
        debug!(count, ?policy, "batch started");

        for index in 0..count {
            let outcome = match next_request(index, self) {
                Ok(request) => {
                    let alias = request.alias.clone();
                    self.generate(request).map_err(|error| BatchStepError {
                        alias: Some(alias),
                        error,
                    })
                }
                Err(error) => Err(BatchStepError { alias: None, error }),
            };

            match outcome {
                Ok(result) => report.succeeded.push(result),
                Err(failure) => {
                    let BatchStepError { alias, error } = failure;
                    warn!(index, alias = ?alias, error = %error, "key generation failed");
                    let stop = error.is_fatal() || policy == BatchPolicy::StopOnFirstError;
                    report.failed.push(BatchFailure {
                        index,
                        alias,
                        error,
                    });
                    if stop {
                        report.skipped = count - index - 1;
                        break;
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "batch finished"
        );
        report
    }

    /// Live registry entries sorted by alias
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.registry.entries().cloned().collect();
        entries.sort_by(|a, b| a.alias.cmp(&b.alias));
        entries
    }

    /// Compare the registry with the key directory
    pub fn verify(&self) -> KeyResult<RegistryAudit> {
        let on_disk = self.store.material_aliases()?;
        let registered = self.registry.aliases();

        let audit = RegistryAudit {
            missing_material: registered
                .iter()
                .filter(|alias| !self.store.has_material(alias))
                .cloned()
                .collect(),
            untracked_material: on_disk
                .into_iter()
                .filter(|alias| !self.registry.exists(alias))
                .collect(),
        };
        if !audit.is_consistent() {
            warn!(?audit, "registry and key directory disagree");
        }
        Ok(audit)
    }

    /// Put the files that were set aside back in place of the new ones
    fn roll_back(&self, alias: &str, previous: DisplacedMaterial) {
        if let Err(e) = self.store.restore(alias, previous) {
            error!(alias, error = %e, "failed to restore previous key material");
        }
    }

    fn produce_material(
        &self,
        request: &KeyRequest,
        period: ValidityPeriod,
    ) -> KeyResult<KeyMaterial> {
        let (content, private_key) = match &request.signing_mode {
            SigningMode::SelfSigned => {
                debug!(alias = %request.alias, "requesting raw key");
                (self.backend.generate_raw_key(request.algorithm)?, None)
            }
            SigningMode::CaSigned {
                ca_cert_path,
                ca_key_path,
            } => {
                debug!(alias = %request.alias, ca = %ca_cert_path.display(), "requesting CA-signed certificate");
                let signing_request = self
                    .backend
                    .generate_signing_request(&request.alias, request.algorithm)?;
                let certificate = self.backend.sign_certificate(
                    &signing_request.csr_pem,
                    ca_cert_path,
                    ca_key_path,
                    period,
                )?;
                (certificate, Some(signing_request.private_key_pem))
            }
        };
        Ok(KeyMaterial {
            alias: request.alias.clone(),
            content,
            private_key,
            created_at: self.base.timestamp(),
        })
    }
}

/// A failed batch step: the alias is known once the request was collected
struct BatchStepError {
    alias: Option<String>,
    error: KeyError,
}

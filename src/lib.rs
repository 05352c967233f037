//! Keysmith - Key Generation with an Expiry Registry
//!
//! Generates RSA or ECDSA keys, either as raw private keys or as certificates
//! signed by an existing CA, and keeps a registry of which aliases are live,
//! when they expire and how large their key material is.
//!
//! # Overview
//!
//! ```text
//! InteractionShell ──► KeyLifecycleManager ──► CryptoBackend (openssl)
//!                          │        │
//!                          ▼        ▼
//!                      KeyStore   Registry
//!                   <alias>.pem   "<alias>: <YYYY-MM-DD> (Size: <N> bytes)"
//! ```
//!
//! - **One key per alias**: generating an existing alias replaces its material
//!   and its registry line
//! - **Registry consistency**: an alias has a registry line if and only if its
//!   `<alias>.pem` exists
//! - **Atomic writes**: key material and registry are written to temporary files
//!   and renamed into place
//! - **Batches**: several keys per run, continuing or stopping after a failure
//!
//! # Example
//!
//! ```no_run
//! use keysmith::crypto_backend::{OpensslBackend, SubjectDefaults};
//! use keysmith::key_request::{Algorithm, KeyRequest, RsaKeySize};
//! use keysmith::key_store::KeyStore;
//! use keysmith::lifecycle::KeyLifecycleManager;
//! use keysmith::registry::Registry;
//!
//! fn main() -> anyhow::Result<()> {
//!     let backend = OpensslBackend::new(SubjectDefaults {
//!         organization: "ACME Corp".to_string(),
//!         country: "US".to_string(),
//!     });
//!     let registry = Registry::load("keys/registry.txt")?;
//!     let store = KeyStore::new("keys")?;
//!     let mut manager = KeyLifecycleManager::new(backend, registry, store);
//!
//!     let result = manager.generate(
//!         KeyRequest::new("svc1", Algorithm::Rsa(RsaKeySize::Bits2048)).validity_days(30),
//!     )?;
//!     println!("{} expires on {}", result.alias, result.expiry_date);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Library operations return [`error::KeyResult`]. Per-key failures
//! (validation, backend, CA, I/O) are isolated to that key; a corrupt registry
//! is fatal for the batch. The binary wraps everything in `anyhow::Result`.

pub mod configs;
pub mod crypto_backend;
pub mod error;
pub mod expiry;
pub mod key_request;
pub mod key_store;
pub mod lifecycle;
pub mod registry;
pub mod shell;

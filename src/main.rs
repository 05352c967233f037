//! Keysmith - interactive key generation
//!
//! ```bash
//! # optional configuration, defaults apply when absent
//! ./target/release/keysmith [keysmith.toml]
//! ```

use anyhow::{Context, Result};
use keysmith::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use keysmith::crypto_backend::OpensslBackend;
use keysmith::key_store::KeyStore;
use keysmith::lifecycle::KeyLifecycleManager;
use keysmith::registry::Registry;
use keysmith::shell::InteractionShell;
use std::io;
use tracing::info;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load_or_default(&config_path)
        .context(format!("Failed to load configuration from {}", config_path))?;

    config_tracing(config.log_level()?);

    println!("=== Keysmith ===\n");
    let registry = Registry::load(&config.registry_path).context("Failed to load registry")?;
    let store = KeyStore::new(&config.key_directory).context("Failed to open key directory")?;
    info!(
        registry = %config.registry_path.display(),
        keys = %config.key_directory.display(),
        entries = registry.len(),
        "storage ready"
    );
    println!("✓ Registry loaded from '{}'", config.registry_path.display());

    let backend = OpensslBackend::new(config.defaults.subject());
    let mut manager = KeyLifecycleManager::new(backend, registry, store);

    let stdin = io::stdin();
    let mut shell = InteractionShell::new(stdin.lock(), io::stdout(), config.defaults.clone());
    shell.run(&mut manager)
}

fn config_tracing(level: tracing::Level) {
    let tracing_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    let filter = filter::Targets::new()
        .with_target("keysmith", level)
        .with_default(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(tracing_layer)
        .with(filter)
        .init();
}

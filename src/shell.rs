//! Interactive Shell Module
//!
//! A line-oriented menu for the operator. The shell only collects parameters and
//! prints reports; every decision about keys is made by the
//! [`KeyLifecycleManager`](crate::lifecycle::KeyLifecycleManager).
//!
//! Invalid numbers and menu selections are asked again without a retry limit.
//! End of input ends the session.

use crate::configs::GenerationDefaults;
use crate::crypto_backend::CryptoBackend;
use crate::error::{KeyError, KeyResult};
use crate::expiry::format_date;
use crate::key_request::{
    validate_alias, Algorithm, EcdsaKeySize, KeyRequest, RsaKeySize, SigningMode,
    ECDSA_CURVE_NAME,
};
use crate::lifecycle::{BatchReport, KeyLifecycleManager};
use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;

const INPUT_NAME: &str = "<stdin>";

pub struct InteractionShell<R, W> {
    input: R,
    output: W,
    defaults: GenerationDefaults,
}

impl<R: BufRead, W: Write> InteractionShell<R, W> {
    pub fn new(input: R, output: W, defaults: GenerationDefaults) -> Self {
        Self {
            input,
            output,
            defaults,
        }
    }

    /// Main menu loop, returns when the operator exits or input ends
    pub fn run<B: CryptoBackend>(&mut self, manager: &mut KeyLifecycleManager<B>) -> Result<()> {
        loop {
            writeln!(self.output, "\n=== Keysmith Menu ===")?;
            writeln!(self.output, "1. Generate Keys")?;
            writeln!(self.output, "2. List Keys")?;
            writeln!(self.output, "3. Verify Registry")?;
            writeln!(self.output, "4. Exit")?;

            let choice = match self.prompt("\nSelect an option: ") {
                Ok(choice) => choice,
                Err(KeyError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(e).context("Failed to read menu selection"),
            };

            match choice.as_str() {
                "1" => self.generate_keys(manager)?,
                "2" => self.list_keys(manager)?,
                "3" => self.verify_registry(manager)?,
                "4" => break,
                _ => writeln!(self.output, "Invalid option. Please select 1-4.")?,
            }
        }
        writeln!(self.output, "\nExiting Keysmith...")?;
        Ok(())
    }

    fn generate_keys<B: CryptoBackend>(&mut self, manager: &mut KeyLifecycleManager<B>) -> Result<()> {
        writeln!(self.output, "\n=== Generate Keys ===")?;
        let count = match self.prompt_positive("Number of keys to generate: ", None) {
            Ok(count) => count as usize,
            Err(e) => {
                writeln!(self.output, "✗ {}", e)?;
                return Ok(());
            }
        };

        let policy = self.defaults.batch_policy;
        let report = manager.generate_batch(count, policy, |index, manager| {
            self.collect_request(index, count, manager)
        });
        self.print_report(&report)?;
        Ok(())
    }

    fn collect_request<B: CryptoBackend>(
        &mut self,
        index: usize,
        count: usize,
        manager: &KeyLifecycleManager<B>,
    ) -> KeyResult<KeyRequest> {
        self.say(&format!("\n--- Key {} of {} ---", index + 1, count))?;

        let alias = loop {
            let alias = self.prompt("Alias: ")?;
            match validate_alias(&alias) {
                Ok(()) => break alias,
                Err(e) => self.say(&e.to_string())?,
            }
        };
        if manager.is_live(&alias) {
            self.say(&format!(
                "⚠ Alias '{}' already exists; its key will be replaced.",
                alias
            ))?;
        }

        let algorithm = match self.choose("Algorithm:", &["RSA", "ECDSA"])? {
            0 => {
                let labels: Vec<String> = RsaKeySize::ALL
                    .iter()
                    .map(|size| size.bits().to_string())
                    .collect();
                let choice = self.choose("RSA key size:", &labels)?;
                Algorithm::Rsa(RsaKeySize::ALL[choice])
            }
            _ => {
                let labels: Vec<String> = EcdsaKeySize::ALL
                    .iter()
                    .map(|size| size.bits().to_string())
                    .collect();
                let title = format!("ECDSA key size (curve is always {}):", ECDSA_CURVE_NAME);
                let choice = self.choose(&title, &labels)?;
                Algorithm::Ecdsa(EcdsaKeySize::ALL[choice])
            }
        };

        let signing_mode = match self.choose("Signing mode:", &["CA", "Self-Signed"])? {
            0 => SigningMode::CaSigned {
                ca_cert_path: self.prompt_path("CA certificate path: ")?,
                ca_key_path: self.prompt_path("CA key path: ")?,
            },
            _ => SigningMode::SelfSigned,
        };

        let default_days = self.defaults.validity_days;
        let validity_days = self.prompt_positive(
            &format!("Validity in days [{}]: ", default_days),
            Some(default_days),
        )?;

        Ok(KeyRequest::new(alias, algorithm)
            .signing_mode(signing_mode)
            .validity_days(validity_days))
    }

    fn list_keys<B: CryptoBackend>(&mut self, manager: &KeyLifecycleManager<B>) -> Result<()> {
        writeln!(self.output, "\n=== Registered Keys ===")?;
        let entries = manager.list();
        if entries.is_empty() {
            writeln!(self.output, "Registry is empty. No keys generated yet.")?;
            return Ok(());
        }
        for entry in &entries {
            writeln!(self.output, "{}", entry)?;
        }
        writeln!(self.output, "\nTotal: {}", entries.len())?;
        Ok(())
    }

    fn verify_registry<B: CryptoBackend>(&mut self, manager: &KeyLifecycleManager<B>) -> Result<()> {
        writeln!(self.output, "\n=== Verify Registry ===")?;
        let audit = match manager.verify() {
            Ok(audit) => audit,
            Err(e) => {
                writeln!(self.output, "✗ Verification failed: {}", e)?;
                return Ok(());
            }
        };
        if audit.is_consistent() {
            writeln!(
                self.output,
                "✓ Registry and key directory are consistent ({} entries)",
                manager.registry().aliases().len()
            )?;
            return Ok(());
        }
        for alias in &audit.missing_material {
            writeln!(self.output, "✗ {}: registered but key material is missing", alias)?;
        }
        for alias in &audit.untracked_material {
            writeln!(self.output, "✗ {}: key material is not registered", alias)?;
        }
        Ok(())
    }

    fn print_report(&mut self, report: &BatchReport) -> Result<()> {
        writeln!(self.output, "\n=== Results ===")?;
        for result in &report.succeeded {
            writeln!(
                self.output,
                "✓ {}: expires {} (Size: {} bytes){}",
                result.alias,
                format_date(result.expiry_date),
                result.size_bytes,
                if result.replaced {
                    ", replaced previous key"
                } else {
                    ""
                }
            )?;
        }
        for failure in &report.failed {
            match &failure.alias {
                Some(alias) => writeln!(
                    self.output,
                    "✗ Key {} ({}): {}",
                    failure.index + 1,
                    alias,
                    failure.error
                )?,
                None => writeln!(self.output, "✗ Key {}: {}", failure.index + 1, failure.error)?,
            }
        }
        if report.skipped > 0 {
            writeln!(self.output, "{} key(s) skipped", report.skipped)?;
        }
        writeln!(
            self.output,
            "{} generated, {} failed",
            report.succeeded.len(),
            report.failed.len()
        )?;
        Ok(())
    }

    /// Numbered menu; returns the zero-based index of the selection
    fn choose<S: AsRef<str>>(&mut self, title: &str, options: &[S]) -> KeyResult<usize> {
        self.say(title)?;
        for (i, option) in options.iter().enumerate() {
            self.say(&format!("{}. {}", i + 1, option.as_ref()))?;
        }
        loop {
            let answer = self.prompt("Select: ")?;
            match answer.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(n - 1),
                _ => self.say(&format!(
                    "Invalid option. Please select 1-{}.",
                    options.len()
                ))?,
            }
        }
    }

    fn prompt_positive(&mut self, message: &str, default: Option<u32>) -> KeyResult<u32> {
        loop {
            let answer = self.prompt(message)?;
            if answer.is_empty() {
                if let Some(value) = default {
                    return Ok(value);
                }
            }
            match answer.parse::<u32>() {
                Ok(value) if value > 0 && answer.bytes().all(|b| b.is_ascii_digit()) => {
                    return Ok(value)
                }
                _ => self.say("Please enter a positive whole number.")?,
            }
        }
    }

    fn prompt_path(&mut self, message: &str) -> KeyResult<PathBuf> {
        loop {
            let answer = self.prompt(message)?;
            if !answer.is_empty() {
                return Ok(PathBuf::from(answer));
            }
            self.say("A path is required.")?;
        }
    }

    /// Print `message` and read one trimmed line
    fn prompt(&mut self, message: &str) -> KeyResult<String> {
        write!(self.output, "{}", message).map_err(|e| KeyError::io(INPUT_NAME, e))?;
        self.output
            .flush()
            .map_err(|e| KeyError::io(INPUT_NAME, e))?;

        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .map_err(|e| KeyError::io(INPUT_NAME, e))?;
        if read == 0 {
            return Err(KeyError::io(
                INPUT_NAME,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "input closed"),
            ));
        }
        Ok(line.trim().to_string())
    }

    fn say(&mut self, message: &str) -> KeyResult<()> {
        writeln!(self.output, "{}", message).map_err(|e| KeyError::io(INPUT_NAME, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_backend::{write_test_ca, OpensslBackend, SubjectDefaults};
    use crate::expiry::ValidityBase;
    use crate::key_store::KeyStore;
    use crate::registry::Registry;
    use chrono::NaiveDate;
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;
    use tempfile::TempDir;

    fn manager_in(dir: &Path) -> KeyLifecycleManager<OpensslBackend> {
        let backend = OpensslBackend::new(SubjectDefaults {
            organization: "Keysmith".to_string(),
            country: "US".to_string(),
        });
        let registry = Registry::load(dir.join("registry.txt")).unwrap();
        let store = KeyStore::new(dir.join("keys")).unwrap();
        let base = ValidityBase::from_date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        KeyLifecycleManager::new(backend, registry, store).with_base(base)
    }

    fn run_session(manager: &mut KeyLifecycleManager<OpensslBackend>, script: &str) -> String {
        let mut output = Vec::new();
        InteractionShell::new(
            Cursor::new(script.as_bytes().to_vec()),
            &mut output,
            GenerationDefaults::default(),
        )
        .run(manager)
        .unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_generates_self_signed_key_with_retries() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(dir.path());

        // menu, count, alias, RSA, bad size, 2048, self-signed, bad days, 30 days, exit
        let output = run_session(&mut manager, "9\n1\nx\n1\nsvc1\n1\n7\n1\n2\nabc\n30\n4\n");

        assert!(output.contains("Invalid option. Please select 1-4."));
        assert!(output.contains("Please enter a positive whole number."));
        assert!(output.contains("Invalid option. Please select 1-3."));
        assert!(output.contains("✓ svc1: expires 2025-01-31"));
        assert!(output.contains("1 generated, 0 failed"));
        assert!(manager.registry().exists("svc1"));
        assert!(manager.store().has_material("svc1"));
    }

    #[test]
    fn test_default_validity_and_overwrite_warning() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(dir.path());

        let script = "1\n2\nsvc1\n2\n1\n2\n\nsvc1\n2\n3\n2\n\n2\n4\n";
        let output = run_session(&mut manager, script);

        assert!(output.contains("⚠ Alias 'svc1' already exists"));
        assert!(output.contains("replaced previous key"));
        assert!(output.contains("svc1: 2026-01-01 (Size: "));
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn test_ca_failure_is_reported_and_batch_continues() {
        let dir = TempDir::new().unwrap();
        let (ca_cert_path, _) = write_test_ca(dir.path());
        let mut manager = manager_in(dir.path());

        let script = format!(
            "1\n2\nsvc2\n2\n1\n1\n{}\n{}\n10\nsvc3\n2\n1\n2\n10\n4\n",
            ca_cert_path.display(),
            dir.path().join("missing.key").display()
        );
        let output = run_session(&mut manager, &script);

        assert!(output.contains("✗ Key 1 (svc2): CA error"));
        assert!(output.contains("✓ svc3: expires 2025-01-11"));
        assert!(output.contains("1 generated, 1 failed"));
        assert!(!manager.registry().exists("svc2"));
    }

    #[test]
    fn test_list_and_verify() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(dir.path());
        let output = run_session(&mut manager, "2\n3\n1\n1\nsvc1\n2\n1\n2\n5\n2\n3\n4\n");

        assert!(output.contains("Registry is empty."));
        assert!(output.contains("✓ Registry and key directory are consistent (0 entries)"));
        assert!(output.contains("svc1: 2025-01-06 (Size: "));
        assert!(output.contains("consistent (1 entries)"));

        fs::remove_file(manager.store().material_path("svc1")).unwrap();
        let output = run_session(&mut manager, "3\n");
        assert!(output.contains("✗ svc1: registered but key material is missing"));
    }

    #[test]
    fn test_end_of_input_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(dir.path());

        let output = run_session(&mut manager, "1\n1\nsvc1\n");

        assert!(output.contains("✗ Key 1 (") || output.contains("✗ Key 1:"));
        assert!(output.contains("Exiting Keysmith"));
        assert!(manager.registry().is_empty());
    }
}

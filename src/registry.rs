//! Registry Module
//!
//! The registry is the durable alias → (expiry date, size) mapping and the single
//! source of truth for which aliases are live. It is a line-oriented UTF-8 file:
//!
//! ```text
//! key_1: 2025-06-01 (Size: 1704 bytes)
//! svc1: 2025-01-31 (Size: 1679 bytes)
//! ```
//!
//! # Update Semantics
//!
//! There is no update in place. `upsert` drops every line starting with `alias:`
//! and appends the new line; `remove` only drops. Lines that do not follow the
//! grammar are carried over untouched, and can still be removed by their prefix.
//!
//! Each change rewrites the whole file through a temporary file in the same
//! directory followed by an atomic rename, so an interrupted write leaves the
//! previous registry in place. The in-memory view only changes once the rename
//! has succeeded.

use crate::error::{KeyError, KeyResult};
use crate::expiry::{format_date, parse_date};
use chrono::NaiveDate;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// One registry line: `<alias>: <YYYY-MM-DD> (Size: <N> bytes)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub alias: String,
    pub expiry_date: NaiveDate,
    pub size_bytes: u64,
}

impl RegistryEntry {
    pub fn new(alias: impl Into<String>, expiry_date: NaiveDate, size_bytes: u64) -> Self {
        Self {
            alias: alias.into(),
            expiry_date,
            size_bytes,
        }
    }

    /// Parse a registry line, `None` if it does not follow the grammar
    pub fn parse(line: &str) -> Option<Self> {
        let (alias, rest) = line.split_once(": ")?;
        if alias.is_empty() || alias.contains(':') {
            return None;
        }
        let (date, size) = rest.split_once(" (Size: ")?;
        let size = size.strip_suffix(" bytes)")?;
        Some(Self {
            alias: alias.to_string(),
            expiry_date: parse_date(date)?,
            size_bytes: size.parse().ok()?,
        })
    }
}

impl fmt::Display for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (Size: {} bytes)",
            self.alias,
            format_date(self.expiry_date),
            self.size_bytes
        )
    }
}

#[derive(Debug, Clone)]
enum Line {
    Entry(RegistryEntry),
    Unparsed(String),
}

impl Line {
    fn text(&self) -> String {
        match self {
            Line::Entry(entry) => entry.to_string(),
            Line::Unparsed(raw) => raw.clone(),
        }
    }

    fn belongs_to(&self, alias: &str) -> bool {
        match self {
            Line::Entry(entry) => entry.alias == alias,
            Line::Unparsed(raw) => raw
                .strip_prefix(alias)
                .is_some_and(|rest| rest.starts_with(':')),
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    lines: Vec<Line>,
}

impl Registry {
    /// Load the registry at `path`; a missing file is an empty registry
    ///
    /// A file that exists but cannot be read, or is not valid UTF-8, is reported
    /// as [`KeyError::RegistryCorrupt`].
    pub fn load(path: impl AsRef<Path>) -> KeyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "registry not found, starting empty");
                return Ok(Self {
                    path,
                    lines: Vec::new(),
                });
            }
            Err(e) => {
                return Err(KeyError::RegistryCorrupt {
                    path,
                    cause: e.to_string(),
                })
            }
        };
        let text = String::from_utf8(bytes).map_err(|e| KeyError::RegistryCorrupt {
            path: path.clone(),
            cause: e.to_string(),
        })?;

        let lines: Vec<Line> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match RegistryEntry::parse(line) {
                Some(entry) => Line::Entry(entry),
                None => {
                    warn!(path = %path.display(), line, "keeping unparsed registry line");
                    Line::Unparsed(line.to_string())
                }
            })
            .collect();

        debug!(path = %path.display(), lines = lines.len(), "registry loaded");
        Ok(Self { path, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any line claims `alias`, parsed or not
    pub fn exists(&self, alias: &str) -> bool {
        self.lines.iter().any(|line| line.belongs_to(alias))
    }

    pub fn get(&self, alias: &str) -> Option<&RegistryEntry> {
        self.entries().find(|entry| entry.alias == alias)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry(entry) => Some(entry),
            Line::Unparsed(_) => None,
        })
    }

    /// Aliases claimed by any line, including unparsed ones
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Entry(entry) => Some(entry.alias.clone()),
                Line::Unparsed(raw) => raw
                    .split_once(':')
                    .map(|(alias, _)| alias.to_string())
                    .filter(|alias| !alias.is_empty()),
            })
            .collect();
        aliases.sort();
        aliases.dedup();
        aliases
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Drop every line for `entry.alias`, then append `entry`
    pub fn upsert(&mut self, entry: RegistryEntry) -> KeyResult<()> {
        let mut lines: Vec<Line> = self
            .lines
            .iter()
            .filter(|line| !line.belongs_to(&entry.alias))
            .cloned()
            .collect();
        debug!(alias = %entry.alias, "registry upsert");
        lines.push(Line::Entry(entry));
        self.commit(lines)
    }

    /// Drop every line for `alias`; returns whether anything was removed
    pub fn remove(&mut self, alias: &str) -> KeyResult<bool> {
        let lines: Vec<Line> = self
            .lines
            .iter()
            .filter(|line| !line.belongs_to(alias))
            .cloned()
            .collect();
        if lines.len() == self.lines.len() {
            return Ok(false);
        }
        debug!(alias, "registry remove");
        self.commit(lines)?;
        Ok(true)
    }

    fn commit(&mut self, lines: Vec<Line>) -> KeyResult<()> {
        write_atomically(&self.path, &lines)?;
        self.lines = lines;
        Ok(())
    }
}

fn write_atomically(path: &Path, lines: &[Line]) -> KeyResult<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&directory).map_err(|e| KeyError::io(&directory, e))?;

    let mut temp = NamedTempFile::new_in(&directory).map_err(|e| KeyError::io(&directory, e))?;
    for line in lines {
        writeln!(temp, "{}", line.text()).map_err(|e| KeyError::io(temp.path(), e))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| KeyError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| KeyError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(text: &str) -> NaiveDate {
        parse_date(text).unwrap()
    }

    #[test]
    fn test_line_round_trip() {
        let entry = RegistryEntry::new("key_1", date("2025-06-01"), 1704);
        let line = entry.to_string();
        assert_eq!(line, "key_1: 2025-06-01 (Size: 1704 bytes)");
        assert_eq!(RegistryEntry::parse(&line), Some(entry));
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(RegistryEntry::parse("key_1 2025-06-01 (Size: 1 bytes)").is_none());
        assert!(RegistryEntry::parse("key_1: 2025-13-01 (Size: 1 bytes)").is_none());
        assert!(RegistryEntry::parse("key_1: 2025-06-01 (Size: many bytes)").is_none());
        assert!(RegistryEntry::parse(": 2025-06-01 (Size: 1 bytes)").is_none());
    }

    #[test]
    fn test_persisted_entry_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.txt");

        let mut registry = Registry::load(&path).unwrap();
        assert!(registry.is_empty());
        registry
            .upsert(RegistryEntry::new("key_1", date("2025-06-01"), 1704))
            .unwrap();

        let reloaded = Registry::load(&path).unwrap();
        assert_eq!(
            reloaded.get("key_1"),
            Some(&RegistryEntry::new("key_1", date("2025-06-01"), 1704))
        );
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "key_1: 2025-06-01 (Size: 1704 bytes)\n"
        );
    }

    #[test]
    fn test_upsert_replaces_instead_of_duplicating() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::load(dir.path().join("registry.txt")).unwrap();

        registry
            .upsert(RegistryEntry::new("svc1", date("2025-01-31"), 100))
            .unwrap();
        registry
            .upsert(RegistryEntry::new("svc10", date("2025-02-01"), 200))
            .unwrap();
        registry
            .upsert(RegistryEntry::new("svc1", date("2026-01-01"), 300))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("svc1").unwrap().size_bytes, 300);
        assert_eq!(registry.get("svc10").unwrap().size_bytes, 200);
        // last write goes to the end of the file
        let text = fs::read_to_string(registry.path()).unwrap();
        assert!(text.ends_with("svc1: 2026-01-01 (Size: 300 bytes)\n"));
    }

    #[test]
    fn test_unparsed_lines_are_kept_and_removable_by_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.txt");
        fs::write(
            &path,
            "legacy: someday\nkey_1: 2025-06-01 (Size: 1704 bytes)\n# note\n",
        )
        .unwrap();

        let mut registry = Registry::load(&path).unwrap();
        assert!(registry.exists("legacy"));
        assert!(registry.get("legacy").is_none());
        assert_eq!(registry.aliases(), vec!["key_1", "legacy"]);

        registry
            .upsert(RegistryEntry::new("new", date("2025-07-01"), 10))
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("legacy: someday\n"));
        assert!(text.contains("# note\n"));

        assert!(registry.remove("legacy").unwrap());
        assert!(!registry.exists("legacy"));
        assert!(!registry.remove("legacy").unwrap());
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.txt");
        fs::write(&path, [0x6b, 0x3a, 0xff, 0xfe, b'\n']).unwrap();

        let err = Registry::load(&path).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.txt");
        let mut registry = Registry::load(&path).unwrap();
        registry
            .upsert(RegistryEntry::new("svc1", date("2025-01-31"), 100))
            .unwrap();

        // a directory where the registry file should be makes the rename fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();

        let result = registry.upsert(RegistryEntry::new("svc2", date("2025-01-31"), 1));
        assert!(matches!(result, Err(KeyError::Io { .. })));
        assert!(!registry.exists("svc2"));
        assert!(registry.exists("svc1"));
    }
}

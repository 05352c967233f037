//! Key Store Module
//!
//! Owns the key-material files on disk, one set per alias:
//!
//! - `<alias>.pem`: the key material proper (raw private key, or the CA-signed
//!   certificate)
//! - `<alias>.key`: private key companion of a CA-signed certificate
//!
//! Material is staged into temporary files inside the key directory and renamed
//! into place, so a reader never sees a half-written `<alias>.pem` and an
//! existing alias is replaced in one step. Temporary files are created with
//! mode 0600 on Unix and the rename keeps it.
//!
//! The files of a key being replaced are first moved aside with
//! [`KeyStore::set_aside`], so the caller can put them back with
//! [`KeyStore::restore`] if anything after the rename fails.

use crate::error::{KeyError, KeyResult};
use chrono::NaiveDateTime;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, error};

pub const MATERIAL_EXTENSION: &str = "pem";
pub const PRIVATE_KEY_EXTENSION: &str = "key";

/// Artifact produced by the crypto backend for one request
#[derive(Clone)]
pub struct KeyMaterial {
    pub alias: String,
    /// PEM content written to `<alias>.pem`
    pub content: Vec<u8>,
    /// PEM private key written to `<alias>.key`, present for CA-signed material
    pub private_key: Option<Vec<u8>>,
    pub created_at: NaiveDateTime,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("alias", &self.alias)
            .field("content_len", &self.content.len())
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    directory: PathBuf,
}

impl KeyStore {
    pub fn new(directory: impl Into<PathBuf>) -> KeyResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| KeyError::io(&directory, e))?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn material_path(&self, alias: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", alias, MATERIAL_EXTENSION))
    }

    pub fn private_key_path(&self, alias: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", alias, PRIVATE_KEY_EXTENSION))
    }

    pub fn has_material(&self, alias: &str) -> bool {
        self.material_path(alias).is_file()
    }

    /// Write `material` to temporary files next to its final location
    pub fn stage(&self, material: &KeyMaterial) -> KeyResult<StagedMaterial> {
        let content = self.write_temp(&material.content)?;
        let private_key = match &material.private_key {
            Some(pem) => Some(self.write_temp(pem)?),
            None => None,
        };
        Ok(StagedMaterial {
            material_path: self.material_path(&material.alias),
            private_key_path: self.private_key_path(&material.alias),
            content,
            private_key,
        })
    }

    /// Delete every file belonging to `alias`; returns whether `<alias>.pem` existed
    pub fn remove(&self, alias: &str) -> KeyResult<bool> {
        let existed = remove_if_present(&self.material_path(alias))?;
        remove_if_present(&self.private_key_path(alias))?;
        if existed {
            debug!(alias, "key material removed");
        }
        Ok(existed)
    }

    /// Move the current files of `alias` out of the way
    ///
    /// The returned [`DisplacedMaterial`] deletes them when dropped.
    pub fn set_aside(&self, alias: &str) -> KeyResult<DisplacedMaterial> {
        let mut displaced = DisplacedMaterial { files: Vec::new() };
        for path in [self.private_key_path(alias), self.material_path(alias)] {
            if !path.is_file() {
                continue;
            }
            match self.move_aside(&path) {
                Ok(aside) => displaced.files.push((path, aside)),
                Err(e) => {
                    if let Err(undo) = displaced.put_back() {
                        error!(alias, error = %undo, "failed to put displaced key material back");
                    }
                    return Err(e);
                }
            }
        }
        if !displaced.is_empty() {
            debug!(alias, files = displaced.files.len(), "previous key material set aside");
        }
        Ok(displaced)
    }

    /// Drop whatever `alias` has now and bring `displaced` back
    pub fn restore(&self, alias: &str, displaced: DisplacedMaterial) -> KeyResult<()> {
        self.remove(alias)?;
        let restored = !displaced.is_empty();
        displaced.put_back()?;
        if restored {
            debug!(alias, "previous key material restored");
        }
        Ok(())
    }

    /// Aliases that have a `<alias>.pem` file, sorted
    pub fn material_aliases(&self) -> KeyResult<Vec<String>> {
        let mut aliases = Vec::new();
        let entries = fs::read_dir(&self.directory).map_err(|e| KeyError::io(&self.directory, e))?;
        for entry in entries {
            let path = entry.map_err(|e| KeyError::io(&self.directory, e))?.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(MATERIAL_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                aliases.push(stem.to_string());
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    fn move_aside(&self, path: &Path) -> KeyResult<TempPath> {
        let aside = NamedTempFile::new_in(&self.directory)
            .map_err(|e| KeyError::io(&self.directory, e))?
            .into_temp_path();
        fs::rename(path, &aside).map_err(|e| KeyError::io(path, e))?;
        Ok(aside)
    }

    fn write_temp(&self, bytes: &[u8]) -> KeyResult<NamedTempFile> {
        let mut temp =
            NamedTempFile::new_in(&self.directory).map_err(|e| KeyError::io(&self.directory, e))?;
        temp.write_all(bytes)
            .map_err(|e| KeyError::io(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| KeyError::io(temp.path(), e))?;
        Ok(temp)
    }
}

/// Files of a replaced key, held under temporary names until the replacement sticks
pub struct DisplacedMaterial {
    files: Vec<(PathBuf, TempPath)>,
}

impl DisplacedMaterial {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn put_back(self) -> KeyResult<()> {
        for (path, aside) in self.files {
            aside
                .persist(&path)
                .map_err(|e| KeyError::io(&path, e.error))?;
        }
        Ok(())
    }
}

/// Material written to disk but not yet renamed into place
///
/// Dropping it without calling [`StagedMaterial::commit`] deletes the temporary files.
pub struct StagedMaterial {
    material_path: PathBuf,
    private_key_path: PathBuf,
    content: NamedTempFile,
    private_key: Option<NamedTempFile>,
}

impl StagedMaterial {
    /// Rename the staged files into place and return the size of `<alias>.pem`
    ///
    /// The private key goes first so a certificate never appears without it, and
    /// is removed again when the certificate cannot be placed. A stale
    /// `<alias>.key` from earlier CA-signed material is removed when the new
    /// material has none.
    pub fn commit(self) -> KeyResult<u64> {
        match self.private_key {
            Some(temp) => {
                temp.persist(&self.private_key_path)
                    .map_err(|e| KeyError::io(&self.private_key_path, e.error))?;
            }
            None => {
                remove_if_present(&self.private_key_path)?;
            }
        }
        if let Err(e) = self.content.persist(&self.material_path) {
            if let Err(cleanup) = remove_if_present(&self.private_key_path) {
                error!(path = %self.private_key_path.display(), error = %cleanup, "failed to remove orphaned private key");
            }
            return Err(KeyError::io(&self.material_path, e.error));
        }

        let size = fs::metadata(&self.material_path)
            .map_err(|e| KeyError::io(&self.material_path, e))?
            .len();
        debug!(path = %self.material_path.display(), size, "key material committed");
        Ok(size)
    }
}

fn remove_if_present(path: &Path) -> KeyResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(KeyError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::ValidityBase;
    use tempfile::TempDir;

    fn material(alias: &str, content: &[u8], private_key: Option<&[u8]>) -> KeyMaterial {
        KeyMaterial {
            alias: alias.to_string(),
            content: content.to_vec(),
            private_key: private_key.map(|pem| pem.to_vec()),
            created_at: ValidityBase::now().timestamp(),
        }
    }

    #[test]
    fn test_commit_places_files_and_reports_size() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();

        let size = store
            .stage(&material("svc1", b"certificate", Some(b"private")))
            .unwrap()
            .commit()
            .unwrap();

        assert_eq!(size, 11);
        assert!(store.has_material("svc1"));
        assert_eq!(fs::read(store.private_key_path("svc1")).unwrap(), b"private");
        assert_eq!(store.material_aliases().unwrap(), vec!["svc1"]);
    }

    #[test]
    fn test_replacing_drops_stale_private_key() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();
        store
            .stage(&material("svc1", b"ca signed", Some(b"private")))
            .unwrap()
            .commit()
            .unwrap();

        store
            .stage(&material("svc1", b"raw key", None))
            .unwrap()
            .commit()
            .unwrap();

        assert_eq!(fs::read(store.material_path("svc1")).unwrap(), b"raw key");
        assert!(!store.private_key_path("svc1").exists());
    }

    #[test]
    fn test_dropped_stage_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();

        let staged = store.stage(&material("svc1", b"abc", Some(b"k"))).unwrap();
        drop(staged);

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_commit_leaves_no_orphan_private_key() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();
        let occupied = store.material_path("svc1");
        fs::create_dir(&occupied).unwrap();
        fs::write(occupied.join("occupied"), b"x").unwrap();

        let err = store
            .stage(&material("svc1", b"certificate", Some(b"private")))
            .unwrap()
            .commit()
            .unwrap_err();

        assert!(matches!(err, KeyError::Io { .. }));
        assert!(!store.private_key_path("svc1").exists());
    }

    #[test]
    fn test_restore_brings_back_displaced_files() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();
        store
            .stage(&material("svc1", b"old cert", Some(b"old key")))
            .unwrap()
            .commit()
            .unwrap();

        let displaced = store.set_aside("svc1").unwrap();
        assert!(!displaced.is_empty());
        assert!(!store.has_material("svc1"));
        store
            .stage(&material("svc1", b"new raw key", None))
            .unwrap()
            .commit()
            .unwrap();

        store.restore("svc1", displaced).unwrap();
        assert_eq!(fs::read(store.material_path("svc1")).unwrap(), b"old cert");
        assert_eq!(fs::read(store.private_key_path("svc1")).unwrap(), b"old key");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_dropped_displacement_discards_old_files() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();
        store
            .stage(&material("svc1", b"old", None))
            .unwrap()
            .commit()
            .unwrap();

        let displaced = store.set_aside("svc1").unwrap();
        store
            .stage(&material("svc1", b"new", None))
            .unwrap()
            .commit()
            .unwrap();
        drop(displaced);

        assert_eq!(fs::read(store.material_path("svc1")).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_remove_reports_presence() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path()).unwrap();
        store
            .stage(&material("svc1", b"abc", Some(b"k")))
            .unwrap()
            .commit()
            .unwrap();

        assert!(store.remove("svc1").unwrap());
        assert!(!store.private_key_path("svc1").exists());
        assert!(!store.remove("svc1").unwrap());
    }

    #[test]
    fn test_debug_does_not_leak_private_key() {
        let debug = format!("{:?}", material("svc1", b"abc", Some(b"secret")));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("redacted"));
    }
}

//! Index manifest: the active table set, swapped atomically.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use super::{IndexError, IndexResult};

pub const MANIFEST_FILE: &str = "MANIFEST";

/// Serialized state of the table tier. `tables` is ordered oldest to newest;
/// `covered_to` is the log position below which every committed event has an
/// entry in this manifest's tables (memtable entries above it are rebuilt
/// from the log on startup).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub covered_to: i64,
    pub tables: Vec<String>,
}

impl Manifest {
    pub fn load(dir: &Path) -> IndexResult<Option<Manifest>> {
        let path = dir.join(MANIFEST_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(IndexError::io(&path, err)),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|source| IndexError::io(&path, source))?;
        if bytes.len() < 4 {
            return Err(IndexError::ManifestInvalid {
                path,
                reason: "manifest shorter than its checksum".to_string(),
            });
        }
        let body_len = bytes.len() - 4;
        let expected = u32::from_le_bytes(bytes[body_len..].try_into().expect("4 bytes"));
        let actual = crc32c(&bytes[..body_len]);
        if expected != actual {
            return Err(IndexError::ManifestInvalid {
                path,
                reason: format!("crc mismatch (expected {expected:#x}, got {actual:#x})"),
            });
        }
        let manifest: Manifest =
            serde_json::from_slice(&bytes[..body_len]).map_err(|err| {
                IndexError::ManifestInvalid {
                    path,
                    reason: err.to_string(),
                }
            })?;
        Ok(Some(manifest))
    }

    pub fn save(&self, dir: &Path) -> IndexResult<()> {
        let path = dir.join(MANIFEST_FILE);
        let tmp_path = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let mut body = serde_json::to_vec(self).map_err(|err| IndexError::ManifestInvalid {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let crc = crc32c(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| IndexError::io(&tmp_path, source))?;
        file.write_all(&body)
            .map_err(|source| IndexError::io(&tmp_path, source))?;
        file.sync_all()
            .map_err(|source| IndexError::io(&tmp_path, source))?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|source| IndexError::io(&path, source))?;

        let dir_file = File::open(dir).map_err(|source| IndexError::io(dir, source))?;
        dir_file
            .sync_all()
            .map_err(|source| IndexError::io(dir, source))?;
        Ok(())
    }

    pub fn table_file_name(generation: u64) -> String {
        format!("ptable-{generation:08}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_manifest_is_none() {
        let temp = TempDir::new().unwrap();
        assert_eq!(Manifest::load(temp.path()).unwrap(), None);
    }

    #[test]
    fn save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest {
            generation: 3,
            covered_to: 8192,
            tables: vec![
                Manifest::table_file_name(1),
                Manifest::table_file_name(3),
            ],
        };
        manifest.save(temp.path()).unwrap();
        assert_eq!(Manifest::load(temp.path()).unwrap(), Some(manifest));
    }

    #[test]
    fn corrupt_manifest_detected() {
        let temp = TempDir::new().unwrap();
        Manifest::default().save(temp.path()).unwrap();
        let path = temp.path().join(MANIFEST_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            Manifest::load(temp.path()),
            Err(IndexError::ManifestInvalid { .. })
        ));
    }
}

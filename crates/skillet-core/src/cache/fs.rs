use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CacheError, Fingerprint, Result, SampleStore};
use crate::domain::GradeResult;

/// Filesystem-backed sample store with git-style 2-char sharding.
///
/// Layout: `<root>/samples/<first 2 hex chars>/<remaining hex chars>.json`
pub struct FsSampleStore {
    samples_dir: PathBuf,
}

impl FsSampleStore {
    /// Create a store rooted at `root`. Creates `root/samples/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let samples_dir = root.as_ref().join("samples");
        fs::create_dir_all(&samples_dir)?;
        Ok(Self { samples_dir })
    }

    fn entry_path(&self, fp: &Fingerprint) -> PathBuf {
        let hex = fp.to_hex();
        self.samples_dir
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }
}

impl SampleStore for FsSampleStore {
    fn load(&self, fp: &Fingerprint) -> Result<Option<GradeResult>> {
        let path = self.entry_path(fp);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                fingerprint: fp.to_hex(),
                reason: e.to_string(),
            })
    }

    fn save(&self, fp: &Fingerprint, grade: &GradeResult) -> Result<()> {
        let path = self.entry_path(fp);
        if path.exists() {
            return Ok(());
        }

        let shard_dir = self.samples_dir.join(&fp.to_hex()[..2]);
        fs::create_dir_all(&shard_dir)?;

        let body = serde_json::to_vec_pretty(grade).map_err(|e| CacheError::Corrupt {
            fingerprint: fp.to_hex(),
            reason: e.to_string(),
        })?;

        // Write to a temp file in the shard, then rename into place.
        let mut tmp = NamedTempFile::new_in(&shard_dir)?;
        tmp.write_all(&body)?;
        tmp.persist_noclobber(&path).map(|_| ()).or_else(|e| {
            if path.exists() {
                Ok(())
            } else {
                Err(CacheError::Io(e.error))
            }
        })?;
        Ok(())
    }
}

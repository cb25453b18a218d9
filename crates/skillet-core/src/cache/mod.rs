pub mod fs;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::domain::{EvalCase, GradeResult, GradingMode, TargetId};

/// SHA-256 fingerprint used as a sample cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the SHA-256 fingerprint of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Fingerprint of one graded sample: eval content, sample index, target
    /// content and grading mode. Any change to any of them is a new key.
    pub fn for_sample(
        case: &EvalCase,
        sample_idx: usize,
        target: &TargetId,
        mode: GradingMode,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"eval\0");
        // Field order of EvalCase is fixed, so the JSON form is canonical.
        hasher.update(serde_json::to_vec(case).unwrap_or_default());
        hasher.update(b"\0sample\0");
        hasher.update(sample_idx.to_le_bytes());
        hasher.update(b"\0target\0");
        match target {
            TargetId::Baseline => hasher.update(b"baseline"),
            TargetId::Skill(fp) => hasher.update(fp.as_bytes()),
        }
        hasher.update(b"\0mode\0");
        hasher.update(match mode {
            GradingMode::Assertions => b"assertions".as_slice(),
            GradingMode::Judge => b"judge".as_slice(),
        });
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines and labels.
    pub fn short(&self) -> String {
        self.to_hex().chars().take(12).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = CacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidFingerprint(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CacheError::InvalidFingerprint(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Errors from sample cache storage.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprint(String),

    #[error("corrupt cache entry {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Persistent backing store for graded samples.
pub trait SampleStore: Send + Sync {
    /// Load the grade stored under `fp`, if any.
    fn load(&self, fp: &Fingerprint) -> Result<Option<GradeResult>>;

    /// Store `grade` under `fp`. An existing entry is left untouched.
    fn save(&self, fp: &Fingerprint, grade: &GradeResult) -> Result<()>;
}

/// How a cache request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome {
    /// A stored result, or one computed by a concurrent requester.
    Hit(GradeResult),
    /// This caller ran the computation.
    Computed(GradeResult),
}

impl CacheOutcome {
    pub fn grade(&self) -> &GradeResult {
        match self {
            CacheOutcome::Hit(g) | CacheOutcome::Computed(g) => g,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit(_))
    }
}

/// Content-addressed memo of graded samples.
///
/// Each fingerprint owns one `OnceCell`, so concurrent requesters for the same
/// key wait on a single computation. A failed computation leaves the cell
/// empty and the next requester runs its own.
#[derive(Default)]
pub struct SampleCache {
    entries: Mutex<HashMap<Fingerprint, Arc<OnceCell<GradeResult>>>>,
    store: Option<Arc<dyn SampleStore>>,
}

impl SampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache backed by a persistent store.
    pub fn with_store(store: Arc<dyn SampleStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    fn cell(&self, fp: &Fingerprint) -> Arc<OnceCell<GradeResult>> {
        let mut entries = self.entries.lock().expect("sample cache lock poisoned");
        entries.entry(*fp).or_default().clone()
    }

    fn load_persisted(&self, fp: &Fingerprint) -> Option<GradeResult> {
        let store = self.store.as_ref()?;
        match store.load(fp) {
            Ok(found) => found,
            Err(e) => {
                warn!(fingerprint = %fp.short(), error = %e, "ignoring unreadable cache entry");
                None
            }
        }
    }

    fn persist(&self, fp: &Fingerprint, grade: &GradeResult) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(fp, grade) {
                warn!(fingerprint = %fp.short(), error = %e, "failed to persist cache entry");
            }
        }
    }

    /// Return the result for `fp` without computing anything.
    pub fn peek(&self, fp: &Fingerprint) -> Option<GradeResult> {
        let in_memory = {
            let entries = self.entries.lock().expect("sample cache lock poisoned");
            entries.get(fp).and_then(|cell| cell.get().cloned())
        };
        in_memory.or_else(|| self.load_persisted(fp))
    }

    /// Number of results held in memory.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("sample cache lock poisoned");
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the stored result for `fp`, or run `compute` exactly once across
    /// all concurrent callers of the same key.
    ///
    /// With `bypass` set the lookup is skipped and `compute` always runs; the
    /// fresh result is still written through, but an existing entry wins.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fp: &Fingerprint,
        bypass: bool,
        compute: F,
    ) -> std::result::Result<CacheOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<GradeResult, E>>,
    {
        let cell = self.cell(fp);

        if bypass {
            let grade = compute().await?;
            if cell.set(grade.clone()).is_ok() {
                self.persist(fp, &grade);
            }
            return Ok(CacheOutcome::Computed(grade));
        }

        if let Some(grade) = cell.get() {
            return Ok(CacheOutcome::Hit(grade.clone()));
        }

        if let Some(grade) = self.load_persisted(fp) {
            // Another caller may have filled the cell meanwhile; either value is the same key.
            let _ = cell.set(grade.clone());
            return Ok(CacheOutcome::Hit(grade));
        }

        let mut ran = false;
        let grade = cell
            .get_or_try_init(|| {
                ran = true;
                compute()
            })
            .await?
            .clone();

        if ran {
            self.persist(fp, &grade);
            Ok(CacheOutcome::Computed(grade))
        } else {
            Ok(CacheOutcome::Hit(grade))
        }
    }
}

//! On-disk persistence of assembled sparse matrices.
//!
//! Artifacts are stored as `<root>/<key>/<artifact>.bin`,
//! where the key describes the discretization deterministically.
//! The presence of the file is the only cache-hit signal.
//!
//! Keys and artifact names are escaped one-to-one into file names:
//! ASCII letters, digits, `-`, `_` and `.` are kept
//! and every other byte becomes `%XX`,
//! so distinct names never share a file.

use nalgebra_sparse as nas;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::operator::{MatrixOperator, Operator};

/// Failure to read or write a cached artifact.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// A key or artifact name that can't name a file inside the cache.
    #[error("Invalid cache name {0:?}")]
    InvalidName(String),
    /// Filesystem access failed.
    #[error("Cache I/O failed at {path:?}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },
    /// A matrix could not be serialized or deserialized.
    #[error("Cannot (de)serialize artifact {artifact:?} of key {key:?}: {source}")]
    Serialization {
        /// Cache key.
        key: String,
        /// Artifact name.
        artifact: String,
        /// The underlying failure.
        #[source]
        source: bincode::Error,
    },
    /// The stored data is not a valid CSR matrix.
    #[error("Artifact {artifact:?} of key {key:?} is not a valid CSR matrix: {source}")]
    Corrupt {
        /// Cache key.
        key: String,
        /// Artifact name.
        artifact: String,
        /// What was wrong with it.
        #[source]
        source: nas::SparseFormatError,
    },
    /// The stored matrix does not have the shape its consumer expects.
    #[error("Artifact {artifact:?} of key {key:?} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Cache key.
        key: String,
        /// Artifact name.
        artifact: String,
        /// Shape required by the caller.
        expected: (usize, usize),
        /// Shape found on disk or returned by the builder.
        found: (usize, usize),
    },
}

/// Serialized form of a CSR matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct StoredCsr {
    nrows: usize,
    ncols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl From<&nas::CsrMatrix<f64>> for StoredCsr {
    fn from(mat: &nas::CsrMatrix<f64>) -> Self {
        Self {
            nrows: mat.nrows(),
            ncols: mat.ncols(),
            row_offsets: mat.row_offsets().to_vec(),
            col_indices: mat.col_indices().to_vec(),
            values: mat.values().to_vec(),
        }
    }
}

impl TryFrom<StoredCsr> for nas::CsrMatrix<f64> {
    type Error = nas::SparseFormatError;

    fn try_from(stored: StoredCsr) -> Result<Self, Self::Error> {
        nas::CsrMatrix::try_from_csr_data(
            stored.nrows,
            stored.ncols,
            stored.row_offsets,
            stored.col_indices,
            stored.values,
        )
    }
}

// distinguishes temporary files written concurrently from one process
static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A directory of cached sparse matrices.
#[derive(Clone, Debug)]
pub struct OperatorCache {
    root: PathBuf,
}

impl OperatorCache {
    /// Use (and create if needed) the given directory as the cache root.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CacheError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The cache root directory.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an artifact file.
    pub fn path(&self, key: &str, artifact: &str) -> Result<PathBuf, CacheError> {
        Ok(self
            .root
            .join(escape(key)?)
            .join(format!("{}.bin", escape(artifact)?)))
    }

    /// Whether an artifact is stored.
    /// Always false for invalid names.
    pub fn contains(&self, key: &str, artifact: &str) -> bool {
        self.path(key, artifact).map_or(false, |path| path.is_file())
    }

    /// Load an artifact if it's stored,
    /// otherwise build it with `builder` and store the result.
    ///
    /// A stored matrix whose shape differs from `expected_shape` is an error;
    /// the builder is never called in that case.
    /// A built matrix of the wrong shape is an error too and is not stored.
    pub fn load_or_build<E>(
        &self,
        key: &str,
        artifact: &str,
        expected_shape: (usize, usize),
        builder: impl FnOnce() -> Result<MatrixOperator, E>,
    ) -> Result<MatrixOperator, E>
    where
        E: From<CacheError>,
    {
        if let Some(mat) = self.load(key, artifact)? {
            if mat.shape() != expected_shape {
                return Err(CacheError::ShapeMismatch {
                    key: key.to_string(),
                    artifact: artifact.to_string(),
                    expected: expected_shape,
                    found: mat.shape(),
                }
                .into());
            }
            log::debug!("Cache hit: {key}/{artifact}");
            return Ok(mat);
        }

        log::info!("Cache miss: building {key}/{artifact}");
        let mat = builder()?;
        if mat.shape() != expected_shape {
            return Err(CacheError::ShapeMismatch {
                key: key.to_string(),
                artifact: artifact.to_string(),
                expected: expected_shape,
                found: mat.shape(),
            }
            .into());
        }
        self.store(key, artifact, &mat)?;
        Ok(mat)
    }

    /// Load an artifact, or `None` if it isn't stored.
    pub fn load(&self, key: &str, artifact: &str) -> Result<Option<MatrixOperator>, CacheError> {
        let path = self.path(key, artifact)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let stored: StoredCsr =
            bincode::deserialize(&bytes).map_err(|source| CacheError::Serialization {
                key: key.to_string(),
                artifact: artifact.to_string(),
                source,
            })?;
        let mat = nas::CsrMatrix::try_from(stored).map_err(|source| CacheError::Corrupt {
            key: key.to_string(),
            artifact: artifact.to_string(),
            source,
        })?;
        Ok(Some(mat.into()))
    }

    /// Store an artifact, replacing any previous version atomically.
    pub fn store(&self, key: &str, artifact: &str, mat: &MatrixOperator) -> Result<(), CacheError> {
        let path = self.path(key, artifact)?;
        let dir = self.root.join(escape(key)?);
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let bytes = bincode::serialize(&StoredCsr::from(mat.csr())).map_err(|source| {
            CacheError::Serialization {
                key: key.to_string(),
                artifact: artifact.to_string(),
                source,
            }
        })?;
        // write next to the target and rename,
        // so that readers never see a partially written file
        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            escape(artifact)?,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, bytes).map_err(|source| CacheError::Io {
            path: tmp.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&tmp, &path) {
            // best effort, the rename error is the one worth reporting
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::Io { path, source });
        }
        Ok(())
    }
}

/// Escape a name into a file name, see the module docs.
fn escape(name: &str) -> Result<String, CacheError> {
    if matches!(name, "" | "." | "..") {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    Ok(escaped)
}

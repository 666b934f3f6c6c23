//! Final-stage verification of an assembled file
//!
//! Strategies are pluggable and run in order once a transfer has drained.
//! Every configured strategy that applies must pass; a strategy with nothing
//! to compare against reports `NotApplicable` and does not block completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use crate::peer::ContentId;

/// Read buffer used when hashing files from disk
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Identity the local file is expected to match.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpectedIdentity {
    pub content_id: Option<ContentId>,
    /// Hex-encoded SHA-1 of the whole file
    pub file_hash: Option<String>,
    /// Opaque content fingerprint produced by a [`ContentFingerprinter`]
    pub fingerprint: Option<String>,
}

impl ExpectedIdentity {
    pub fn with_file_hash(mut self, hash: impl Into<String>) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Result of running one strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Passed,
    Failed { reason: String },
    /// Nothing to check against for this file
    NotApplicable,
}

impl VerificationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Errors raised while verifying.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fingerprinting failed: {reason}")]
    Fingerprint { reason: String },
}

/// A pluggable check of a local file against its expected identity.
#[async_trait]
pub trait VerificationStrategy: Send + Sync {
    /// Short name used in logs and failure reasons.
    fn name(&self) -> &'static str;

    /// Checks `path` against `expected`.
    ///
    /// # Errors
    /// - `VerificationError` - The check could not be carried out
    async fn verify(
        &self,
        path: &Path,
        expected: &ExpectedIdentity,
    ) -> Result<VerificationOutcome, VerificationError>;
}

/// Hex-encoded SHA-1 of the file at `path`.
///
/// # Errors
/// - `VerificationError::Io` - File cannot be opened or read
pub async fn sha1_file_hex(path: &Path) -> Result<String, VerificationError> {
    let io_error = |source| VerificationError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await.map_err(io_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex-encoded SHA-1 of an in-memory buffer.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compares the whole-file SHA-1 with the expected hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHashVerifier;

#[async_trait]
impl VerificationStrategy for FileHashVerifier {
    fn name(&self) -> &'static str {
        "file_hash"
    }

    async fn verify(
        &self,
        path: &Path,
        expected: &ExpectedIdentity,
    ) -> Result<VerificationOutcome, VerificationError> {
        let Some(expected_hash) = expected.file_hash.as_deref() else {
            return Ok(VerificationOutcome::NotApplicable);
        };

        let actual = sha1_file_hex(path).await?;
        if actual.eq_ignore_ascii_case(expected_hash) {
            Ok(VerificationOutcome::Passed)
        } else {
            Ok(VerificationOutcome::Failed {
                reason: format!("file hash {actual} does not match expected {expected_hash}"),
            })
        }
    }
}

/// Produces a content fingerprint for a local file.
#[async_trait]
pub trait ContentFingerprinter: Send + Sync {
    async fn fingerprint(&self, path: &Path) -> Result<String, VerificationError>;
}

/// Matches the file's content fingerprint against the expected one.
#[derive(Clone)]
pub struct FingerprintVerifier {
    fingerprinter: Arc<dyn ContentFingerprinter>,
}

impl FingerprintVerifier {
    pub fn new(fingerprinter: Arc<dyn ContentFingerprinter>) -> Self {
        Self { fingerprinter }
    }
}

#[async_trait]
impl VerificationStrategy for FingerprintVerifier {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    async fn verify(
        &self,
        path: &Path,
        expected: &ExpectedIdentity,
    ) -> Result<VerificationOutcome, VerificationError> {
        let Some(expected_fingerprint) = expected.fingerprint.as_deref() else {
            return Ok(VerificationOutcome::NotApplicable);
        };

        let actual = self.fingerprinter.fingerprint(path).await?;
        if actual == expected_fingerprint {
            Ok(VerificationOutcome::Passed)
        } else {
            Ok(VerificationOutcome::Failed {
                reason: "content fingerprint mismatch".to_string(),
            })
        }
    }
}

/// Runs every strategy in order, stopping at the first failure.
///
/// Errors raised by a strategy count as a failure of that strategy. An empty
/// strategy list passes.
pub async fn run_strategies(
    strategies: &[Arc<dyn VerificationStrategy>],
    path: &Path,
    expected: &ExpectedIdentity,
) -> VerificationOutcome {
    for strategy in strategies {
        let outcome = match strategy.verify(path, expected).await {
            Ok(outcome) => outcome,
            Err(e) => VerificationOutcome::Failed {
                reason: e.to_string(),
            },
        };

        match outcome {
            VerificationOutcome::Failed { reason } => {
                tracing::warn!(
                    strategy = strategy.name(),
                    path = %path.display(),
                    "Verification failed: {reason}"
                );
                return VerificationOutcome::Failed {
                    reason: format!("{}: {reason}", strategy.name()),
                };
            }
            VerificationOutcome::NotApplicable => {
                tracing::debug!(strategy = strategy.name(), "Verification not applicable");
            }
            VerificationOutcome::Passed => {
                tracing::debug!(strategy = strategy.name(), "Verification passed");
            }
        }
    }

    VerificationOutcome::Passed
}

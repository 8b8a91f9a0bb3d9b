use tracing::instrument;

use crate::hash;
use crate::manifest;
use crate::message::VerifyRequest;
use crate::progress;
use crate::queue::WorkQueue;
use crate::summary::Summary;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Must be the algorithm the manifest was written with
    pub algorithm: hash::Algorithm,
    /// Directory that manifest paths are relative to
    pub base_dir: std::path::PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("malformed manifest line: {0}")]
    Malformed(#[from] manifest::ManifestError),
    #[error("{path:?}: file doesn't exist")]
    Missing { path: std::path::PathBuf },
    #[error("{path:?}: failed reading file: {source}")]
    Unreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "{path:?}: recorded digest has {recorded_len} hex characters, {algorithm} digests have {expected_len}; was the manifest written with another algorithm?"
    )]
    AlgorithmMismatch {
        path: std::path::PathBuf,
        algorithm: hash::Algorithm,
        recorded_len: usize,
        expected_len: usize,
    },
    #[error("{path:?}: checksum mismatch (recorded: {expected}, current: {actual})")]
    Mismatch {
        path: std::path::PathBuf,
        expected: String,
        actual: String,
    },
}

/// Recompute the digest of the file named by one manifest line and compare it with the recorded one.
///
/// Read-only: nothing is written and nothing is retried. Returns the resolved path on success.
#[instrument(skip(settings))]
pub async fn verify_entry(
    settings: &Settings,
    request: &VerifyRequest,
) -> Result<std::path::PathBuf, VerifyError> {
    let entry = manifest::ManifestEntry::parse(&request.manifest_line)?;
    let path = entry.resolve(&settings.base_dir);
    let actual = match hash::hash_file(settings.algorithm, &path).await {
        Ok(digest) => digest,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(VerifyError::Missing { path });
        }
        Err(source) => return Err(VerifyError::Unreadable { path, source }),
    };
    if entry.digest.len() != settings.algorithm.hex_len() {
        return Err(VerifyError::AlgorithmMismatch {
            path,
            algorithm: settings.algorithm,
            recorded_len: entry.digest.len(),
            expected_len: settings.algorithm.hex_len(),
        });
    }
    if actual != entry.digest {
        return Err(VerifyError::Mismatch {
            path,
            expected: entry.digest,
            actual,
        });
    }
    Ok(path)
}

/// One worker of the verification pool
pub struct ChecksumVerifier {
    queue: WorkQueue<VerifyRequest>,
    settings: Settings,
    prog_track: std::sync::Arc<progress::Progress>,
    summary: Summary,
}

impl ChecksumVerifier {
    pub fn new(
        queue: WorkQueue<VerifyRequest>,
        settings: Settings,
        prog_track: std::sync::Arc<progress::Progress>,
    ) -> Self {
        Self {
            queue,
            settings,
            prog_track,
            summary: Summary::default(),
        }
    }

    pub async fn process(
        &mut self,
        request: &VerifyRequest,
    ) -> Result<std::path::PathBuf, VerifyError> {
        let _ops_guard = self.prog_track.ops.guard();
        let result = verify_entry(&self.settings, request).await;
        match &result {
            Ok(path) => {
                tracing::info!("{:?}: checksum OK", path);
                self.prog_track.files_verified.inc();
                self.summary.files_verified += 1;
            }
            Err(error) => {
                tracing::error!("{}", error);
                self.prog_track.verify_failed.inc();
                self.summary.verify_failed += 1;
            }
        }
        result
    }

    pub async fn run(mut self) -> Summary {
        while let Some(request) = self.queue.next().await {
            let _ = self.process(&request).await;
        }
        self.summary
    }
}

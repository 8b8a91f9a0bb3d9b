use std::os::unix::fs::MetadataExt;

use anyhow::Context;
use tracing::instrument;

use crate::hash;
use crate::manifest;
use crate::message::{CopyRequest, LogAppendRequest};
use crate::progress;
use crate::queue::WorkQueue;
use crate::summary::Summary;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Copy every file, regardless of modification times
    pub full_copy: bool,
    pub algorithm: hash::Algorithm,
    /// Manifest receiving `<digest>  <path>` lines; recorded paths are relative to its directory
    pub manifest: std::path::PathBuf,
    /// CSV receiving `<path>,<digest>` lines
    pub csv: std::path::PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Copied and verified; `entry` is what gets recorded in the manifest and the CSV
    Copied {
        entry: manifest::ManifestEntry,
        bytes: u64,
    },
    /// Destination exists and is not older than the source
    Skipped,
}

/// Every way copying a single file can fail. None of these stop the worker.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("source {src:?} does not exist")]
    SourceMissing { src: std::path::PathBuf },
    #[error("failed reading source {src:?}: {source}")]
    SourceUnreadable {
        src: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source {src:?} is not a regular file ({file_type}), skipping")]
    SpecialFile {
        src: std::path::PathBuf,
        file_type: String,
    },
    #[error("{src:?} and {dst:?} are the same file, skipping")]
    SameFile {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
    #[error("failed to copy {src:?}, it won't be present in the destination: {source:#}")]
    CopyFailed {
        src: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed hashing destination {dst:?} after copy: {source}")]
    PostHashFailed {
        dst: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source and destination checksum don't match for {src:?} (source: {pre}, destination: {post})")]
    IntegrityMismatch {
        src: std::path::PathBuf,
        pre: String,
        post: String,
    },
    #[error("{dst:?} was copied and verified but cannot be recorded: {source}")]
    ManifestPath {
        dst: std::path::PathBuf,
        #[source]
        source: manifest::ManifestError,
    },
}

impl CopyError {
    /// Special and same files are expected in a tree walk and only warned about
    pub fn level(&self) -> tracing::Level {
        match self {
            CopyError::SpecialFile { .. }
            | CopyError::SameFile { .. }
            | CopyError::ManifestPath { .. } => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }
}

fn describe_file_type(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::FileTypeExt;
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        "directory"
    } else if file_type.is_fifo() {
        "named pipe"
    } else if file_type.is_socket() {
        "socket"
    } else if file_type.is_block_device() {
        "block device"
    } else if file_type.is_char_device() {
        "character device"
    } else {
        "unknown file type"
    }
    .to_string()
}

fn source_error(src: &std::path::Path, error: std::io::Error) -> CopyError {
    if error.kind() == std::io::ErrorKind::NotFound {
        CopyError::SourceMissing {
            src: src.to_owned(),
        }
    } else {
        CopyError::SourceUnreadable {
            src: src.to_owned(),
            source: error,
        }
    }
}

/// `true` if `src` was modified strictly after `dst`
pub fn is_newer(src: &std::fs::Metadata, dst: &std::fs::Metadata) -> bool {
    (src.mtime(), src.mtime_nsec()) > (dst.mtime(), dst.mtime_nsec())
}

/// Hash `dst` right after a copy and compare it against the digest taken from the source.
#[instrument]
pub async fn check_integrity(
    algorithm: hash::Algorithm,
    src: &std::path::Path,
    dst: &std::path::Path,
    digest_pre: &str,
) -> Result<String, CopyError> {
    let digest_post = hash::hash_file(algorithm, dst)
        .await
        .map_err(|source| CopyError::PostHashFailed {
            dst: dst.to_owned(),
            source,
        })?;
    if digest_post != digest_pre {
        return Err(CopyError::IntegrityMismatch {
            src: src.to_owned(),
            pre: digest_pre.to_string(),
            post: digest_post,
        });
    }
    Ok(digest_post)
}

/// Copy one file, bracketed by a hash of the source before and of the destination after.
#[instrument(skip(settings))]
pub async fn copy_file(
    settings: &Settings,
    request: &CopyRequest,
) -> Result<CopyOutcome, CopyError> {
    let src = request.src.as_path();
    let dst = request.dst.as_path();
    tracing::debug!("reading source metadata");
    let src_metadata = tokio::fs::metadata(src)
        .await
        .map_err(|error| source_error(src, error))?;
    if !src_metadata.is_file() {
        return Err(CopyError::SpecialFile {
            src: src.to_owned(),
            file_type: describe_file_type(&src_metadata),
        });
    }
    tracing::debug!("hashing source");
    let digest_pre = hash::hash_file(settings.algorithm, src)
        .await
        .map_err(|error| source_error(src, error))?;
    copy_hashed(settings, request, &src_metadata, &digest_pre).await
}

/// Second half of [`copy_file`]: copy a source whose digest was already taken, then check the
/// destination against `digest_pre`.
pub async fn copy_hashed(
    settings: &Settings,
    request: &CopyRequest,
    src_metadata: &std::fs::Metadata,
    digest_pre: &str,
) -> Result<CopyOutcome, CopyError> {
    let src = request.src.as_path();
    let dst = request.dst.as_path();
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create directory {parent:?}"))
            .map_err(|source| CopyError::CopyFailed {
                src: src.to_owned(),
                source,
            })?;
    }
    if let Ok(dst_metadata) = tokio::fs::metadata(dst).await {
        if !settings.full_copy && !is_newer(src_metadata, &dst_metadata) {
            return Ok(CopyOutcome::Skipped);
        }
        if src_metadata.dev() == dst_metadata.dev() && src_metadata.ino() == dst_metadata.ino() {
            return Err(CopyError::SameFile {
                src: src.to_owned(),
                dst: dst.to_owned(),
            });
        }
    }
    tracing::debug!("copying data");
    let bytes = tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("failed copying {src:?} to {dst:?}"))
        .map_err(|source| CopyError::CopyFailed {
            src: src.to_owned(),
            source,
        })?;
    tracing::debug!("hashing destination");
    let digest_post = check_integrity(settings.algorithm, src, dst, digest_pre).await?;
    let relative = manifest::relative_path(dst, &manifest::base_dir(&settings.manifest));
    let entry = manifest::ManifestEntry::new(&digest_post, &relative).map_err(|source| {
        CopyError::ManifestPath {
            dst: dst.to_owned(),
            source,
        }
    })?;
    Ok(CopyOutcome::Copied { entry, bytes })
}

/// One worker of the copy pool
pub struct FileCopier {
    queue: WorkQueue<CopyRequest>,
    log_sender: async_channel::Sender<LogAppendRequest>,
    settings: Settings,
    prog_track: std::sync::Arc<progress::Progress>,
    summary: Summary,
}

impl FileCopier {
    pub fn new(
        queue: WorkQueue<CopyRequest>,
        log_sender: async_channel::Sender<LogAppendRequest>,
        settings: Settings,
        prog_track: std::sync::Arc<progress::Progress>,
    ) -> Self {
        Self {
            queue,
            log_sender,
            settings,
            prog_track,
            summary: Summary::default(),
        }
    }

    async fn record(&mut self, entry: &manifest::ManifestEntry) {
        let requests = [
            LogAppendRequest::new(&self.settings.manifest, entry.manifest_line()),
            LogAppendRequest::new(&self.settings.csv, entry.csv_line()),
        ];
        for request in requests {
            if let Err(error) = self.log_sender.send(request).await {
                tracing::error!("log writer is gone, dropping {:?}", &error.0.text);
                self.summary.log_write_failures += 1;
            }
        }
    }

    /// Copy one file, log the outcome and queue its manifest and CSV lines.
    pub async fn process(&mut self, request: &CopyRequest) -> Result<CopyOutcome, CopyError> {
        let prog_track = self.prog_track.clone();
        let _ops_guard = prog_track.ops.guard();
        let result = copy_file(&self.settings, request).await;
        self.report(request, result).await
    }

    /// Log and count the outcome of one request; only a successful copy is recorded.
    async fn report(
        &mut self,
        request: &CopyRequest,
        result: Result<CopyOutcome, CopyError>,
    ) -> Result<CopyOutcome, CopyError> {
        match &result {
            Ok(CopyOutcome::Copied { entry, bytes }) => {
                tracing::info!("file {:?} copied successfully", &request.src);
                self.prog_track.files_copied.inc();
                self.prog_track.bytes_copied.add(*bytes);
                self.summary.files_copied += 1;
                self.summary.bytes_copied += bytes;
                self.record(entry).await;
            }
            Ok(CopyOutcome::Skipped) => {
                tracing::info!(
                    "file {:?} skipped, destination {:?} is newer",
                    &request.src,
                    &request.dst
                );
                self.prog_track.files_skipped.inc();
                self.summary.files_skipped += 1;
            }
            Err(error) => {
                if error.level() == tracing::Level::WARN {
                    tracing::warn!("{}", error);
                } else {
                    tracing::error!("{}", error);
                }
                self.prog_track.files_failed.inc();
                self.summary.files_failed += 1;
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

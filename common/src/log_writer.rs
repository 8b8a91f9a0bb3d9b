//! Single writer for the append-only output files (manifest and CSV).
//!
//! All appends to a given file go through one [`LogWriter`], so lines from concurrent copy workers
//! are never interleaved. Each target is opened once, on its first request, and kept open until the
//! writer stops; the handles are flushed, synced and closed exactly once, after the queue drained.

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::message::LogAppendRequest;
use crate::progress;
use crate::queue::WorkQueue;
use crate::summary::Summary;

/// Open append-mode handles keyed by target path, owned by exactly one writer
#[derive(Debug, Default)]
pub struct HandleCache {
    handles: std::collections::HashMap<std::path::PathBuf, tokio::fs::File>,
}

impl HandleCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    async fn get_or_open(
        &mut self,
        target: &std::path::Path,
    ) -> anyhow::Result<&mut tokio::fs::File> {
        match self.handles.entry(target.to_owned()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                tracing::debug!("opening {:?} for appending", target);
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(target)
                    .await
                    .with_context(|| format!("failed to open {target:?} for appending"))?;
                Ok(entry.insert(file))
            }
        }
    }

    /// Append `text` verbatim to `target`, opening it on first use
    pub async fn append(&mut self, target: &std::path::Path, text: &str) -> anyhow::Result<()> {
        let file = self.get_or_open(target).await?;
        file.write_all(text.as_bytes())
            .await
            .with_context(|| format!("failed to append to {target:?}"))?;
        // tokio completes file writes in the background, flush to surface errors per line
        file.flush()
            .await
            .with_context(|| format!("failed to append to {target:?}"))?;
        Ok(())
    }

    /// Flush, sync and close every handle. Returns the number of handles that failed to close cleanly.
    pub async fn close_all(&mut self) -> usize {
        let mut failures = 0;
        for (path, mut file) in self.handles.drain() {
            if let Err(error) = flush_and_sync(&mut file).await {
                tracing::warn!("failed to close {:?}: {}", &path, &error);
                failures += 1;
            } else {
                tracing::debug!("closed {:?}", &path);
            }
        }
        failures
    }
}

async fn flush_and_sync(file: &mut tokio::fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

pub struct LogWriter {
    queue: WorkQueue<LogAppendRequest>,
    handles: HandleCache,
    prog_track: std::sync::Arc<progress::Progress>,
}

impl LogWriter {
    pub fn new(
        queue: WorkQueue<LogAppendRequest>,
        prog_track: std::sync::Arc<progress::Progress>,
    ) -> Self {
        Self {
            queue,
            handles: HandleCache::new(),
            prog_track,
        }
    }

    /// Best-effort append: failures are logged and counted, never retried.
    #[instrument(skip_all, fields(file = ?request.target))]
    async fn process(&mut self, request: &LogAppendRequest) -> bool {
        match self.handles.append(&request.target, &request.text).await {
            Ok(()) => {
                self.prog_track.lines_written.inc();
                true
            }
            Err(error) => {
                tracing::warn!("dropping line for {:?}: {:#}", &request.target, &error);
                false
            }
        }
    }

    /// Serve the queue until STOPPED, then close all handles
    pub async fn run(mut self) -> Summary {
        let mut summary = Summary::default();
        while let Some(request) = self.queue.next().await {
            if self.process(&request).await {
                summary.lines_written += 1;
            } else {
                summary.log_write_failures += 1;
            }
        }
        tracing::debug!("log writer stopping, closing {} files", self.handles.len());
        summary.log_write_failures += self.handles.close_all().await;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use anyhow::Result;
    use tokio_util::sync::CancellationToken;

    fn spawn_writer(
        receiver: async_channel::Receiver<LogAppendRequest>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<Summary> {
        let writer = LogWriter::new(
            WorkQueue::new(receiver, stop),
            std::sync::Arc::new(progress::Progress::new()),
        );
        tokio::spawn(writer.run())
    }

    #[tokio::test]
    async fn appends_verbatim_to_several_files() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let manifest = tmp_dir.join("checksum.sha3-512");
        let csv = tmp_dir.join("checksum.csv");
        let (sender, receiver) = async_channel::unbounded();
        let writer = spawn_writer(receiver, CancellationToken::new());
        sender.send(LogAppendRequest::new(&manifest, "aa  a.txt\n")).await?;
        sender.send(LogAppendRequest::new(&csv, "a.txt,aa\n")).await?;
        sender.send(LogAppendRequest::new(&manifest, "bb  b.txt\n")).await?;
        // no newline added by the writer
        sender.send(LogAppendRequest::new(&csv, "partial")).await?;
        drop(sender);
        let summary = writer.await?;
        assert_eq!(summary.lines_written, 4);
        assert_eq!(summary.log_write_failures, 0);
        assert_eq!(
            tokio::fs::read_to_string(&manifest).await?,
            "aa  a.txt\nbb  b.txt\n"
        );
        assert_eq!(tokio::fs::read_to_string(&csv).await?, "a.txt,aa\npartial");
        Ok(())
    }

    #[tokio::test]
    async fn appends_to_existing_content() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let manifest = tmp_dir.join("manifest");
        tokio::fs::write(&manifest, "00  old.txt\n").await?;
        let mut handles = HandleCache::new();
        handles.append(&manifest, "11  new.txt\n").await?;
        assert_eq!(handles.close_all().await, 0);
        assert_eq!(
            tokio::fs::read_to_string(&manifest).await?,
            "00  old.txt\n11  new.txt\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn handle_is_opened_once_and_reused() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let target = tmp_dir.join("manifest");
        let moved = tmp_dir.join("moved");
        let mut handles = HandleCache::new();
        handles.append(&target, "first\n").await?;
        assert_eq!(handles.len(), 1);
        // the cached handle follows the inode, a re-open would recreate `target`
        tokio::fs::rename(&target, &moved).await?;
        handles.append(&target, "second\n").await?;
        assert_eq!(handles.len(), 1);
        assert_eq!(handles.close_all().await, 0);
        assert!(handles.is_empty());
        assert!(!target.exists());
        assert_eq!(tokio::fs::read_to_string(&moved).await?, "first\nsecond\n");
        Ok(())
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let bad_target = tmp_dir.join("no-such-dir").join("manifest");
        let good_target = tmp_dir.join("manifest");
        let (sender, receiver) = async_channel::unbounded();
        let writer = spawn_writer(receiver, CancellationToken::new());
        sender.send(LogAppendRequest::new(&bad_target, "lost\n")).await?;
        sender.send(LogAppendRequest::new(&good_target, "kept\n")).await?;
        drop(sender);
        let summary = writer.await?;
        assert_eq!(summary.log_write_failures, 1);
        assert_eq!(summary.lines_written, 1);
        assert_eq!(tokio::fs::read_to_string(&good_target).await?, "kept\n");
        Ok(())
    }

    #[tokio::test]
    async fn stop_signal_drains_pending_lines() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let target = tmp_dir.join("manifest");
        let (sender, receiver) = async_channel::unbounded();
        for i in 0..50 {
            sender
                .send(LogAppendRequest::new(&target, format!("line {i}\n")))
                .await?;
        }
        let stop = CancellationToken::new();
        stop.cancel();
        // the sender is still open, only the stop signal ends the writer
        let summary = spawn_writer(receiver, stop).await?;
        assert_eq!(summary.lines_written, 50);
        let content = tokio::fs::read_to_string(&target).await?;
        let expected: String = (0..50).map(|i| format!("line {i}\n")).collect();
        assert_eq!(content, expected);
        drop(sender);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_never_interleave() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let target = tmp_dir.join("manifest");
        let (sender, receiver) = async_channel::bounded(16);
        let writer = spawn_writer(receiver, CancellationToken::new());
        let mut producers = tokio::task::JoinSet::new();
        for producer in 0..8 {
            let sender = sender.clone();
            let target = target.clone();
            producers.spawn(async move {
                for i in 0..200 {
                    let digest = format!("{:0>128}", format!("{producer}{i}"));
                    let line = format!("{digest}  dir{producer}/file{i}.txt\n");
                    sender.send(LogAppendRequest::new(&target, line)).await?;
                }
                anyhow::Ok(())
            });
        }
        drop(sender);
        while let Some(res) = producers.join_next().await {
            res??;
        }
        let summary = writer.await?;
        assert_eq!(summary.lines_written, 1600);
        let content = tokio::fs::read_to_string(&target).await?;
        let mut lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 1600);
        for line in &lines {
            let entry = crate::manifest::ManifestEntry::parse(line)?;
            assert_eq!(entry.digest.len(), 128);
            assert!(entry.path.starts_with("dir"));
        }
        lines.sort_unstable();
        lines.dedup();
        assert_eq!(lines.len(), 1600);
        Ok(())
    }
}

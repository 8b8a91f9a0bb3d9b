//! Wiring of the worker pools.
//!
//! A copy run has a pool of [`FileCopier`]s fed from one queue, plus a single [`LogWriter`] that
//! serializes their manifest and CSV lines. A verify run has a pool of [`ChecksumVerifier`]s.
//!
//! Shutdown: the stop token is shared by the workers of a pool, which drain their queue once it
//! fires. The log writer has its own token that is only cancelled after every copier has been
//! joined, so a line queued by the last copy is still written.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::copy::{self, FileCopier};
use crate::log_writer::LogWriter;
use crate::message::{CopyRequest, LogAppendRequest, VerifyRequest};
use crate::progress;
use crate::queue::WorkQueue;
use crate::summary::Summary;
use crate::verify::{self, ChecksumVerifier};

/// Producer side of a pool's queue, cloneable so the enumeration can hand it around.
#[derive(Debug, Clone)]
pub struct Submitter<T> {
    requests: async_channel::Sender<T>,
    stop: CancellationToken,
}

impl<T> Submitter<T> {
    /// Queue one request. Returns `false` if the stop signal was already raised, in which case the
    /// request is dropped.
    pub async fn submit(&self, request: T) -> Result<bool> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Ok(false),
            res = self.requests.send(request) => {
                res.map_err(|_| anyhow::anyhow!("work queue closed unexpectedly"))?;
                Ok(true)
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

pub struct CopyPipeline {
    requests: Submitter<CopyRequest>,
    // kept to serve anything enqueued after the copiers stopped
    leftovers: async_channel::Receiver<CopyRequest>,
    log_sender: async_channel::Sender<LogAppendRequest>,
    copiers: tokio::task::JoinSet<Summary>,
    writer: tokio::task::JoinHandle<Summary>,
    writer_stop: CancellationToken,
    settings: copy::Settings,
    prog_track: std::sync::Arc<progress::Progress>,
}

impl CopyPipeline {
    /// Spawn the log writer and the copy workers. Must be called from within a tokio runtime.
    pub fn start(
        config: &PipelineConfig,
        settings: copy::Settings,
        stop: CancellationToken,
        prog_track: std::sync::Arc<progress::Progress>,
    ) -> Self {
        let (requests, work_receiver) = config.channel();
        let (log_sender, log_receiver) = async_channel::unbounded();
        let writer_stop = CancellationToken::new();
        let writer = LogWriter::new(
            WorkQueue::new(log_receiver, writer_stop.clone()),
            prog_track.clone(),
        );
        let writer = tokio::spawn(writer.run());
        let mut copiers = tokio::task::JoinSet::new();
        let workers = config.copy_workers();
        for _ in 0..workers {
            let copier = FileCopier::new(
                WorkQueue::new(work_receiver.clone(), stop.clone()),
                log_sender.clone(),
                settings.clone(),
                prog_track.clone(),
            );
            copiers.spawn(copier.run());
        }
        tracing::debug!("started {} copy workers", workers);
        Self {
            requests: Submitter { requests, stop },
            leftovers: work_receiver,
            log_sender,
            copiers,
            writer,
            writer_stop,
            settings,
            prog_track,
        }
    }

    /// Queue one file for copying, see [`Submitter::submit`]
    pub async fn submit(&self, request: CopyRequest) -> Result<bool> {
        self.requests.submit(request).await
    }

    pub fn submitter(&self) -> Submitter<CopyRequest> {
        self.requests.clone()
    }

    /// Close the queue, wait for the copiers to finish, then stop the log writer.
    pub async fn finish(mut self) -> Result<Summary> {
        self.requests.requests.close();
        let mut summary = Summary::default();
        while let Some(res) = self.copiers.join_next().await {
            summary += res?;
        }
        if !self.leftovers.is_empty() {
            tracing::debug!(
                "{} copy requests were queued after the workers stopped",
                self.leftovers.len()
            );
            let straggler = FileCopier::new(
                WorkQueue::new(self.leftovers.clone(), CancellationToken::new()),
                self.log_sender.clone(),
                self.settings.clone(),
                self.prog_track.clone(),
            );
            summary += straggler.run().await;
        }
        drop(self.log_sender);
        self.writer_stop.cancel();
        summary += self.writer.await?;
        Ok(summary)
    }
}

pub struct VerifyPipeline {
    requests: Submitter<VerifyRequest>,
    leftovers: async_channel::Receiver<VerifyRequest>,
    verifiers: tokio::task::JoinSet<Summary>,
    settings: verify::Settings,
    prog_track: std::sync::Arc<progress::Progress>,
}

impl VerifyPipeline {
    pub fn start(
        config: &PipelineConfig,
        settings: verify::Settings,
        stop: CancellationToken,
        prog_track: std::sync::Arc<progress::Progress>,
    ) -> Self {
        let (requests, work_receiver) = config.channel();
        let mut verifiers = tokio::task::JoinSet::new();
        let workers = config.verify_workers();
        for _ in 0..workers {
            let verifier = ChecksumVerifier::new(
                WorkQueue::new(work_receiver.clone(), stop.clone()),
                settings.clone(),
                prog_track.clone(),
            );
            verifiers.spawn(verifier.run());
        }
        tracing::debug!("started {} verify workers", workers);
        Self {
            requests: Submitter { requests, stop },
            leftovers: work_receiver,
            verifiers,
            settings,
            prog_track,
        }
    }

    pub async fn submit(&self, request: VerifyRequest) -> Result<bool> {
        self.requests.submit(request).await
    }

    pub fn submitter(&self) -> Submitter<VerifyRequest> {
        self.requests.clone()
    }

    pub async fn finish(mut self) -> Result<Summary> {
        self.requests.requests.close();
        let mut summary = Summary::default();
        while let Some(res) = self.verifiers.join_next().await {
            summary += res?;
        }
        if !self.leftovers.is_empty() {
            let straggler = ChecksumVerifier::new(
                WorkQueue::new(self.leftovers.clone(), CancellationToken::new()),
                self.settings.clone(),
                self.prog_track.clone(),
            );
            summary += straggler.run().await;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_bytes, Algorithm};
    use crate::testutils;
    use tracing_test::traced_test;

    fn copy_settings(dst_root: &std::path::Path) -> copy::Settings {
        copy::Settings {
            full_copy: false,
            algorithm: Algorithm::Sha3_512,
            manifest: dst_root.join("checksum.sha3-512"),
            csv: dst_root.join("checksum.csv"),
        }
    }

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig {
            copy_workers: workers,
            verify_workers: workers,
            queue_capacity: 0,
        }
    }

    async fn copy_tree(
        src: &std::path::Path,
        dst: &std::path::Path,
        names: &[&str],
    ) -> Result<Summary> {
        let pipeline = CopyPipeline::start(
            &config(3),
            copy_settings(dst),
            CancellationToken::new(),
            std::sync::Arc::new(progress::Progress::new()),
        );
        for name in names {
            assert!(pipeline.submit(CopyRequest::new(src.join(name), dst.join(name))).await?);
        }
        pipeline.finish().await
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_records_manifest_and_csv() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::write(src.join("a.txt"), "X").await?;
        let summary = copy_tree(&src, &dst, &["a.txt"]).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.lines_written, 2);
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "X");
        let digest = hash_bytes(Algorithm::Sha3_512, b"X");
        assert_eq!(
            tokio::fs::read_to_string(dst.join("checksum.sha3-512")).await?,
            format!("{digest}  a.txt\n")
        );
        assert_eq!(
            tokio::fs::read_to_string(dst.join("checksum.csv")).await?,
            format!("a.txt,{digest}\n")
        );
        assert!(logs_contain("copied successfully"));
        Ok(())
    }

    #[tokio::test]
    async fn rerun_with_newer_destination_adds_nothing() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        let names = ["0.txt", "bar/1.txt", "bar/2.txt", "baz/qux/3.txt"];
        let first = copy_tree(&src, &dst, &names).await?;
        assert_eq!(first.files_copied, 4);
        let manifest = tokio::fs::read_to_string(dst.join("checksum.sha3-512")).await?;
        let csv = tokio::fs::read_to_string(dst.join("checksum.csv")).await?;
        for name in names {
            testutils::shift_mtime(&dst.join(name), 10)?;
        }
        let second = copy_tree(&src, &dst, &names).await?;
        assert_eq!(second.files_copied, 0);
        assert_eq!(second.files_skipped, 4);
        assert_eq!(second.lines_written, 0);
        assert_eq!(
            tokio::fs::read_to_string(dst.join("checksum.sha3-512")).await?,
            manifest
        );
        assert_eq!(tokio::fs::read_to_string(dst.join("checksum.csv")).await?, csv);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn written_manifest_verifies() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        let names = ["0.txt", "bar/1.txt", "bar/2.txt", "baz/qux/3.txt"];
        copy_tree(&src, &dst, &names).await?;
        let manifest = tokio::fs::read_to_string(dst.join("checksum.sha3-512")).await?;
        let pipeline = VerifyPipeline::start(
            &config(2),
            verify::Settings {
                algorithm: Algorithm::Sha3_512,
                base_dir: dst.clone(),
            },
            CancellationToken::new(),
            std::sync::Arc::new(progress::Progress::new()),
        );
        for line in manifest.lines() {
            pipeline.submit(VerifyRequest::new(line)).await?;
        }
        let summary = pipeline.finish().await?;
        assert_eq!(summary.files_verified, 4);
        assert_eq!(summary.verify_failed, 0);
        assert!(logs_contain("checksum OK"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_signal_still_processes_queued_requests() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&src).await?;
        let mut names = vec![];
        for i in 0..40 {
            let name = format!("{i}.txt");
            tokio::fs::write(src.join(&name), format!("content {i}")).await?;
            names.push(name);
        }
        let stop = CancellationToken::new();
        let pipeline = CopyPipeline::start(
            &config(4),
            copy_settings(&dst),
            stop.clone(),
            std::sync::Arc::new(progress::Progress::new()),
        );
        for name in &names {
            pipeline
                .submit(CopyRequest::new(src.join(name), dst.join(name)))
                .await?;
        }
        stop.cancel();
        // refused once the stop signal is raised
        assert!(!pipeline
            .submit(CopyRequest::new(src.join("0.txt"), dst.join("extra.txt")))
            .await?);
        let summary = pipeline.finish().await?;
        assert_eq!(summary.files_copied, 40);
        assert_eq!(summary.lines_written, 80);
        assert!(!dst.join("extra.txt").exists());
        let manifest = tokio::fs::read_to_string(dst.join("checksum.sha3-512")).await?;
        assert_eq!(manifest.lines().count(), 40);
        let csv = tokio::fs::read_to_string(dst.join("checksum.csv")).await?;
        assert_eq!(csv.lines().count(), 40);
        Ok(())
    }

    #[tokio::test]
    async fn pre_cancelled_verify_pipeline_drains() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        tokio::fs::write(tmp_dir.join("a.txt"), "X").await?;
        let stop = CancellationToken::new();
        let pipeline = VerifyPipeline::start(
            &config(2),
            verify::Settings {
                algorithm: Algorithm::Sha3_512,
                base_dir: tmp_dir.clone(),
            },
            stop.clone(),
            std::sync::Arc::new(progress::Progress::new()),
        );
        let line = format!("{}  a.txt", hash_bytes(Algorithm::Sha3_512, b"X"));
        for _ in 0..5 {
            pipeline.submit(VerifyRequest::new(line.clone())).await?;
        }
        pipeline.submit(VerifyRequest::new("00  missing.txt")).await?;
        stop.cancel();
        let summary = pipeline.finish().await?;
        assert_eq!(summary.files_verified, 5);
        assert_eq!(summary.verify_failed, 1);
        Ok(())
    }
}

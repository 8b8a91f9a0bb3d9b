//! Verified file copies and checksum manifests.
//!
//! The library is built around three kinds of workers, each fed by its own queue:
//!
//! - [`copy::FileCopier`] copies one file at a time, hashing the source before and the destination
//!   after the copy, and hands the resulting manifest and CSV lines to the log writer
//! - [`verify::ChecksumVerifier`] re-hashes the file named by one manifest line and compares it
//!   with the recorded digest
//! - [`log_writer::LogWriter`] is the only task writing to the manifest and CSV files
//!
//! [`pipeline`] wires the pools together and implements the shutdown order: workers drain their
//! queues once the stop signal is raised, and the log writer is stopped only after all copiers are
//! done.
//!
//! # Manifest format
//!
//! One `<hex digest>  <path>` line per copied file (two spaces, compatible with `sha512sum -c`),
//! with paths relative to the directory holding the manifest. The CSV file gets a `<path>,<digest>`
//! line for the same entry.
//!
//! # Logging
//!
//! Everything is reported through `tracing`; [`run`] installs the subscriber. Per-item failures are
//! logged and counted in the [`Summary`], they never abort a run.

#[cfg(test)]
mod testutils;

pub mod config;
pub mod copy;
pub mod hash;
pub mod log_writer;
pub mod manifest;
pub mod message;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod summary;
pub mod verify;

pub use config::{OutputConfig, PipelineConfig, RuntimeConfig};
pub use hash::Algorithm;
pub use message::{CopyRequest, LogAppendRequest, VerifyRequest};
pub use pipeline::{CopyPipeline, VerifyPipeline};
pub use summary::Summary;

use anyhow::Context;

/// Periodic progress reports on stderr
#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    /// Human readable delay between reports, e.g. "500ms" or "10s" (default: 10s)
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    pub fn delay(&self) -> anyhow::Result<std::time::Duration> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("invalid progress delay {delay:?}")),
            None => Ok(std::time::Duration::from_secs(10)),
        }
    }
}

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let filter = if output.quiet {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        let level = match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let res = match &output.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {path:?}"))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    res.map_err(|error| anyhow::anyhow!("failed to initialize logging: {error}"))
}

async fn print_progress(
    delay: std::time::Duration,
    prog_track: std::sync::Arc<progress::Progress>,
    stop: tokio_util::sync::CancellationToken,
) {
    let mut printer = progress::ProgressPrinter::new(&prog_track);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        eprintln!("{}", printer.print());
    }
}

/// Set up logging and the tokio runtime, then run `func` to completion.
///
/// Returns `None` if `func` failed; the error has been logged already.
pub fn run<Fut>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce(std::sync::Arc<progress::Progress>) -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = init_tracing(&output) {
        eprintln!("{error:#}");
        return None;
    }
    let progress_delay = match progress.as_ref().map(ProgressSettings::delay).transpose() {
        Ok(delay) => delay,
        Err(error) => {
            tracing::error!("{:#}", error);
            return None;
        }
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {}", error);
            return None;
        }
    };
    let prog_track = std::sync::Arc::new(progress::Progress::new());
    let res = tokio_runtime.block_on(async {
        let printer_stop = tokio_util::sync::CancellationToken::new();
        let printer = progress_delay.map(|delay| {
            tokio::spawn(print_progress(
                delay,
                prog_track.clone(),
                printer_stop.clone(),
            ))
        });
        let res = func(prog_track.clone()).await;
        printer_stop.cancel();
        if let Some(printer) = printer {
            let _ = printer.await;
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}

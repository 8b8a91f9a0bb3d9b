use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

mod walk;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "copytool",
    version,
    about = "Copy files with checksum verification and keep a manifest of what was copied",
    long_about = "`copytool` copies a file tree, hashing every file before and after the copy, and records each
verified file in a manifest (`<digest>  <path>`, readable by `sha512sum -c` style tools) and a CSV
file (`<path>,<digest>`). The manifest can later be used to verify the copied files.

EXAMPLE:
    # Copy a directory, only updating outdated files
    copytool copy /data/src /backup/dst --summary

    # Check the copied files against the manifest written by the copy
    copytool verify /backup/dst/checksum.sha3-512 -v"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Show progress
    #[arg(long, global = true, help_heading = "Progress & output")]
    progress: bool,

    /// Sets the delay between progress updates (default: 10s)
    ///
    /// If specified, --progress flag is implied. Accepts a human readable duration, e.g. "500ms",
    /// "10s", "5min" etc.
    #[arg(
        long,
        global = true,
        value_name = "DELAY",
        help_heading = "Progress & output"
    )]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    /// Write log messages to this file instead of stderr
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help_heading = "Progress & output"
    )]
    log_file: Option<std::path::PathBuf>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    ///
    /// All hashing runs on blocking threads.
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Capacity of the work queues, 0 means unbounded
    #[arg(
        long,
        global = true,
        default_value = "1024",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    queue_capacity: usize,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Command {
    /// Copy SRC to DST, verifying every file and recording it in the manifest
    Copy(CopyArgs),
    /// Check the files listed in a manifest against their recorded checksums
    Verify(VerifyArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct CopyArgs {
    /// Copy every file, even if the destination is newer than the source
    #[arg(long, help_heading = "Copy options")]
    full: bool,

    /// Checksum algorithm
    #[arg(long, value_enum, default_value_t = common::Algorithm::default(), help_heading = "Copy options")]
    algorithm: common::Algorithm,

    /// Manifest receiving `<digest>  <path>` lines (default: <DST>/checksum.<ALGORITHM>)
    ///
    /// Recorded paths are relative to the directory holding the manifest. The file is appended to,
    /// entries from previous runs are kept.
    #[arg(long, value_name = "PATH", help_heading = "Copy options")]
    manifest: Option<std::path::PathBuf>,

    /// CSV file receiving `<path>,<digest>` lines (default: <DST>/checksum.csv)
    #[arg(long, value_name = "PATH", help_heading = "Copy options")]
    csv: Option<std::path::PathBuf>,

    /// Verify the manifest entries added by this copy once it is done
    #[arg(long, help_heading = "Copy options")]
    verify_after: bool,

    /// Number of copy workers, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    copy_workers: usize,

    /// Number of verification workers used with --verify-after, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    verify_workers: usize,

    /// Source file or directory
    #[arg()]
    src: std::path::PathBuf,

    /// Destination path
    #[arg()]
    dst: std::path::PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
struct VerifyArgs {
    /// Checksum algorithm the manifest was written with
    #[arg(long, value_enum, default_value_t = common::Algorithm::default(), help_heading = "Verify options")]
    algorithm: common::Algorithm,

    /// Number of verification workers, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    verify_workers: usize,

    /// Manifest to verify; recorded paths are resolved relative to its directory
    #[arg()]
    manifest: std::path::PathBuf,
}

/// Absolute path with `.` and `..` folded away, so recorded relative paths never walk through them
fn absolute(path: &std::path::Path) -> Result<std::path::PathBuf> {
    let path = std::path::absolute(path).with_context(|| format!("cannot resolve path {path:?}"))?;
    Ok(common::manifest::normalize(&path))
}

/// Current size of `path`, 0 if it doesn't exist yet
async fn file_len(path: &std::path::Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}

/// Queue every line of `manifest` past its first `offset` bytes for verification
async fn replay_manifest(
    manifest: &std::path::Path,
    offset: u64,
    algorithm: common::Algorithm,
    config: &common::PipelineConfig,
    stop: tokio_util::sync::CancellationToken,
    prog_track: std::sync::Arc<common::progress::Progress>,
) -> Result<common::Summary> {
    let mut bytes = tokio::fs::read(manifest)
        .await
        .with_context(|| format!("cannot read manifest {manifest:?}"))?;
    let offset = usize::try_from(offset)
        .unwrap_or(usize::MAX)
        .min(bytes.len());
    let content = String::from_utf8(bytes.split_off(offset))
        .with_context(|| format!("manifest {manifest:?} is not valid UTF-8"))?;
    let settings = common::verify::Settings {
        algorithm,
        base_dir: common::manifest::base_dir(manifest),
    };
    let pipeline = common::VerifyPipeline::start(config, settings, stop, prog_track);
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        if !pipeline.submit(common::VerifyRequest::new(line)).await? {
            tracing::warn!("stop requested, not verifying the rest of {:?}", manifest);
            break;
        }
    }
    pipeline.finish().await
}

async fn copy_main(
    args: &CopyArgs,
    queue_capacity: usize,
    stop: tokio_util::sync::CancellationToken,
    prog_track: std::sync::Arc<common::progress::Progress>,
) -> Result<common::Summary> {
    let config = common::PipelineConfig {
        copy_workers: args.copy_workers,
        verify_workers: args.verify_workers,
        queue_capacity,
    };
    let src = absolute(&args.src)?;
    let dst = absolute(&args.dst)?;
    let src_metadata = tokio::fs::metadata(&src)
        .await
        .with_context(|| format!("cannot read source {src:?}"))?;
    let dst_is_dir = tokio::fs::metadata(&dst)
        .await
        .is_ok_and(|metadata| metadata.is_dir());
    // directory the default output files go to
    let dst_root = if src_metadata.is_dir() || dst_is_dir {
        dst.clone()
    } else {
        common::manifest::base_dir(&dst)
    };
    let manifest = match &args.manifest {
        Some(path) => absolute(path)?,
        None => dst_root.join(format!("checksum.{}", args.algorithm)),
    };
    let csv = match &args.csv {
        Some(path) => absolute(path)?,
        None => dst_root.join("checksum.csv"),
    };
    for output in [&manifest, &csv] {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
    }
    tracing::info!("manifest: {:?}, csv: {:?}", &manifest, &csv);
    // lines already in the manifest were verified by earlier runs
    let manifest_offset = file_len(&manifest).await;
    let settings = common::copy::Settings {
        full_copy: args.full,
        algorithm: args.algorithm,
        manifest: manifest.clone(),
        csv: csv.clone(),
    };
    let pipeline =
        common::CopyPipeline::start(&config, settings, stop.clone(), prog_track.clone());
    let excludes = walk::Excludes::new([manifest.clone(), csv, dst.clone()]);
    let enqueued = walk::enqueue(&pipeline.submitter(), &src, &dst, &excludes).await;
    // whatever was enqueued before a failure is still copied and recorded
    let mut summary = pipeline.finish().await?;
    let enqueued = enqueued?;
    tracing::info!("enqueued {} files", enqueued);
    if args.verify_after && !stop.is_cancelled() {
        if file_len(&manifest).await > manifest_offset {
            summary += replay_manifest(
                &manifest,
                manifest_offset,
                args.algorithm,
                &config,
                stop,
                prog_track,
            )
            .await?;
        } else {
            tracing::info!("nothing to verify, no entries were added to {:?}", &manifest);
        }
    }
    Ok(summary)
}

async fn verify_main(
    args: &VerifyArgs,
    queue_capacity: usize,
    stop: tokio_util::sync::CancellationToken,
    prog_track: std::sync::Arc<common::progress::Progress>,
) -> Result<common::Summary> {
    let config = common::PipelineConfig {
        copy_workers: 1,
        verify_workers: args.verify_workers,
        queue_capacity,
    };
    let manifest = absolute(&args.manifest)?;
    replay_manifest(&manifest, 0, args.algorithm, &config, stop, prog_track).await
}

#[instrument(skip(prog_track))]
async fn async_main(
    args: Args,
    prog_track: std::sync::Arc<common::progress::Progress>,
) -> Result<common::Summary> {
    let stop = tokio_util::sync::CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, finishing queued work");
                stop.cancel();
            }
        }
    });
    let summary = match &args.command {
        Command::Copy(copy_args) => {
            copy_main(copy_args, args.queue_capacity, stop.clone(), prog_track).await?
        }
        Command::Verify(verify_args) => {
            verify_main(verify_args, args.queue_capacity, stop.clone(), prog_track).await?
        }
    };
    if summary.failures() > 0 || stop.is_cancelled() {
        let reason = if stop.is_cancelled() {
            "copytool was interrupted"
        } else {
            "copytool encountered errors"
        };
        if args.summary {
            return Err(anyhow!("{}\n\n{}", reason, &summary));
        }
        return Err(anyhow!("{}", reason));
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        |prog_track| async_main(args, prog_track)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
        log_file: args.log_file.clone(),
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(
        if args.progress || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

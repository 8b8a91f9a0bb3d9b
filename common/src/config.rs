//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads, used for hashing (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Sizes of the worker pools and their queues
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Number of file copy workers (0 = number of CPU cores)
    pub copy_workers: usize,
    /// Number of checksum verification workers (0 = number of CPU cores)
    pub verify_workers: usize,
    /// Capacity of the copy and verify queues (0 = unbounded)
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            copy_workers: 0,
            verify_workers: 0,
            queue_capacity: 1024,
        }
    }
}

fn resolve_workers(count: usize) -> usize {
    if count > 0 {
        count
    } else {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }
}

impl PipelineConfig {
    pub fn copy_workers(&self) -> usize {
        resolve_workers(self.copy_workers)
    }

    pub fn verify_workers(&self) -> usize {
        resolve_workers(self.verify_workers)
    }

    pub fn channel<T>(&self) -> (async_channel::Sender<T>, async_channel::Receiver<T>) {
        if self.queue_capacity == 0 {
            async_channel::unbounded()
        } else {
            async_channel::bounded(self.queue_capacity)
        }
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Suppress all log output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
    /// Write log output to this file instead of stderr
    pub log_file: Option<std::path::PathBuf>,
}

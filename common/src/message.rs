//! Work items exchanged between the coordinator, the worker pools and the log writer.
//!
//! Each message is consumed exactly once by whichever worker receives it from its queue.

/// Copy one file from `src` to `dst`. Both paths are expected to be absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub src: std::path::PathBuf,
    pub dst: std::path::PathBuf,
}

impl CopyRequest {
    pub fn new(src: impl Into<std::path::PathBuf>, dst: impl Into<std::path::PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

/// Re-check one manifest line, exactly as read from the manifest (without the trailing newline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub manifest_line: String,
}

impl VerifyRequest {
    pub fn new(manifest_line: impl Into<String>) -> Self {
        Self {
            manifest_line: manifest_line.into(),
        }
    }
}

/// Append `text` verbatim to `target`. The text carries its own trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppendRequest {
    pub target: std::path::PathBuf,
    pub text: String,
}

impl LogAppendRequest {
    pub fn new(target: impl Into<std::path::PathBuf>, text: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            text: text.into(),
        }
    }
}

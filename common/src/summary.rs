/// Per-worker tally of outcomes; pools add up the summaries of their workers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub files_verified: usize,
    pub verify_failed: usize,
    pub lines_written: usize,
    pub log_write_failures: usize,
}

impl Summary {
    /// Number of items that ended in an error of any kind
    pub fn failures(&self) -> usize {
        self.files_failed + self.verify_failed + self.log_write_failures
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            files_skipped: self.files_skipped + other.files_skipped,
            files_failed: self.files_failed + other.files_failed,
            files_verified: self.files_verified + other.files_verified,
            verify_failed: self.verify_failed + other.verify_failed,
            lines_written: self.lines_written + other.lines_written,
            log_write_failures: self.log_write_failures + other.log_write_failures,
        }
    }
}

impl std::ops::AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files skipped: {}\n\
            files failed: {}\n\
            files verified: {}\n\
            verification failures: {}\n\
            manifest lines written: {}\n\
            manifest write failures: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_skipped,
            self.files_failed,
            self.files_verified,
            self.verify_failed,
            self.lines_written,
            self.log_write_failures,
        )
    }
}

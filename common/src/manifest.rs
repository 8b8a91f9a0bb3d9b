//! Manifest and CSV line formats.
//!
//! A manifest line is `<hex digest>  <path>\n` and a CSV line is `<path>,<hex digest>\n`, where the
//! path is relative to the directory holding the manifest. A hex digest never contains a space, so
//! the first double space of a line always ends the digest, even if the path itself contains double
//! spaces. Paths must be valid UTF-8 and must not contain a newline: such files are copied but never
//! recorded, the line format has no escaping.

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest line {0:?} has no double-space separator")]
    MissingSeparator(String),
    #[error("manifest line {0:?} does not start with a hex digest")]
    InvalidDigest(String),
    #[error("manifest line {0:?} has an empty path")]
    EmptyPath(String),
    #[error("path {0:?} is not valid UTF-8")]
    NonUtf8Path(std::path::PathBuf),
    #[error("path {0:?} contains a newline")]
    NewlineInPath(std::path::PathBuf),
    #[error("path {0:?} is not relative")]
    AbsolutePath(std::path::PathBuf),
}

/// One verified file: its digest and its path relative to the manifest directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    pub path: String,
}

impl ManifestEntry {
    pub fn new(digest: &str, relative_path: &std::path::Path) -> Result<Self, ManifestError> {
        if relative_path.is_absolute() {
            return Err(ManifestError::AbsolutePath(relative_path.to_owned()));
        }
        let path = relative_path
            .to_str()
            .ok_or_else(|| ManifestError::NonUtf8Path(relative_path.to_owned()))?;
        if path.contains('\n') || path.contains('\r') {
            return Err(ManifestError::NewlineInPath(relative_path.to_owned()));
        }
        Ok(Self {
            digest: digest.to_string(),
            path: path.to_string(),
        })
    }

    /// Parse a manifest line, with or without its trailing newline
    pub fn parse(line: &str) -> Result<Self, ManifestError> {
        let trimmed = line
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(line);
        let (digest, path) = trimmed
            .split_once("  ")
            .ok_or_else(|| ManifestError::MissingSeparator(line.to_string()))?;
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ManifestError::InvalidDigest(line.to_string()));
        }
        if path.is_empty() {
            return Err(ManifestError::EmptyPath(line.to_string()));
        }
        Ok(Self {
            digest: digest.to_ascii_lowercase(),
            path: path.to_string(),
        })
    }

    pub fn manifest_line(&self) -> String {
        format!("{}  {}\n", self.digest, self.path)
    }

    pub fn csv_line(&self) -> String {
        format!("{},{}\n", self.path, self.digest)
    }

    pub fn resolve(&self, base_dir: &std::path::Path) -> std::path::PathBuf {
        base_dir.join(&self.path)
    }
}

/// Directory that manifest paths are relative to
pub fn base_dir(manifest: &std::path::Path) -> std::path::PathBuf {
    match manifest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
        _ => std::path::PathBuf::from("."),
    }
}

/// Lexically drop `.` components and fold each `..` into the component before it.
///
/// A `..` directly under the root stays at the root, a leading `..` of a relative path is kept.
pub fn normalize(path: &std::path::Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut components: Vec<Component> = vec![];
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => components.push(component),
            },
            _ => components.push(component),
        }
    }
    if components.is_empty() {
        return std::path::PathBuf::from(".");
    }
    components.into_iter().collect()
}

/// Lexically compute `path` relative to `base`, walking up with `..` where the two diverge.
///
/// Both paths are expected to be absolute (or both relative to the same directory). They are
/// [`normalize`]d first; no symlinks are resolved.
pub fn relative_path(path: &std::path::Path, base: &std::path::Path) -> std::path::PathBuf {
    let path = normalize(path);
    let base = normalize(base);
    let path_components: Vec<_> = path.components().collect();
    let base_components: Vec<_> = base
        .components()
        .filter(|component| *component != std::path::Component::CurDir)
        .collect();
    let common = path_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = std::path::PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &path_components[common..] {
        relative.push(component);
    }
    relative
}

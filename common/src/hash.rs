use sha2::Digest;
use std::io::Read;
use tracing::instrument;

/// Size of the read buffer used while hashing
pub const HASH_BUFFER_SIZE: usize = 128 * 1024;

/// Digest algorithm used for the manifest.
///
/// Copy and verification of one manifest must use the same algorithm, digests produced by
/// different algorithms are never comparable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Algorithm {
    #[default]
    #[value(name = "sha3-512")]
    Sha3_512,
    #[value(name = "sha512")]
    Sha512,
    #[value(name = "sha256")]
    Sha256,
    #[value(name = "blake3")]
    Blake3,
}

impl Algorithm {
    /// Number of hex characters in a digest produced by this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha3_512 | Algorithm::Sha512 => 128,
            Algorithm::Sha256 | Algorithm::Blake3 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha3_512 => "sha3-512",
            Algorithm::Sha512 => "sha512",
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3",
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Sha3_512 => Hasher::Sha3_512(sha3::Sha3_512::new()),
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = anyhow::Error;
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(name, true)
            .map_err(|_| anyhow::anyhow!("unsupported checksum algorithm: {name:?}"))
    }
}

/// Incremental hasher for any of the supported algorithms
pub enum Hasher {
    Sha3_512(sha3::Sha3_512),
    Sha512(sha2::Sha512),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha3_512(hasher) => hasher.update(data),
            Hasher::Sha512(hasher) => hasher.update(data),
            Hasher::Sha256(hasher) => hasher.update(data),
            Hasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Lowercase hex digest
    pub fn finalize(self) -> String {
        match self {
            Hasher::Sha3_512(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha512(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            Hasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

pub fn hash_bytes(algorithm: Algorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize()
}

fn hash_file_blocking(algorithm: Algorithm, path: &std::path::Path) -> std::io::Result<String> {
    // opening a fifo for reading would block until a writer shows up
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{path:?} is not a regular file"),
        ));
    }
    let mut file = std::fs::File::open(path)?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Hash the full content of a regular file.
///
/// Runs on the blocking pool: a large file occupies one blocking thread until it is fully read.
/// Errors keep their `std::io::ErrorKind` so callers can tell a missing file from an unreadable one.
#[instrument]
pub async fn hash_file(algorithm: Algorithm, path: &std::path::Path) -> std::io::Result<String> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || hash_file_blocking(algorithm, &path))
        .await
        .map_err(std::io::Error::other)?
}

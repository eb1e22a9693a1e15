use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha224 => "sha224",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha384 => "sha384",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "");
        match normalized.as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha224" => Ok(ChecksumAlgorithm::Sha224),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha384" => Ok(ChecksumAlgorithm::Sha384),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            _ => Err(FetchError::UnsupportedAlgorithm(value.to_string())),
        }
    }
}

/// Lowercase hex digest of the whole file.
pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, FetchError> {
    let file = File::open(path)
        .map_err(|err| FetchError::Filesystem(format!("open {}: {err}", path.display())))?;
    let reader = BufReader::new(file);
    let digest = match algorithm {
        ChecksumAlgorithm::Md5 => hash_reader::<Md5, _>(reader),
        ChecksumAlgorithm::Sha1 => hash_reader::<Sha1, _>(reader),
        ChecksumAlgorithm::Sha224 => hash_reader::<Sha224, _>(reader),
        ChecksumAlgorithm::Sha256 => hash_reader::<Sha256, _>(reader),
        ChecksumAlgorithm::Sha384 => hash_reader::<Sha384, _>(reader),
        ChecksumAlgorithm::Sha512 => hash_reader::<Sha512, _>(reader),
    };
    digest.map_err(|err| FetchError::Filesystem(format!("read {}: {err}", path.display())))
}

/// Returns true iff the file's digest matches `expected`, compared as
/// case-insensitive hex.
pub fn verify(path: &Path, expected: &str, algorithm: &str) -> Result<bool, FetchError> {
    let algorithm: ChecksumAlgorithm = algorithm.parse()?;
    let actual = file_digest(path, algorithm)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

fn hash_reader<D, R>(mut reader: R) -> io::Result<String>
where
    D: Digest + Write,
    R: io::Read,
{
    let mut hasher = D::new();
    io::copy(&mut reader, &mut hasher)?;
    hasher.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

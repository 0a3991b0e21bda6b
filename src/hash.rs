use core::fmt;
use std::str::FromStr;

use sha1::Digest as _;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    #[default]
    Sha1 = 0,
    Blake3 = 1,
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!("unknown hash algorithm `{other}`")),
        }
    }
}

/// Streaming hash state for one upload.
pub enum ContentHasher {
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::default()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(hasher) => hasher.update(data),
            Self::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finalize(self) -> ContentDigest {
        match self {
            Self::Sha1(hasher) => ContentDigest {
                algorithm: HashAlgorithm::Sha1,
                bytes: hasher.finalize().to_vec(),
            },
            Self::Blake3(hasher) => ContentDigest {
                algorithm: HashAlgorithm::Blake3,
                bytes: hasher.finalize().as_bytes().to_vec(),
            },
        }
    }
}

impl fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1(_) => f.write_str("ContentHasher(SHA1)"),
            Self::Blake3(_) => f.write_str("ContentHasher(BLAKE3)"),
        }
    }
}

/// The final digest of an upload, as recorded in the hash ledger.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    pub algorithm: HashAlgorithm,
    pub bytes: Vec<u8>,
}

impl ContentDigest {
    pub fn of(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", base16ct::HexDisplay(&self.bytes))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.algorithm {
            HashAlgorithm::Sha1 => write!(f, "ContentDigest(SHA1:{self})"),
            HashAlgorithm::Blake3 => write!(f, "ContentDigest(BLAKE3:{self})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        let digest = ContentDigest::of(HashAlgorithm::Sha1, b"abc");
        assert_eq!(digest.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn streaming_equals_one_shot() {
        for algorithm in [HashAlgorithm::Sha1, HashAlgorithm::Blake3] {
            let mut hasher = ContentHasher::new(algorithm);
            hasher.update(b"chunked, ");
            hasher.update(b"");
            hasher.update(b"and hashed");
            assert_eq!(
                hasher.finalize(),
                ContentDigest::of(algorithm, b"chunked, and hashed")
            );
        }
    }

    #[test]
    fn blake3_is_hex_encoded() {
        let digest = ContentDigest::of(HashAlgorithm::Blake3, b"");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, blake3::hash(b"").to_hex().as_str());
        assert!(format!("{digest:?}").starts_with("ContentDigest(BLAKE3:"));
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!("sha1".parse(), Ok(HashAlgorithm::Sha1));
        assert_eq!("BLAKE3".parse(), Ok(HashAlgorithm::Blake3));
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}

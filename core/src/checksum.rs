use serde::{Deserialize, Serialize};
use std::fmt;

use md5::{Digest as Md5Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256, Sha512};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Sha512 => "sha512",
        }
    }

    /// Accepts the short names as well as the dashed forms (`SHA-256`).
    pub fn from_str(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|ch| *ch != '-' && *ch != '_')
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            "sha512" => Some(ChecksumType::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

impl ChecksumRequest {
    pub fn new(algorithm: &str, expected_hex: impl Into<String>) -> CoreResult<Self> {
        let checksum_type = ChecksumType::from_str(algorithm).ok_or_else(|| {
            CoreError::Unsupported(format!("invalid checksum algorithm: {}", algorithm))
        })?;
        Ok(Self {
            checksum_type,
            expected_hex: expected_hex.into().trim().to_string(),
        })
    }

    /// An empty expected digest means "compute but do not compare".
    pub fn matches(&self, actual_hex: &str) -> bool {
        self.expected_hex.is_empty() || self.expected_hex.eq_ignore_ascii_case(actual_hex)
    }
}

pub enum Digester {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(checksum_type: ChecksumType) -> Self {
        match checksum_type {
            ChecksumType::Md5 => Digester::Md5(<Md5 as Md5Digest>::new()),
            ChecksumType::Sha1 => Digester::Sha1(<Sha1 as Sha1Digest>::new()),
            ChecksumType::Sha256 => Digester::Sha256(<Sha256 as Sha2Digest>::new()),
            ChecksumType::Sha512 => Digester::Sha512(<Sha512 as Sha2Digest>::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Digester::Md5(hasher) => Md5Digest::update(hasher, bytes),
            Digester::Sha1(hasher) => Sha1Digest::update(hasher, bytes),
            Digester::Sha256(hasher) => Sha2Digest::update(hasher, bytes),
            Digester::Sha512(hasher) => Sha2Digest::update(hasher, bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Digester::Md5(hasher) => hex::encode(Md5Digest::finalize(hasher)),
            Digester::Sha1(hasher) => hex::encode(Sha1Digest::finalize(hasher)),
            Digester::Sha256(hasher) => hex::encode(Sha2Digest::finalize(hasher)),
            Digester::Sha512(hasher) => hex::encode(Sha2Digest::finalize(hasher)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(checksum_type: ChecksumType, parts: &[&[u8]]) -> String {
        let mut digester = Digester::new(checksum_type);
        for part in parts {
            digester.update(part);
        }
        digester.finalize_hex()
    }

    #[test]
    fn known_digests_of_abc() {
        assert_eq!(
            digest_of(ChecksumType::Md5, &[b"abc"]),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            digest_of(ChecksumType::Sha1, &[b"abc"]),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            digest_of(ChecksumType::Sha256, &[b"abc"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn split_updates_match_single_update() {
        assert_eq!(
            digest_of(ChecksumType::Sha512, &[b"hello ", b"world"]),
            digest_of(ChecksumType::Sha512, &[b"hello world"])
        );
    }

    #[test]
    fn algorithm_names_are_normalized() {
        assert_eq!(ChecksumType::from_str("SHA-256"), Some(ChecksumType::Sha256));
        assert_eq!(ChecksumType::from_str("sha1"), Some(ChecksumType::Sha1));
        assert_eq!(ChecksumType::from_str("MD5"), Some(ChecksumType::Md5));
        assert_eq!(ChecksumType::from_str("crc32"), None);
        assert!(matches!(
            ChecksumRequest::new("crc32", "00"),
            Err(CoreError::Unsupported(_))
        ));
    }

    #[test]
    fn comparison_ignores_case_and_empty_expectation() {
        let req = ChecksumRequest::new("md5", "900150983CD24FB0D6963F7D28E17F72").unwrap();
        assert!(req.matches("900150983cd24fb0d6963f7d28e17f72"));
        assert!(!req.matches("00"));
        let any = ChecksumRequest::new("md5", "").unwrap();
        assert!(any.matches("whatever"));
    }
}

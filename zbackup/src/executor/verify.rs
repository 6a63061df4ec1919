//! Content digests for transfer verification.

use crate::config::ChecksumAlgo;
use crate::utils::{BackupError, Result};
use sha2::Digest;
use std::io::Read;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental digest for one of the supported algorithms
pub enum Digester {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Digester {
    /// `None` when verification is disabled
    pub fn new(algo: ChecksumAlgo) -> Option<Self> {
        match algo {
            ChecksumAlgo::None => None,
            ChecksumAlgo::Md5 => Some(Digester::Md5(md5::Md5::new())),
            ChecksumAlgo::Sha1 => Some(Digester::Sha1(sha1::Sha1::new())),
            ChecksumAlgo::Sha256 => Some(Digester::Sha256(sha2::Sha256::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Md5(h) => h.update(data),
            Digester::Sha1(h) => h.update(data),
            Digester::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Digester::Md5(h) => h.finalize().to_vec(),
            Digester::Sha1(h) => h.finalize().to_vec(),
            Digester::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Hash everything a reader yields
pub fn hash_reader(reader: &mut dyn Read, algo: ChecksumAlgo) -> Result<Vec<u8>> {
    let mut digester = Digester::new(algo).ok_or_else(|| BackupError::HashUnavailable(algo.to_string()))?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        digester.update(&buffer[..n]);
    }
    Ok(digester.finalize())
}

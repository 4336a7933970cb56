use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

pub type Checksum = [u8; 32];

pub fn sha256(bytes: &[u8]) -> Checksum {
    Sha256::digest(bytes).into()
}

/// SHA-256 of a file's contents. A missing file yields `None` so that "no
/// destination yet" never compares equal to any rendered output.
pub fn sha256_file(path: &Path) -> io::Result<Option<Checksum>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(sha256(&bytes))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

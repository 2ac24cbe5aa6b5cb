//! ---
//! hatch_section: "06-integrity"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Checksum and signature verification of staged artifacts."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use hatch_release::ChecksumAlgorithm;
use sha2::{Digest, Sha256, Sha512};

use crate::Result;

const READ_CHUNK: usize = 64 * 1024;

/// Digest of a file together with the number of bytes hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestOutcome {
    /// Lowercase hex digest.
    pub hex: String,
    /// Bytes read from the file.
    pub bytes: u64,
}

/// Hash `path` with `algorithm`, reading it in fixed-size chunks.
///
/// Blocking; callers on the runtime go through `spawn_blocking`.
pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<DigestOutcome> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => stream::<Sha256>(path),
        ChecksumAlgorithm::Sha512 => stream::<Sha512>(path),
    }
}

fn stream<D: Digest>(path: &Path) -> Result<DigestOutcome> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut bytes = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        bytes += read as u64;
    }
    Ok(DigestOutcome {
        hex: hex::encode(hasher.finalize()),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, b"test").unwrap();

        let sha256 = file_digest(&path, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            sha256.hex,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert_eq!(sha256.bytes, 4);

        let sha512 = file_digest(&path, ChecksumAlgorithm::Sha512).unwrap();
        assert_eq!(sha512.hex.len(), 128);
        assert!(sha512.hex.starts_with("ee26b0dd4af7e749"));
    }

    #[test]
    fn large_file_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let body = vec![0xabu8; READ_CHUNK * 3 + 17];
        std::fs::write(&path, &body).unwrap();

        let outcome = file_digest(&path, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(outcome.bytes, body.len() as u64);
        assert_eq!(outcome.hex, hex::encode(Sha256::digest(&body)));
    }
}

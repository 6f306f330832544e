use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

pub const SHA256_LEN: usize = 32;

const READ_CHUNK: usize = 64 * 1024;

pub fn sha256_digest(bytes: &[u8]) -> [u8; SHA256_LEN] {
    Sha256::digest(bytes).into()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256_digest(bytes))
}

/// Streams `reader` to the end and returns its digest.
pub fn sha256_reader(mut reader: impl Read) -> io::Result<[u8; SHA256_LEN]> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

pub fn sha256_file(path: &Path) -> io::Result<[u8; SHA256_LEN]> {
    sha256_reader(File::open(path)?)
}

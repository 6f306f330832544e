mod checksum;

pub use checksum::{sha256_digest, sha256_file, sha256_hex, sha256_reader, SHA256_LEN};

//! Content hashing of on-disk model files.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use xxhash_rust::xxh64::Xxh64;

const CHUNK_BYTES: usize = 1 << 20;

/// Stream the whole file through XXH64 (seed 0) and return the digest.
///
/// Model files are multiple gigabytes; callers must not hold the registry
/// lock across this call.
pub fn file_hash(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut state = Xxh64::new(0);
    let mut buf = vec![0u8; CHUNK_BYTES];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
    }

    Ok(state.digest())
}

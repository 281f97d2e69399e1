use camino::Utf8Path;
use md5::Context;
use std::fs::File;
use std::io::{BufReader, Read};

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming MD5 of a file, uppercase hex. This is the hash format the
/// distribution service publishes in content summaries.
pub fn file_md5(path: &Utf8Path) -> Result<String, HashError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Context::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.consume(&buf[..n]);
    }
    Ok(format!("{:X}", hasher.finalize()))
}

/// Consistency-check collaborator. Blocking; callers wrap invocations in
/// `spawn_blocking`.
pub trait Hasher: Send + Sync {
    fn hash(&self, path: &Utf8Path) -> Result<String, HashError>;
}

pub struct Md5Hasher;

impl Hasher for Md5Hasher {
    fn hash(&self, path: &Utf8Path) -> Result<String, HashError> {
        file_md5(path)
    }
}

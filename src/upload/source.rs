//! Payload sources
//!
//! In-memory bytes are hashed into the signature; files are read part by
//! part and sent with `UNSIGNED-PAYLOAD`, so large files are never hashed
//! ahead of time.

use crate::s3::PayloadSigning;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    File(PathBuf),
}

impl UploadSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        UploadSource::File(path.into())
    }

    /// Payload size in bytes
    pub async fn len(&self) -> io::Result<u64> {
        match self {
            UploadSource::Bytes(bytes) => Ok(bytes.len() as u64),
            UploadSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Read `len` bytes starting at `offset`
    pub async fn read_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        match self {
            UploadSource::Bytes(bytes) => {
                let end = offset.checked_add(len).filter(|end| *end <= bytes.len() as u64);
                match end {
                    Some(end) => Ok(bytes.slice(offset as usize..end as usize)),
                    None => Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "range {}+{} outside a {}-byte source",
                            offset,
                            len,
                            bytes.len()
                        ),
                    )),
                }
            }
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Read the whole payload
    pub async fn read_all(&self) -> io::Result<Bytes> {
        match self {
            UploadSource::Bytes(bytes) => Ok(bytes.clone()),
            UploadSource::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }

    pub fn payload_signing(&self) -> PayloadSigning {
        match self {
            UploadSource::Bytes(_) => PayloadSigning::Hashed,
            UploadSource::File(_) => PayloadSigning::Unsigned,
        }
    }

    /// Local path, for sources a checkpoint can point back to
    pub fn path(&self) -> Option<&Path> {
        match self {
            UploadSource::Bytes(_) => None,
            UploadSource::File(path) => Some(path),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        UploadSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        UploadSource::Bytes(Bytes::from(bytes))
    }
}

/// Content type guessed from the key's extension
pub fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

//! Object storage: the blob-store interface the catalog and pipeline consume,
//! plus a filesystem backend and the presigned-URL scheme served by this process.

mod fs;
mod presign;

pub use fs::FsObjectStorage;
pub use presign::{PresignMethod, PresignedParams, Presigner};

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Seek};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ObjectMetadata = BTreeMap<String, String>;

/// Random-access handle on a stored object.
pub trait ObjectSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ObjectSource for T {}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("multipart upload not found: {0}")]
    UploadNotFound(String),
    #[error("invalid part: {0}")]
    InvalidPart(String),
    #[error("invalid object URL: {0}")]
    InvalidUrl(String),
    #[error("presigned URL rejected: {0}")]
    Forbidden(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    fn from_io(e: std::io::Error, key: &str) -> Self {
        if e.kind() == ErrorKind::NotFound {
            Self::NotFound(key.to_string())
        } else {
            Self::Io(e)
        }
    }
}

/// Result of a head request against a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub metadata: ObjectMetadata,
    pub last_modified: DateTime<Utc>,
}

/// One finished part of a multipart upload, as reported by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Blob store with single-shot and multipart uploads.
///
/// Calls are blocking; async callers go through `spawn_blocking` for anything
/// that moves a whole object.
pub trait ObjectStorage: Send + Sync {
    fn bucket(&self) -> &str;

    fn upload_object(
        &self,
        reader: &mut dyn Read,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<ObjectInfo, StorageError>;

    fn download_object(&self, key: &str) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Opens the object for ranged reads without loading it.
    fn open_object(&self, key: &str) -> Result<Box<dyn ObjectSource>, StorageError>;

    fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
        metadata: &ObjectMetadata,
    ) -> Result<String, StorageError>;

    fn generate_presigned_url(
        &self,
        key: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
        method: PresignMethod,
    ) -> Result<String, StorageError>;

    /// Stores one part and returns its etag.
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, StorageError>;

    /// Assembles the listed parts, which must be in ascending part order.
    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectInfo, StorageError>;

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    fn get_object_info(&self, key: &str) -> Result<ObjectInfo, StorageError>;

    /// Returns false when there was nothing to delete.
    fn delete_object(&self, key: &str) -> Result<bool, StorageError>;

    /// Storage URL of `key`, in `s3://{bucket}/{key}` form.
    fn object_url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket(), key)
    }

    /// Key addressed by a URL from [`ObjectStorage::object_url`].
    fn key_from_url<'u>(&self, url: &'u str) -> Result<&'u str, StorageError> {
        let rest = url
            .strip_prefix("s3://")
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        if bucket != self.bucket() {
            return Err(StorageError::InvalidUrl(format!(
                "{url} is outside bucket '{}'",
                self.bucket()
            )));
        }
        Ok(key)
    }

    fn open_url(&self, url: &str) -> Result<Box<dyn ObjectSource>, StorageError> {
        self.open_object(self.key_from_url(url)?)
    }
}

/// Rejects keys that could escape the storage root or collide with internal
/// bookkeeping directories.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidKey(key.to_string());

    if key.is_empty() || key.len() > 1024 || key.starts_with('/') || key.contains('\\') {
        return Err(invalid());
    }

    for segment in key.split('/') {
        if segment.is_empty() || segment.starts_with('.') || segment.chars().any(char::is_control)
        {
            return Err(invalid());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("datasets/abc/file.tif").is_ok());
        assert!(validate_key("tilesets/1/processed.tif").is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("datasets/../secret").is_err());
        assert!(validate_key("datasets//file").is_err());
        assert!(validate_key(".multipart/x").is_err());
        assert!(validate_key("a\\b").is_err());
    }
}

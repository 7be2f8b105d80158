use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::write_to_path;
use crate::error::{Error, Result};
use crate::pipeline::SOURCE_PATH_KEY;
use crate::pipeline::uri::Location;
use crate::storage::{ObjectStorage, StorageError};
use crate::workflow::{Operation, WorkflowContext};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadPayload {
    pub download_url: String,
    #[serde(default)]
    pub download_to_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct DownloadOutput {
    pub path: PathBuf,
}

/// Resolves an object-storage URL, local path or HTTP(S) URL to a local file.
pub struct Download {
    storage: Arc<dyn ObjectStorage>,
}

impl Download {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Remote sources are only written to a caller-supplied path.
    fn destination(target: Option<PathBuf>, url: &str) -> Result<PathBuf> {
        target.ok_or_else(|| {
            Error::validation(format!("download_to_path is required to download {url}"))
        })
    }

    fn fetch_http(url: &str, path: &Path) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::processing(format!("HTTP client error: {e}")))?;
        let mut response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::processing(format!("download of {url} failed: {e}")))?;

        write_to_path(&mut response, path)?;
        Ok(())
    }
}

impl Operation for Download {
    const NAME: &'static str = "download";
    type Payload = DownloadPayload;
    type Output = DownloadOutput;

    fn execute(
        &self,
        payload: DownloadPayload,
        ctx: &mut WorkflowContext,
    ) -> Result<DownloadOutput> {
        let url = payload.download_url;
        let target = payload.download_to_path;

        let location = Location::parse(&url).ok_or_else(|| {
            Error::validation(format!("Unsupported or unknown download URL type: {url}"))
        })?;

        let path = match location {
            Location::S3 { bucket, key } => {
                if bucket != self.storage.bucket() {
                    return Err(StorageError::InvalidUrl(format!(
                        "bucket '{bucket}' is not served by this storage"
                    ))
                    .into());
                }
                let path = Self::destination(target, &url)?;
                let mut reader = self.storage.download_object(&key)?;
                let bytes = write_to_path(&mut reader, &path)?;
                tracing::debug!(key = %key, bytes, "downloaded object");
                path
            }
            Location::Local(src) => {
                if !src.exists() {
                    return Err(Error::not_found(format!(
                        "Local file not found: {}",
                        src.display()
                    )));
                }
                match target {
                    Some(dst) => {
                        if let Some(parent) = dst.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::copy(&src, &dst)?;
                        dst
                    }
                    None => src,
                }
            }
            Location::Azure { .. } => {
                return Err(Error::validation(
                    "Azure URI scheme is not supported for downloads. \
                     Use a full https://<account>.blob.core.windows.net/... URL.",
                ));
            }
            remote => {
                let Some(http_url) = remote.http_url() else {
                    return Err(Error::validation(format!(
                        "Unsupported or unknown download URL type: {url}"
                    )));
                };
                let path = Self::destination(target, &url)?;
                Self::fetch_http(&http_url, &path)?;
                path
            }
        };

        ctx.insert(SOURCE_PATH_KEY, &path)?;
        Ok(DownloadOutput { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsObjectStorage, ObjectMetadata, Presigner};
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> Arc<dyn ObjectStorage> {
        Arc::new(FsObjectStorage::new(
            dir.path().join("objects"),
            "mapvault",
            Presigner::new("secret", "http://localhost:8080", 3600),
        ))
    }

    fn payload(url: &str, to: Option<PathBuf>) -> DownloadPayload {
        DownloadPayload {
            download_url: url.to_string(),
            download_to_path: to,
        }
    }

    #[test]
    fn test_download_from_object_storage() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage
            .upload_object(&mut &b"raster"[..], "datasets/d1/file.tif", &ObjectMetadata::new())
            .unwrap();

        let op = Download::new(storage);
        let target = temp.path().join("work/source.tif");
        let mut ctx = WorkflowContext::new();
        let out = op
            .execute(payload("s3://mapvault/datasets/d1/file.tif", Some(target.clone())), &mut ctx)
            .unwrap();

        assert_eq!(out.path, target);
        assert_eq!(fs::read(&target).unwrap(), b"raster");
        assert_eq!(ctx.get::<PathBuf>(SOURCE_PATH_KEY).unwrap(), Some(target));
    }

    #[test]
    fn test_download_rejects_foreign_bucket() {
        let temp = TempDir::new().unwrap();
        let op = Download::new(storage(&temp));
        let err = op
            .execute(payload("s3://elsewhere/a.tif", None), &mut WorkflowContext::new())
            .unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::InvalidUrl(_))));
    }

    #[test]
    fn test_remote_download_requires_target() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage
            .upload_object(&mut &b"raster"[..], "datasets/d1/file.tif", &ObjectMetadata::new())
            .unwrap();
        let op = Download::new(storage);

        for url in ["s3://mapvault/datasets/d1/file.tif", "https://example.com/file.tif"] {
            let mut ctx = WorkflowContext::new();
            let err = op.execute(payload(url, None), &mut ctx).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{url}: {err}");
            assert!(err.to_string().contains("download_to_path is required"));
            assert_eq!(ctx.get::<PathBuf>(SOURCE_PATH_KEY).unwrap(), None);
        }
    }

    #[test]
    fn test_local_copy_and_passthrough() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("in.tif");
        fs::write(&src, b"abc").unwrap();
        let op = Download::new(storage(&temp));

        let url = src.to_str().unwrap();
        let out = op.execute(payload(url, None), &mut WorkflowContext::new()).unwrap();
        assert_eq!(out.path, src);

        let dst = temp.path().join("copy/out.tif");
        let out = op
            .execute(payload(url, Some(dst.clone())), &mut WorkflowContext::new())
            .unwrap();
        assert_eq!(out.path, dst);
        assert_eq!(fs::read(dst).unwrap(), b"abc");

        let missing = temp.path().join("missing.tif");
        let err = op
            .execute(payload(missing.to_str().unwrap(), None), &mut WorkflowContext::new())
            .unwrap_err();
        assert!(err.to_string().contains("Local file not found"));
    }

    #[test]
    fn test_unsupported_schemes_fail_fast() {
        let temp = TempDir::new().unwrap();
        let op = Download::new(storage(&temp));

        let err = op
            .execute(payload("azure://container/blob.tif", None), &mut WorkflowContext::new())
            .unwrap_err();
        assert!(err.to_string().contains("blob.core.windows.net"));

        let err = op
            .execute(payload("ftp://host/file.tif", None), &mut WorkflowContext::new())
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported or unknown download URL type"));
    }
}

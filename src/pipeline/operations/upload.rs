use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipeline::COG_PATH_KEY;
use crate::pipeline::uri::Location;
use crate::storage::{ObjectMetadata, ObjectStorage, StorageError};
use crate::workflow::{Operation, WorkflowContext};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadPayload {
    pub upload_url: String,
    /// Falls back to the COG path recorded by `generate_cog`.
    #[serde(default)]
    pub upload_from_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: Option<ObjectMetadata>,
}

#[derive(Debug, Serialize)]
pub struct UploadOutput {
    pub url: String,
    pub size: u64,
}

/// Pushes a local file to object storage or copies it to a local path.
pub struct Upload {
    storage: Arc<dyn ObjectStorage>,
}

impl Upload {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }
}

impl Operation for Upload {
    const NAME: &'static str = "upload";
    type Payload = UploadPayload;
    type Output = UploadOutput;

    fn execute(&self, payload: UploadPayload, ctx: &mut WorkflowContext) -> Result<UploadOutput> {
        let url = payload.upload_url;
        let src = match payload.upload_from_path {
            Some(path) => path,
            None => ctx
                .get::<PathBuf>(COG_PATH_KEY)?
                .ok_or_else(|| Error::validation("upload_from_path is required."))?,
        };
        if !src.exists() {
            return Err(Error::not_found(format!(
                "Local file not found: {}",
                src.display()
            )));
        }

        match Location::parse(&url) {
            Some(Location::S3 { bucket, key }) => {
                if bucket != self.storage.bucket() {
                    return Err(StorageError::InvalidUrl(format!(
                        "bucket '{bucket}' is not served by this storage"
                    ))
                    .into());
                }
                let mut file = File::open(&src)?;
                let info = self.storage.upload_object(
                    &mut file,
                    &key,
                    &payload.metadata.unwrap_or_default(),
                )?;
                tracing::debug!(key = %info.key, size = info.size, "uploaded object");
                Ok(UploadOutput {
                    url,
                    size: info.size,
                })
            }
            Some(Location::Local(dst)) => {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                let size = fs::copy(&src, &dst)?;
                Ok(UploadOutput {
                    url: dst.display().to_string(),
                    size,
                })
            }
            Some(Location::Azure { .. } | Location::AzureBlob { .. }) => Err(Error::validation(
                "Azure URI scheme is not supported for uploads. \
                 Use an S3-compatible URI or a local path.",
            )),
            Some(Location::Http(_) | Location::Https(_)) => Err(Error::validation(
                "HTTP/HTTPS uploads are not supported. \
                 Use an S3-compatible URI or a local path.",
            )),
            None => Err(Error::validation(format!(
                "Unsupported or unknown upload URL type: {url}"
            ))),
        }
    }
}

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{
    CompletedPart, ObjectInfo, ObjectMetadata, ObjectSource, ObjectStorage, PresignMethod,
    Presigner, StorageError, validate_key,
};

const MULTIPART_DIR: &str = ".multipart";
const META_DIR: &str = ".meta";
const TMP_DIR: &str = ".tmp";
const MANIFEST: &str = "upload.json";

/// Sidecar stored next to every object.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredMeta {
    etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default)]
    metadata: ObjectMetadata,
}

/// State of an open multipart upload.
#[derive(Debug, Serialize, Deserialize)]
struct UploadManifest {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default)]
    metadata: ObjectMetadata,
    created_at: DateTime<Utc>,
}

/// Object storage on the local filesystem.
///
/// Objects live at `<root>/<key>`; sidecars, multipart staging and temporary
/// files use dot-prefixed directories that valid keys can never reach.
pub struct FsObjectStorage {
    root: PathBuf,
    bucket: String,
    presigner: Presigner,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>, presigner: Presigner) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
            presigner,
        }
    }

    pub fn presigner(&self) -> &Presigner {
        &self.presigner
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(TMP_DIR).join(Uuid::new_v4().to_string())
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        if upload_id.is_empty()
            || !upload_id
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-')
        {
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }
        Ok(self.root.join(MULTIPART_DIR).join(upload_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{part_number:05}"))
    }

    fn load_manifest(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(PathBuf, UploadManifest), StorageError> {
        let dir = self.upload_dir(upload_id)?;
        let raw = match fs::read(dir.join(MANIFEST)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::UploadNotFound(upload_id.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        let manifest: UploadManifest = serde_json::from_slice(&raw).map_err(io::Error::other)?;
        if manifest.key != key {
            return Err(StorageError::UploadNotFound(format!(
                "{upload_id} is not an upload for '{key}'"
            )));
        }
        Ok((dir, manifest))
    }

    /// Moves a fully written temp file into place and records its sidecar.
    fn commit_object(
        &self,
        temp_path: &Path,
        key: &str,
        meta: StoredMeta,
    ) -> Result<ObjectInfo, StorageError> {
        let final_path = self.object_path(key);
        create_parent(&final_path)?;
        fs::rename(temp_path, &final_path)?;

        let meta_path = self.meta_path(key);
        create_parent(&meta_path)?;
        fs::write(&meta_path, serde_json::to_vec(&meta).map_err(io::Error::other)?)?;

        self.get_object_info(key)
    }

    fn read_meta(&self, key: &str) -> Result<Option<StoredMeta>, StorageError> {
        match fs::read(self.meta_path(key)) {
            Ok(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(io::Error::other)?,
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Streams `reader` into a new file at `path`, returning `(bytes, sha256 hex)`.
fn write_hashed(reader: &mut dyn Read, path: &Path) -> io::Result<(u64, String)> {
    create_parent(path)?;
    let mut file = File::create(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
        written += n as u64;
    }

    file.sync_all()?;
    Ok((written, hex::encode(hasher.finalize())))
}

impl ObjectStorage for FsObjectStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn upload_object(
        &self,
        reader: &mut dyn Read,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<ObjectInfo, StorageError> {
        validate_key(key)?;

        let temp_path = self.temp_path();
        let (size, etag) = match write_hashed(reader, &temp_path) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(StorageError::Io(e));
            }
        };

        let content_type = metadata.get("content-type").cloned();
        let info = self.commit_object(
            &temp_path,
            key,
            StoredMeta {
                etag,
                content_type,
                metadata: metadata.clone(),
            },
        )?;
        tracing::debug!(key, size, "stored object");
        Ok(info)
    }

    fn download_object(&self, key: &str) -> Result<Box<dyn Read + Send>, StorageError> {
        validate_key(key)?;
        let file = File::open(self.object_path(key)).map_err(|e| StorageError::from_io(e, key))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn open_object(&self, key: &str) -> Result<Box<dyn ObjectSource>, StorageError> {
        validate_key(key)?;
        let file = File::open(self.object_path(key)).map_err(|e| StorageError::from_io(e, key))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
        metadata: &ObjectMetadata,
    ) -> Result<String, StorageError> {
        validate_key(key)?;

        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir)?;

        let manifest = UploadManifest {
            key: key.to_string(),
            content_type: content_type.map(str::to_string),
            metadata: metadata.clone(),
            created_at: Utc::now(),
        };
        fs::write(
            dir.join(MANIFEST),
            serde_json::to_vec(&manifest).map_err(io::Error::other)?,
        )?;

        tracing::debug!(key, upload_id, "opened multipart upload");
        Ok(upload_id)
    }

    fn generate_presigned_url(
        &self,
        key: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
        method: PresignMethod,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        if part_number == Some(0) {
            return Err(StorageError::InvalidPart("part numbers start at 1".to_string()));
        }
        Ok(self.presigner.url(key, method, upload_id, part_number))
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        if part_number == 0 || part_number > 10_000 {
            return Err(StorageError::InvalidPart(format!(
                "part number {part_number} out of range 1..=10000"
            )));
        }
        let (dir, _) = self.load_manifest(key, upload_id)?;

        let temp_path = self.temp_path();
        let (_, etag) = write_hashed(&mut &data[..], &temp_path)?;
        fs::rename(&temp_path, Self::part_path(&dir, part_number))?;
        Ok(etag)
    }

    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectInfo, StorageError> {
        validate_key(key)?;
        let (dir, manifest) = self.load_manifest(key, upload_id)?;

        if parts.is_empty() {
            return Err(StorageError::InvalidPart("no parts listed".to_string()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::InvalidPart(
                "parts must be listed in ascending order without duplicates".to_string(),
            ));
        }

        let temp_path = self.temp_path();
        create_parent(&temp_path)?;
        let mut out = File::create(&temp_path)?;
        let mut hasher = Sha256::new();

        let assembled = (|| -> Result<(), StorageError> {
            for part in parts {
                let data = fs::read(Self::part_path(&dir, part.part_number)).map_err(|e| {
                    if e.kind() == ErrorKind::NotFound {
                        StorageError::InvalidPart(format!(
                            "part {} was never uploaded",
                            part.part_number
                        ))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                let actual = hex::encode(Sha256::digest(&data));
                if actual != part.etag.trim_matches('"') {
                    return Err(StorageError::InvalidPart(format!(
                        "etag mismatch for part {}",
                        part.part_number
                    )));
                }
                hasher.update(&data);
                out.write_all(&data)?;
            }
            out.sync_all()?;
            Ok(())
        })();

        if let Err(e) = assembled {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        let info = self.commit_object(
            &temp_path,
            key,
            StoredMeta {
                etag: hex::encode(hasher.finalize()),
                content_type: manifest.content_type,
                metadata: manifest.metadata,
            },
        )?;

        if let Err(e) = fs::remove_dir_all(&dir) {
            tracing::warn!(upload_id, "failed to clean multipart staging: {}", e);
        }
        tracing::debug!(key, upload_id, parts = parts.len(), "completed multipart upload");
        Ok(info)
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let (dir, _) = self.load_manifest(key, upload_id)?;
        fs::remove_dir_all(&dir)?;
        tracing::debug!(key, upload_id, "aborted multipart upload");
        Ok(())
    }

    fn get_object_info(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        validate_key(key)?;
        let path = self.object_path(key);
        let stat = fs::metadata(&path).map_err(|e| StorageError::from_io(e, key))?;
        if !stat.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let meta = match self.read_meta(key)? {
            Some(meta) => meta,
            None => {
                let mut file = File::open(&path)?;
                let mut hasher = Sha256::new();
                io::copy(&mut file, &mut hasher)?;
                StoredMeta {
                    etag: hex::encode(hasher.finalize()),
                    ..StoredMeta::default()
                }
            }
        };

        Ok(ObjectInfo {
            key: key.to_string(),
            size: stat.len(),
            etag: meta.etag,
            content_type: meta.content_type,
            metadata: meta.metadata,
            last_modified: stat
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn delete_object(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;

        let removed = match fs::remove_file(self.object_path(key)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::Io(e)),
        };
        match fs::remove_file(self.meta_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        Ok(removed)
    }
}

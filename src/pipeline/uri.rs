use std::path::PathBuf;

/// A location the pipeline can read from or write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// `s3://bucket/key`
    S3 { bucket: String, key: String },
    /// `https://<account>.blob.core.windows.net/<container>/<blob>`
    AzureBlob {
        account: String,
        container: String,
        blob: String,
    },
    /// `azure://<container>/<blob>`, which carries no account host.
    Azure { container: String, blob: String },
    Http(String),
    Https(String),
    Local(PathBuf),
}

impl Location {
    /// Classifies a URI or path. Returns `None` for anything unrecognised.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/')?;
            if bucket.is_empty() || key.is_empty() {
                return None;
            }
            return Some(Self::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        if let Some(rest) = raw.strip_prefix("azure://") {
            let (container, blob) = rest.split_once('/')?;
            if container.is_empty() || blob.is_empty() {
                return None;
            }
            return Some(Self::Azure {
                container: container.to_string(),
                blob: blob.to_string(),
            });
        }

        if let Some(rest) = raw.strip_prefix("https://") {
            if let Some((host, path)) = rest.split_once('/') {
                if let Some(account) = host.strip_suffix(".blob.core.windows.net") {
                    if !account.is_empty() && !account.contains('.') && !path.is_empty() {
                        let (container, blob) = path.split_once('/').unwrap_or((path, ""));
                        return Some(Self::AzureBlob {
                            account: account.to_string(),
                            container: container.to_string(),
                            blob: blob.to_string(),
                        });
                    }
                }
            }
            return Some(Self::Https(raw.to_string()));
        }

        if raw.starts_with("http://") {
            return Some(Self::Http(raw.to_string()));
        }

        if raw.starts_with(['/', '.', '~']) || is_windows_drive(raw) {
            return Some(Self::Local(expand_home(raw)));
        }

        None
    }

    /// Whether this location can be fetched with a plain HTTP GET.
    pub fn http_url(&self) -> Option<String> {
        match self {
            Self::Http(url) | Self::Https(url) => Some(url.clone()),
            Self::AzureBlob {
                account,
                container,
                blob,
            } => Some(format!(
                "https://{account}.blob.core.windows.net/{container}/{blob}"
            )),
            _ => None,
        }
    }
}

fn is_windows_drive(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

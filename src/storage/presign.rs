use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

impl fmt::Display for PresignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query parameters carried by a presigned URL.
#[derive(Debug, Clone, Deserialize)]
pub struct PresignedParams {
    pub method: PresignMethod,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
    pub expires: i64,
    pub signature: String,
}

/// Signs and verifies URLs that grant time-limited access to one object
/// (or one multipart part) through this server's `/storage` routes.
#[derive(Clone)]
pub struct Presigner {
    secret: String,
    base_url: String,
    ttl_secs: i64,
}

impl fmt::Debug for Presigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Presigner")
            .field("base_url", &self.base_url)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl Presigner {
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn url(
        &self,
        key: &str,
        method: PresignMethod,
        upload_id: Option<&str>,
        part_number: Option<u32>,
    ) -> String {
        let expires = Utc::now().timestamp().saturating_add(self.ttl_secs);
        let signature = self.signature(method, key, upload_id, part_number, expires);

        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let mut url = format!("{}/storage/{}?method={}", self.base_url, path, method);
        if let Some(upload_id) = upload_id {
            url.push_str(&format!("&uploadId={}", urlencoding::encode(upload_id)));
        }
        if let Some(part_number) = part_number {
            url.push_str(&format!("&partNumber={part_number}"));
        }
        url.push_str(&format!("&expires={expires}&signature={signature}"));
        url
    }

    fn signature(
        &self,
        method: PresignMethod,
        key: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
        expires: i64,
    ) -> String {
        let part = part_number.map(|p| p.to_string()).unwrap_or_default();
        let expires = expires.to_string();
        let mut hasher = Sha256::new();
        for field in [
            self.secret.as_str(),
            method.as_str(),
            key,
            upload_id.unwrap_or(""),
            part.as_str(),
            expires.as_str(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }

    /// Checks that `params` were issued for `key` and `method` and have not expired.
    pub fn verify(
        &self,
        key: &str,
        method: PresignMethod,
        params: &PresignedParams,
    ) -> Result<(), StorageError> {
        if params.method != method {
            return Err(StorageError::Forbidden(format!(
                "URL was signed for {}, not {}",
                params.method, method
            )));
        }

        if params.expires < Utc::now().timestamp() {
            return Err(StorageError::Forbidden("URL has expired".to_string()));
        }

        let expected = self.signature(
            params.method,
            key,
            params.upload_id.as_deref(),
            params.part_number,
            params.expires,
        );
        if !constant_time_eq(expected.as_bytes(), params.signature.as_bytes()) {
            return Err(StorageError::Forbidden("signature mismatch".to_string()));
        }

        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_from(url: &str) -> PresignedParams {
        let query = url.split_once('?').unwrap().1;
        let mut method = None;
        let mut upload_id = None;
        let mut part_number = None;
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "method" => {
                    method = Some(if v == "PUT" {
                        PresignMethod::Put
                    } else {
                        PresignMethod::Get
                    })
                }
                "uploadId" => upload_id = Some(urlencoding::decode(v).unwrap().into_owned()),
                "partNumber" => part_number = Some(v.parse().unwrap()),
                "expires" => expires = v.parse().unwrap(),
                "signature" => signature = v.to_string(),
                _ => panic!("unexpected param {k}"),
            }
        }
        PresignedParams {
            method: method.unwrap(),
            upload_id,
            part_number,
            expires,
            signature,
        }
    }

    #[test]
    fn test_url_shape() {
        let presigner = Presigner::new("secret", "http://localhost:8080/", 60);
        let url = presigner.url("datasets/a b/file.tif", PresignMethod::Put, Some("up-1"), Some(3));

        assert!(url.starts_with("http://localhost:8080/storage/datasets/a%20b/file.tif?method=PUT"));
        assert!(url.contains("&uploadId=up-1&partNumber=3&expires="));
    }

    #[test]
    fn test_verify_accepts_issued_url() {
        let presigner = Presigner::new("secret", "http://h", 60);
        let url = presigner.url("k/obj", PresignMethod::Put, Some("u"), Some(1));
        let params = params_from(&url);

        presigner.verify("k/obj", PresignMethod::Put, &params).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let presigner = Presigner::new("secret", "http://h", 60);
        let url = presigner.url("k/obj", PresignMethod::Put, Some("u"), Some(1));

        let mut params = params_from(&url);
        params.part_number = Some(2);
        assert!(matches!(
            presigner.verify("k/obj", PresignMethod::Put, &params),
            Err(StorageError::Forbidden(_))
        ));

        let params = params_from(&url);
        assert!(presigner.verify("k/other", PresignMethod::Put, &params).is_err());
        assert!(presigner.verify("k/obj", PresignMethod::Get, &params).is_err());

        let other = Presigner::new("different", "http://h", 60);
        assert!(other.verify("k/obj", PresignMethod::Put, &params).is_err());
    }

    #[test]
    fn test_verify_rejects_expired() {
        let presigner = Presigner::new("secret", "http://h", 0);
        let mut params = params_from(&presigner.url("k", PresignMethod::Get, None, None));
        params.expires -= 10;
        params.signature = presigner.signature(PresignMethod::Get, "k", None, None, params.expires);

        assert!(matches!(
            presigner.verify("k", PresignMethod::Get, &params),
            Err(StorageError::Forbidden(_))
        ));
    }
}

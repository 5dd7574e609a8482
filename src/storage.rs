//! S3-compatible blob storage for raw HTML and extracted text.
//!
//! Object keys are deterministic per URL so re-crawls overwrite in place:
//! `{host}{path or /index}_{first 8 bytes of sha256(url) as hex}.{ext}`.
//! The hash suffix keeps URLs that differ only by query string apart.

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::MinioConfig;

pub const HTML_BUCKET: &str = "nimbus-html";
pub const TEXT_BUCKET: &str = "nimbus-text";

/// Read cap matching the fetcher's body cap, so a blob can never grow on
/// its way back out.
const MAX_OBJECT_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("checking bucket {bucket}: {message}")]
    Bucket { bucket: String, message: String },

    #[error("putting object {bucket}/{key}: {message}")]
    Put {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("getting object {bucket}/{key}: {message}")]
    Get {
        bucket: String,
        key: String,
        message: String,
    },
}

pub struct ObjectStore {
    client: S3Client,
}

impl ObjectStore {
    /// Build the client against the configured endpoint and make sure both
    /// buckets exist.
    pub async fn connect(cfg: &MinioConfig) -> Result<Self, StorageError> {
        let credentials = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "nimbus-static",
        );
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&base)
            .endpoint_url(cfg.endpoint_url())
            // MinIO serves buckets on the path, not as subdomains.
            .force_path_style(true)
            .build();

        let store = Self {
            client: S3Client::from_conf(s3_config),
        };
        store.ensure_buckets().await?;
        Ok(store)
    }

    async fn ensure_buckets(&self) -> Result<(), StorageError> {
        for bucket in [HTML_BUCKET, TEXT_BUCKET] {
            let exists = self.client.head_bucket().bucket(bucket).send().await.is_ok();
            if exists {
                continue;
            }
            if let Err(e) = self.client.create_bucket().bucket(bucket).send().await {
                let service = e.into_service_error();
                if service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists() {
                    continue;
                }
                return Err(StorageError::Bucket {
                    bucket: bucket.to_string(),
                    message: service.to_string(),
                });
            }
            tracing::info!(bucket, "created bucket");
        }
        Ok(())
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let mut bytes = data.into_bytes().to_vec();
        bytes.truncate(MAX_OBJECT_SIZE);
        Ok(bytes)
    }
}

/// Object key for raw HTML content.
pub fn html_key(raw_url: &str) -> String {
    object_key(raw_url, "html")
}

/// Object key for extracted text content.
pub fn text_key(raw_url: &str) -> String {
    object_key(raw_url, "txt")
}

fn object_key(raw_url: &str, ext: &str) -> String {
    let parsed = match Url::parse(raw_url) {
        Ok(u) => u,
        Err(_) => return format!("unknown/{}.{}", sanitize(raw_url), ext),
    };

    let mut path = parsed.path().to_string();
    if path.is_empty() || path == "/" {
        path = "/index".to_string();
    }
    let path = path.trim_end_matches('/');

    // Query and fragment stay out of the path but feed the hash, so
    // /search?q=a and /search?q=b land on different keys.
    let digest = Sha256::digest(raw_url.as_bytes());
    let mut hash_prefix = String::with_capacity(16);
    for byte in &digest[..8] {
        hash_prefix.push_str(&format!("{:02x}", byte));
    }

    format!(
        "{}{}_{}.{}",
        parsed.host_str().unwrap_or("unknown"),
        path,
        hash_prefix,
        ext
    )
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | ':' | '?' | '&' | '=' => '_',
            c => c,
        })
        .collect()
}

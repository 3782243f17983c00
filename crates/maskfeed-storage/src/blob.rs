//! Object-store writes: a GCS uploader and a local-directory stand-in.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::SinkError;

pub const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    /// Send a CRC32C of the stored bytes so the store rejects corrupted uploads.
    #[default]
    Crc32c,
    Disabled,
}

/// One object write, with every transport option chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_language: Option<String>,
    pub gzip: bool,
    pub cache_max_age_secs: u32,
    pub checksum: ChecksumMode,
}

impl BlobObject {
    pub fn csv(key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
            content_type: "text/csv".to_string(),
            content_language: None,
            gzip: true,
            cache_max_age_secs: 30,
            checksum: ChecksumMode::Crc32c,
        }
    }

    pub fn with_content_language(mut self, language: impl Into<String>) -> Self {
        self.content_language = Some(language.into());
        self
    }

    pub fn with_cache_max_age(mut self, secs: u32) -> Self {
        self.cache_max_age_secs = secs;
        self
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumMode) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_max_age_secs)
    }

    /// Encodes the body the way it will be stored.
    pub fn prepare(&self) -> Result<PreparedBlob, SinkError> {
        let stored = if self.gzip {
            // flate2 writes a zero mtime, so identical input gives identical bytes.
            let mut encoder = GzEncoder::new(
                Vec::with_capacity((self.body.len() / 2).max(256)),
                Compression::default(),
            );
            encoder
                .write_all(&self.body)
                .and_then(|_| encoder.finish())
                .map_err(|source| SinkError::Io {
                    context: format!("gzip encoding {}", self.key),
                    source,
                })?
        } else {
            self.body.clone()
        };

        let crc32c = match self.checksum {
            ChecksumMode::Crc32c => Some(BASE64.encode(crc32c::crc32c(&stored).to_be_bytes())),
            ChecksumMode::Disabled => None,
        };

        Ok(PreparedBlob {
            content_sha256: sha256_hex(&self.body),
            content_encoding: self.gzip.then_some("gzip"),
            crc32c,
            bytes: stored,
        })
    }

    fn metadata(&self, prepared: &PreparedBlob) -> ObjectMetadata {
        ObjectMetadata {
            name: self.key.clone(),
            content_type: self.content_type.clone(),
            content_language: self.content_language.clone(),
            content_encoding: prepared.content_encoding.map(str::to_string),
            cache_control: self.cache_control(),
            crc32c: prepared.crc32c.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedBlob {
    pub bytes: Vec<u8>,
    pub content_sha256: String,
    pub content_encoding: Option<&'static str>,
    pub crc32c: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: String,
    content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
    cache_control: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    crc32c: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredBlob {
    pub location: String,
    /// Hash of the uncompressed body; equal input always yields an equal hash.
    pub content_sha256: String,
    pub stored_bytes: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `object`, replacing whatever was stored under the same key.
    async fn put(&self, object: &BlobObject) -> Result<StoredBlob, SinkError>;
}

/// Google Cloud Storage multipart uploads.
pub struct GcsBlobStore {
    client: reqwest::Client,
    bucket: String,
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
}

impl GcsBlobStore {
    pub fn new(client: reqwest::Client, bucket: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            tokens,
            base_url: GCS_UPLOAD_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=multipart",
            self.base_url.trim_end_matches('/'),
            self.bucket
        )
    }
}

/// `multipart/related` body: JSON metadata part followed by the media part.
fn multipart_related_body(
    boundary: &str,
    metadata: &[u8],
    content_type: &str,
    media: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + media.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\nContent-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn put(&self, object: &BlobObject) -> Result<StoredBlob, SinkError> {
        let prepared = object.prepare()?;
        let metadata = serde_json::to_vec(&object.metadata(&prepared)).map_err(|source| {
            SinkError::Decode {
                service: "storage",
                source,
            }
        })?;
        let boundary = format!("maskfeed-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &metadata, &object.content_type, &prepared.bytes);
        let token = self.tokens.access_token().await?;

        let resp = self
            .client
            .post(self.upload_url())
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::HttpStatus {
                service: "storage",
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let location = format!("gs://{}/{}", self.bucket, object.key);
        info!(%location, stored_bytes = prepared.bytes.len(), "blob uploaded");
        Ok(StoredBlob {
            location,
            content_sha256: prepared.content_sha256,
            stored_bytes: prepared.bytes.len(),
        })
    }
}

/// Writes objects under a directory, with the metadata in a `.meta.json`
/// sidecar. Used for dry runs and tests.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
        let io_err = |context: String| move |source: std::io::Error| SinkError::Io { context, source };

        let parent = path
            .parent()
            .ok_or_else(|| SinkError::Layout(format!("{} has no parent directory", path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(io_err(format!("creating directory {}", parent.display())))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(format!("opening temp file {}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(io_err(format!("writing temp file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(io_err(format!("flushing temp file {}", temp_path.display())))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(SinkError::Io {
                context: format!("renaming {} -> {}", temp_path.display(), path.display()),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, object: &BlobObject) -> Result<StoredBlob, SinkError> {
        let prepared = object.prepare()?;
        let path = self.object_path(&object.key);
        Self::write_atomic(&path, &prepared.bytes).await?;

        let metadata = serde_json::to_vec_pretty(&object.metadata(&prepared)).map_err(|source| {
            SinkError::Decode {
                service: "local",
                source,
            }
        })?;
        let mut meta_name = path.clone().into_os_string();
        meta_name.push(".meta.json");
        Self::write_atomic(Path::new(&meta_name), &metadata).await?;

        info!(location = %path.display(), stored_bytes = prepared.bytes.len(), "blob written");
        Ok(StoredBlob {
            location: path.display().to_string(),
            content_sha256: prepared.content_sha256,
            stored_bytes: prepared.bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn gzip_preparation_is_deterministic_and_decodes() {
        let object = BlobObject::csv("a/b.csv", "id,name\n1,x\n");
        let first = object.prepare().unwrap();
        let second = object.prepare().unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.crc32c, second.crc32c);
        assert_eq!(first.content_encoding, Some("gzip"));

        let mut decoded = String::new();
        GzDecoder::new(first.bytes.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "id,name\n1,x\n");
    }

    #[test]
    fn crc32c_is_base64_big_endian() {
        // RFC 3720 check value for "123456789".
        let object = BlobObject::csv("k", "123456789").with_gzip(false);
        let prepared = object.prepare().unwrap();
        assert_eq!(prepared.crc32c.as_deref(), Some("4waSgw=="));

        let unchecked = object.with_checksum(ChecksumMode::Disabled).prepare().unwrap();
        assert_eq!(unchecked.crc32c, None);
    }

    #[test]
    fn metadata_carries_cache_and_language() {
        let object = BlobObject::csv("ncov-mask-map/maskdata.csv", "x")
            .with_content_language("zh")
            .with_cache_max_age(30);
        let prepared = object.prepare().unwrap();
        let json = serde_json::to_value(object.metadata(&prepared)).unwrap();
        assert_eq!(json["name"], "ncov-mask-map/maskdata.csv");
        assert_eq!(json["contentType"], "text/csv");
        assert_eq!(json["contentLanguage"], "zh");
        assert_eq!(json["contentEncoding"], "gzip");
        assert_eq!(json["cacheControl"], "public, max-age=30");
        assert!(json["crc32c"].is_string());
    }

    #[test]
    fn multipart_body_frames_both_parts() {
        let body = multipart_related_body("b", br#"{"name":"k"}"#, "text/csv", b"id\n1");
        let text = String::from_utf8(body).unwrap();
        assert_eq!(
            text,
            "--b\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{\"name\":\"k\"}\r\n--b\r\nContent-Type: text/csv\r\n\r\nid\n1\r\n--b--\r\n"
        );
    }

    #[test]
    fn object_path_stays_under_root() {
        let store = LocalBlobStore::new("/srv/out");
        assert_eq!(
            store.object_path("ncov-mask-map/maskdata.csv"),
            PathBuf::from("/srv/out/ncov-mask-map/maskdata.csv")
        );
        assert_eq!(
            store.object_path("../../etc/passwd"),
            PathBuf::from("/srv/out/etc/passwd")
        );
    }

    #[tokio::test]
    async fn local_store_replaces_previous_object() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());

        let first = store
            .put(&BlobObject::csv("out/data.csv", "id\n1\n").with_gzip(false))
            .await
            .expect("first put");
        let second = store
            .put(&BlobObject::csv("out/data.csv", "id\n2\n").with_gzip(false))
            .await
            .expect("second put");

        assert_eq!(first.location, second.location);
        assert_ne!(first.content_sha256, second.content_sha256);
        let stored = std::fs::read_to_string(dir.path().join("out/data.csv")).unwrap();
        assert_eq!(stored, "id\n2\n");
        let meta = std::fs::read_to_string(dir.path().join("out/data.csv.meta.json")).unwrap();
        assert!(meta.contains("public, max-age=30"));
    }
}

//! Storage backends for converted blobs.
//!
//! A [`Backend`] publishes content-addressed blobs to an object store and
//! answers existence queries. The concrete store is selected through
//! [`BackendConfig`], a tagged configuration record validated eagerly so a
//! bad field fails at setup time with its name, not deep inside an upload.

mod localfs;
mod oss;
mod uploader;

pub use localfs::LocalStore;
pub use oss::OssStore;
pub use uploader::{
    chunk_ranges, Chunk, MultipartStore, Part, Uploader, MULTIPART_CHUNK_SIZE,
    MULTIPART_PART_LIMIT,
};

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::stream::ReaderAt;

/// Identity of one blob: content digest plus size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// `sha256:<hex>` of the blob content.
    pub digest: String,
    pub size: u64,
}

impl BlobDescriptor {
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        BlobDescriptor {
            digest: digest.into(),
            size,
        }
    }

    /// Hex part of the digest.
    pub fn digest_hex(&self) -> &str {
        match self.digest.split_once(':') {
            Some((_, hex)) => hex,
            None => &self.digest,
        }
    }
}

/// Uploads blobs produced by the conversion pipeline to remote storage.
pub trait Backend: Send + Sync {
    /// Pushes the blob, deduplicating against already-present content and
    /// retrying transient failures internally.
    fn push(
        &self,
        token: &CancelToken,
        blob: &(dyn ReaderAt + Sync),
        desc: &BlobDescriptor,
    ) -> Result<()>;

    /// Pure existence query: returns the object key when the blob exists,
    /// an [`crate::error::NotFound`]-flavored error when it does not, and a
    /// transport error otherwise.
    fn check(&self, digest: &str) -> Result<String>;

    /// Backend type tag, e.g. `oss`.
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalFsConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub object_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OssConfig {
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    pub bucket_name: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub access_key_secret: String,
    #[serde(default)]
    pub object_prefix: String,
}

/// Backend selection keyed by a type tag, one validated record per type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Localfs(LocalFsConfig),
    Oss(OssConfig),
}

impl BackendConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: BackendConfig =
            serde_json::from_slice(bytes).context("parse storage backend configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Eager semantic validation with field-level errors.
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Localfs(config) => {
                if config.root.as_os_str().is_empty() {
                    bail!("localfs backend: `root` must not be empty");
                }
            }
            BackendConfig::Oss(config) => {
                if config.endpoint.is_empty() {
                    bail!("oss backend: `endpoint` must not be empty");
                }
                if config.bucket_name.is_empty() {
                    bail!("oss backend: `bucket_name` must not be empty");
                }
                if config.access_key_id.is_empty() != config.access_key_secret.is_empty() {
                    bail!(
                        "oss backend: `access_key_id` and `access_key_secret` must be set together"
                    );
                }
            }
        }
        Ok(())
    }

    /// Builds the configured backend.
    pub fn connect(&self) -> Result<Box<dyn Backend>> {
        self.validate()?;
        match self {
            BackendConfig::Localfs(config) => {
                let store = LocalStore::new(&config.root)?;
                Ok(Box::new(Uploader::new(store, &config.object_prefix)))
            }
            BackendConfig::Oss(config) => {
                let store = OssStore::new(config)?;
                Ok(Box::new(Uploader::new(store, &config.object_prefix)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_digest_hex() {
        let desc = BlobDescriptor::new("sha256:00ff", 2);
        assert_eq!(desc.digest_hex(), "00ff");
    }

    #[test]
    fn test_config_tag_selects_backend() {
        let config = BackendConfig::from_json(
            br#"{"type": "localfs", "root": "/tmp/blobs", "object_prefix": "nydus/"}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            BackendConfig::Localfs(LocalFsConfig {
                root: PathBuf::from("/tmp/blobs"),
                object_prefix: "nydus/".to_string(),
            })
        );
    }

    #[test]
    fn test_unknown_type_tag_is_rejected() {
        let err = BackendConfig::from_json(br#"{"type": "ftp", "root": "/x"}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("parse storage backend configuration"));
    }

    #[test]
    fn test_missing_field_is_named() {
        let err = BackendConfig::from_json(br#"{"type": "oss", "endpoint": "e"}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("bucket_name"));
    }

    #[test]
    fn test_oss_validation_requires_paired_keys() {
        let config = BackendConfig::Oss(OssConfig {
            endpoint: "http://localhost:9000".to_string(),
            region: String::new(),
            bucket_name: "blobs".to_string(),
            access_key_id: "ak".to_string(),
            access_key_secret: String::new(),
            object_prefix: String::new(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("access_key_secret"));
    }
}

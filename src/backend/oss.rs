//! Object store backed by an S3-compatible endpoint (OSS, R2, MinIO).
//!
//! Only the five multipart wire operations are implemented here; transport,
//! request signing and TLS are delegated to rust-s3.

use std::io::Read;

use anyhow::{Context, Result};
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use super::uploader::{MultipartStore, Part};
use super::OssConfig;

const CONTENT_TYPE: &str = "application/octet-stream";

pub struct OssStore {
    bucket: Box<Bucket>,
}

impl OssStore {
    pub fn new(config: &OssConfig) -> Result<Self> {
        let region = Region::Custom {
            region: if config.region.is_empty() {
                "us-east-1".to_string()
            } else {
                config.region.clone()
            },
            endpoint: config.endpoint.clone(),
        };

        let credentials = if config.access_key_id.is_empty() {
            Credentials::anonymous().context("create anonymous credentials")?
        } else {
            Credentials::new(
                Some(&config.access_key_id),
                Some(&config.access_key_secret),
                None,
                None,
                None,
            )
            .context("create credentials")?
        };

        let bucket = Bucket::new(&config.bucket_name, region, credentials)
            .context("create bucket client")?
            .with_path_style();

        Ok(OssStore { bucket })
    }
}

impl MultipartStore for OssStore {
    fn kind(&self) -> &'static str {
        "oss"
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.bucket.head_object(key) {
            Ok((_, code)) if code == 404 => Ok(false),
            Ok(_) => Ok(true),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("head object {}", key)),
        }
    }

    fn initiate(&self, key: &str) -> Result<String> {
        let response = self
            .bucket
            .initiate_multipart_upload(key, CONTENT_TYPE)
            .with_context(|| format!("initiate multipart upload for {}", key))?;
        Ok(response.upload_id)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &mut dyn Read,
        len: u64,
    ) -> Result<Part> {
        let mut chunk = Vec::with_capacity(len as usize);
        data.read_to_end(&mut chunk)
            .with_context(|| format!("read part {} data", part_number))?;

        let part = self
            .bucket
            .put_multipart_chunk(&chunk, key, part_number, upload_id, CONTENT_TYPE)
            .with_context(|| format!("upload part {} of {}", part_number, key))?;

        Ok(Part {
            number: part.part_number,
            etag: part.etag,
        })
    }

    fn complete(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        let parts: Vec<s3::serde_types::Part> = parts
            .iter()
            .map(|part| s3::serde_types::Part {
                part_number: part.number,
                etag: part.etag.clone(),
            })
            .collect();
        self.bucket
            .complete_multipart_upload(key, upload_id, parts)
            .with_context(|| format!("complete multipart upload for {}", key))?;
        Ok(())
    }

    fn abort(&self, key: &str, upload_id: &str) -> Result<()> {
        self.bucket
            .abort_upload(key, upload_id)
            .with_context(|| format!("abort multipart upload for {}", key))?;
        Ok(())
    }
}

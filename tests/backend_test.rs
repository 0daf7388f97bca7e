//! Push and check against the directory-backed store, plus configuration
//! registry behavior.

use oci2nydus::{
    error, BackendConfig, BlobDescriptor, CancelToken, LocalStore, Uploader,
};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;

fn blob_file(dir: &std::path::Path, bytes: &[u8]) -> (std::path::PathBuf, BlobDescriptor) {
    let path = dir.join("blob");
    let mut file = File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(bytes)));
    (path, BlobDescriptor::new(digest, bytes.len() as u64))
}

#[test]
fn test_push_through_local_store() {
    let scratch = tempfile::tempdir().unwrap();
    let root = scratch.path().join("store");
    let bytes: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let (blob_path, desc) = blob_file(scratch.path(), &bytes);

    let uploader =
        Uploader::new(LocalStore::new(&root).unwrap(), "v1/").with_chunk_size(1024);
    let token = CancelToken::new();

    use oci2nydus::Backend;
    let blob = File::open(&blob_path).unwrap();
    uploader.push(&token, &blob, &desc).unwrap();

    let key = uploader.check(&desc.digest).unwrap();
    assert_eq!(key, format!("v1/{}", desc.digest_hex()));
    assert_eq!(fs::read(root.join(&key)).unwrap(), bytes);

    // pushing identical content again is a no-op
    uploader.push(&token, &blob, &desc).unwrap();
}

#[test]
fn test_check_missing_blob_is_not_found() {
    let scratch = tempfile::tempdir().unwrap();
    let uploader = Uploader::new(LocalStore::new(scratch.path()).unwrap(), "");

    use oci2nydus::Backend;
    let err = uploader.check("sha256:0123").unwrap_err();
    assert!(error::is_not_found(&err));
}

#[test]
fn test_registry_builds_localfs_backend() {
    let scratch = tempfile::tempdir().unwrap();
    let root = scratch.path().join("objects");
    let config = format!(
        r#"{{"type": "localfs", "root": {:?}, "object_prefix": "nydus/"}}"#,
        root.to_str().unwrap()
    );
    let backend = BackendConfig::from_json(config.as_bytes())
        .unwrap()
        .connect()
        .unwrap();
    assert_eq!(backend.kind(), "localfs");

    let bytes = b"tiny blob";
    let (blob_path, desc) = blob_file(scratch.path(), bytes);
    let blob = File::open(&blob_path).unwrap();
    backend.push(&CancelToken::new(), &blob, &desc).unwrap();

    let key = backend.check(&desc.digest).unwrap();
    assert_eq!(fs::read(root.join(key)).unwrap(), bytes);
}

#[test]
fn test_registry_rejects_incomplete_oss_config() {
    let err = BackendConfig::from_json(
        br#"{"type": "oss", "endpoint": "http://localhost:9000", "bucket_name": ""}"#,
    )
    .unwrap_err();
    assert!(format!("{:#}", err).contains("bucket_name"));

    let err = BackendConfig::from_json(
        br#"{"type": "oss", "endpoint": "", "bucket_name": "blobs"}"#,
    )
    .unwrap_err();
    assert!(format!("{:#}", err).contains("endpoint"));
}

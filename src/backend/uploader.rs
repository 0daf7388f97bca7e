//! Chunked multipart upload with content-addressed deduplication and
//! whole-operation retry.
//!
//! [`MultipartStore`] is the wire contract an object store must provide;
//! [`Uploader`] implements the [`Backend`] contract on top of any store:
//! existence short-circuit, fixed-size chunking with an up-front part-count
//! ceiling check, one upload thread per chunk, abort on first failure, and a
//! capped exponential backoff retrying the entire operation. A retry never
//! resumes a previous session; every attempt starts from the existence check
//! with a fresh upload id.

use std::io::Read;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use super::{Backend, BlobDescriptor};
use crate::cancel::CancelToken;
use crate::error::NotFound;
use crate::stream::{CancelReader, ReaderAt, SectionReader};

/// Default multipart chunk size: 500 MiB keeps the part count of any
/// realistic blob far below the store ceiling.
pub const MULTIPART_CHUNK_SIZE: u64 = 500 * 1024 * 1024;

/// Stores commonly refuse multipart uploads at 10000 parts.
pub const MULTIPART_PART_LIMIT: u64 = 10_000;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// One chunk of a blob: `[offset, offset + size)`, 1-based part number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
}

/// Handle returned by a store for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub number: u32,
    pub etag: String,
}

/// Multipart wire operations of an object store.
///
/// Transport, auth and endpoint details live behind this trait; the uploader
/// only relies on these five operations.
pub trait MultipartStore: Send + Sync {
    fn kind(&self) -> &'static str;
    fn exists(&self, key: &str) -> Result<bool>;
    fn initiate(&self, key: &str) -> Result<String>;
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &mut dyn Read,
        len: u64,
    ) -> Result<Part>;
    fn complete(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()>;
    fn abort(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Splits `[0, blob_size)` into `ceil(blob_size / chunk_size)` chunks with no
/// gaps or overlaps, rejecting configurations that would reach the store's
/// part ceiling before any network I/O happens.
pub fn chunk_ranges(blob_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        bail!("chunk size must be positive");
    }
    let count = blob_size.div_ceil(chunk_size);
    if count >= MULTIPART_PART_LIMIT {
        bail!("too many parts ({}), please increase part size", count);
    }

    let mut chunks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * chunk_size;
        chunks.push(Chunk {
            number: i as u32 + 1,
            offset,
            size: chunk_size.min(blob_size - offset),
        });
    }
    Ok(chunks)
}

/// [`Backend`] implementation over any [`MultipartStore`].
pub struct Uploader<S: MultipartStore> {
    store: S,
    object_prefix: String,
    chunk_size: u64,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<S: MultipartStore> Uploader<S> {
    pub fn new(store: S, object_prefix: impl Into<String>) -> Self {
        Uploader {
            store,
            object_prefix: object_prefix.into(),
            chunk_size: MULTIPART_CHUNK_SIZE,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Object keys are content-addressed: `prefix + hex(digest)`, so key
    /// existence implies byte-identical content.
    fn object_key(&self, digest: &str) -> String {
        let hex = match digest.split_once(':') {
            Some((_, hex)) => hex,
            None => digest,
        };
        format!("{}{}", self.object_prefix, hex)
    }

    /// One complete push attempt. The multipart session created here is
    /// completed or aborted before returning, never left dangling.
    fn push_once(
        &self,
        token: &CancelToken,
        blob: &(dyn ReaderAt + Sync),
        desc: &BlobDescriptor,
    ) -> Result<()> {
        token.check()?;

        let key = self.object_key(&desc.digest);
        if self
            .store
            .exists(&key)
            .context("check object existence")?
        {
            log::debug!("blob {} already exists, skipping upload", desc.digest);
            return Ok(());
        }

        let chunks = chunk_ranges(desc.size, self.chunk_size).context("split blob by part size")?;

        let upload_id = self
            .store
            .initiate(&key)
            .context("initiate multipart upload")?;

        // One thread per chunk; a failing chunk cancels its in-flight
        // siblings through the child token without touching the caller's.
        let part_token = token.child();
        let results: Vec<Result<Part>> = thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .iter()
                .map(|chunk| {
                    let chunk = *chunk;
                    let part_token = &part_token;
                    let store = &self.store;
                    let key = key.as_str();
                    let upload_id = upload_id.as_str();
                    scope.spawn(move || -> Result<Part> {
                        part_token.check()?;
                        let section = SectionReader::new(blob, chunk.offset, chunk.size);
                        let mut data = CancelReader::new(part_token, section);
                        let result = store
                            .upload_part(key, upload_id, chunk.number, &mut data, chunk.size)
                            .with_context(|| format!("upload part {}", chunk.number));
                        if result.is_err() {
                            part_token.cancel();
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("upload thread panicked")))
                })
                .collect()
        });

        let mut parts = Vec::with_capacity(results.len());
        let mut first_err: Option<anyhow::Error> = None;
        for result in results {
            match result {
                Ok(part) => parts.push(part),
                Err(err) => {
                    // keep the causal failure, not a sibling canceled by it
                    let replace = match &first_err {
                        None => true,
                        Some(kept) => {
                            crate::error::is_canceled(kept) && !crate::error::is_canceled(&err)
                        }
                    };
                    if replace {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            if let Err(abort_err) = self.store.abort(&key, &upload_id) {
                log::warn!("abort multipart upload {}: {:#}", upload_id, abort_err);
            }
            return Err(err.context("uploading parts failed"));
        }

        parts.sort_by_key(|part| part.number);
        self.store
            .complete(&key, &upload_id, &parts)
            .context("complete multipart upload")?;

        Ok(())
    }
}

impl<S: MultipartStore> Backend for Uploader<S> {
    /// Pushes the blob, retrying the whole operation with exponential
    /// backoff. A late chunk failure restarts from the existence check; it
    /// never resumes mid-upload.
    fn push(
        &self,
        token: &CancelToken,
        blob: &(dyn ReaderAt + Sync),
        desc: &BlobDescriptor,
    ) -> Result<()> {
        let mut backoff = self.backoff_base;
        loop {
            let err = match self.push_once(token, blob, desc) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if let Err(state) = token.check() {
                if crate::error::is_canceled(&err) {
                    return Err(err);
                }
                return Err(anyhow::Error::new(state)
                    .context(format!("push {} canceled", desc.digest)));
            }

            log::warn!("push {} failed: {:#}", desc.digest, err);
            if backoff >= self.backoff_cap {
                return Err(err);
            }
            log::warn!("retrying in {:?}", backoff);
            thread::sleep(backoff);
            backoff *= 2;
        }
    }

    fn check(&self, digest: &str) -> Result<String> {
        let key = self.object_key(digest);
        if self
            .store
            .exists(&key)
            .context("check object existence")?
        {
            Ok(key)
        } else {
            Err(NotFound.into())
        }
    }

    fn kind(&self) -> &'static str {
        self.store.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Calls {
        exists: u32,
        initiate: u32,
        uploads: Vec<u32>,
        completes: u32,
        completed_parts: Vec<Part>,
        aborts: u32,
        part_data: HashMap<u32, Vec<u8>>,
    }

    #[derive(Default)]
    struct FakeStore {
        present: bool,
        fail_initiate: bool,
        fail_part: Option<u32>,
        calls: Mutex<Calls>,
    }

    impl MultipartStore for FakeStore {
        fn kind(&self) -> &'static str {
            "fake"
        }

        fn exists(&self, _key: &str) -> Result<bool> {
            self.calls.lock().unwrap().exists += 1;
            Ok(self.present)
        }

        fn initiate(&self, _key: &str) -> Result<String> {
            self.calls.lock().unwrap().initiate += 1;
            if self.fail_initiate {
                bail!("initiate refused");
            }
            Ok("upload-1".to_string())
        }

        fn upload_part(
            &self,
            _key: &str,
            _upload_id: &str,
            part_number: u32,
            data: &mut dyn Read,
            len: u64,
        ) -> Result<Part> {
            if self.fail_part == Some(part_number) {
                self.calls.lock().unwrap().uploads.push(part_number);
                bail!("part {} refused", part_number);
            }
            let mut bytes = Vec::with_capacity(len as usize);
            data.read_to_end(&mut bytes)?;
            let mut calls = self.calls.lock().unwrap();
            calls.uploads.push(part_number);
            calls.part_data.insert(part_number, bytes);
            Ok(Part {
                number: part_number,
                etag: format!("etag-{}", part_number),
            })
        }

        fn complete(&self, _key: &str, _upload_id: &str, parts: &[Part]) -> Result<()> {
            let mut calls = self.calls.lock().unwrap();
            calls.completes += 1;
            calls.completed_parts = parts.to_vec();
            Ok(())
        }

        fn abort(&self, _key: &str, _upload_id: &str) -> Result<()> {
            self.calls.lock().unwrap().aborts += 1;
            Ok(())
        }
    }

    fn single_attempt<S: MultipartStore>(store: S) -> Uploader<S> {
        // base >= cap stops the retry loop after the first attempt
        Uploader::new(store, "blobs/")
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1))
    }

    fn desc(blob: &[u8]) -> BlobDescriptor {
        BlobDescriptor::new("sha256:cafebabe", blob.len() as u64)
    }

    #[test]
    fn test_chunk_ranges_partition_exactly() {
        for (size, chunk) in [(0u64, 5u64), (10, 3), (10, 10), (10, 4), (1, 100)] {
            let chunks = chunk_ranges(size, chunk).unwrap();
            assert_eq!(chunks.len() as u64, size.div_ceil(chunk), "size {}", size);
            let mut cursor = 0;
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.number as usize, i + 1);
                assert_eq!(c.offset, cursor);
                assert!(c.size > 0);
                cursor += c.size;
            }
            assert_eq!(cursor, size);
        }
    }

    #[test]
    fn test_chunk_ranges_rejects_part_ceiling() {
        assert!(chunk_ranges(MULTIPART_PART_LIMIT * 4, 4).is_err());
        assert!(chunk_ranges((MULTIPART_PART_LIMIT - 1) * 4, 4).is_ok());
        assert!(chunk_ranges(10, 0).is_err());
    }

    #[test]
    fn test_push_short_circuits_on_existing_object() {
        let uploader = single_attempt(FakeStore {
            present: true,
            ..Default::default()
        });
        let blob = b"content".as_slice();
        uploader
            .push(&CancelToken::new(), &blob, &desc(blob))
            .unwrap();
        let calls = uploader.store.calls.lock().unwrap();
        assert_eq!(calls.exists, 1);
        assert_eq!(calls.initiate, 0);
        assert!(calls.uploads.is_empty());
    }

    #[test]
    fn test_push_uploads_every_chunk_and_completes_once() {
        let uploader = single_attempt(FakeStore::default()).with_chunk_size(3);
        let blob = b"abcdefgh".as_slice();
        uploader
            .push(&CancelToken::new(), &blob, &desc(blob))
            .unwrap();

        let calls = uploader.store.calls.lock().unwrap();
        assert_eq!(calls.completes, 1);
        assert_eq!(calls.aborts, 0);
        let numbers: Vec<u32> = calls.completed_parts.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let mut joined = Vec::new();
        for number in numbers {
            joined.extend_from_slice(&calls.part_data[&number]);
        }
        assert_eq!(joined, blob);
    }

    #[test]
    fn test_push_empty_blob() {
        let uploader = single_attempt(FakeStore::default());
        let blob = b"".as_slice();
        uploader
            .push(&CancelToken::new(), &blob, &desc(blob))
            .unwrap();
        let calls = uploader.store.calls.lock().unwrap();
        assert_eq!(calls.initiate, 1);
        assert_eq!(calls.completes, 1);
        assert!(calls.completed_parts.is_empty());
    }

    #[test]
    fn test_part_failure_aborts_session() {
        let uploader = single_attempt(FakeStore {
            fail_part: Some(2),
            ..Default::default()
        })
        .with_chunk_size(2);
        let blob = b"abcdef".as_slice();
        let err = uploader
            .push(&CancelToken::new(), &blob, &desc(blob))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("uploading parts failed"));

        let calls = uploader.store.calls.lock().unwrap();
        assert_eq!(calls.aborts, 1);
        assert_eq!(calls.completes, 0);
    }

    #[test]
    fn test_backoff_sequence_attempts() {
        // base 10ms, cap 80ms: attempts at 0, 10, 30, 70 ms, then stop
        let uploader = Uploader::new(
            FakeStore {
                fail_initiate: true,
                ..Default::default()
            },
            "",
        )
        .with_backoff(Duration::from_millis(10), Duration::from_millis(80));
        let blob = b"x".as_slice();

        let started = Instant::now();
        let err = uploader
            .push(&CancelToken::new(), &blob, &desc(blob))
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(format!("{:#}", err).contains("initiate"));
        assert_eq!(uploader.store.calls.lock().unwrap().initiate, 4);
        assert!(elapsed >= Duration::from_millis(70));
    }

    #[test]
    fn test_cancel_mid_retry_is_distinct() {
        let uploader = Uploader::new(
            FakeStore {
                fail_initiate: true,
                ..Default::default()
            },
            "",
        )
        .with_backoff(Duration::from_millis(20), Duration::from_secs(60));
        let blob = b"x".as_slice();

        let token = CancelToken::new();
        let canceler = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                token.cancel();
            })
        };

        let err = uploader.push(&token, &blob, &desc(blob)).unwrap_err();
        canceler.join().unwrap();
        assert!(
            crate::error::is_canceled(&err),
            "expected cancellation flavor, got: {:#}",
            err
        );
    }

    #[test]
    fn test_check_distinguishes_not_found() {
        let uploader = single_attempt(FakeStore::default());
        let err = uploader.check("sha256:cafebabe").unwrap_err();
        assert!(crate::error::is_not_found(&err));

        let uploader = single_attempt(FakeStore {
            present: true,
            ..Default::default()
        });
        assert_eq!(
            uploader.check("sha256:cafebabe").unwrap(),
            "blobs/cafebabe"
        );
    }
}

//! Layer conversion and merge pipelines.
//!
//! [`NydusConverter::convert`] turns one OCI layer tar stream into a nydus
//! tar blob: the caller writes the OCI stream into the returned
//! [`ConvertStream`] and calls [`ConvertStream::finish`], which is the
//! synchronization barrier — it blocks until the conversion has fully
//! completed and its result is the only reliable success signal. Internally
//! the stream feeds an extraction thread over an OS pipe, the extracted tree
//! is handed to the external builder once extraction has fully finished, and
//! the builder's blob bytes are drained out of a named pipe into the
//! destination while the builder runs, so peak disk usage stays bounded to
//! metadata.
//!
//! [`NydusConverter::merge`] combines per-layer bootstraps into one overlay
//! bootstrap: every layer's bootstrap is recovered concurrently (full
//! barrier), then the merge tool runs exactly once with the bootstrap paths
//! in caller-supplied layer order. Order is semantically significant: upper
//! layers win on conflicting paths.
//!
//! Both operations own a private scoped working directory that is removed on
//! every exit path, and both report the first error encountered, discarding
//! later ones.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::locator;
use crate::stream::{CancelReader, ReaderAt};
use crate::tool::{FsVersion, NydusImage, NydusTool, ToolConvertArgs, ToolMergeArgs};
use crate::untar;

/// One already-converted layer, identified by the digest of its whole nydus
/// tar blob. The pipeline only borrows read access; the caller owns the
/// content's lifetime.
pub struct Layer<'a> {
    /// Hash of the whole nydus tar blob, `sha256:<hex>`.
    pub digest: String,
    /// Hash of the pre-conversion OCI tar(.gz) blob, when known.
    pub original_digest: Option<String>,
    /// Random-access reader over the whole blob.
    pub content: &'a (dyn ReaderAt + Sync),
}

impl Layer<'_> {
    /// Hex part of the digest, used to name per-layer scratch files.
    pub fn digest_hex(&self) -> &str {
        match self.digest.split_once(':') {
            Some((_, hex)) => hex,
            None => &self.digest,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Root for the scoped working directory; falls back to `NYDUS_WORKDIR`,
    /// then the system temp dir.
    pub work_dir: Option<PathBuf>,
    pub fs_version: FsVersion,
    /// Bootstrap of a chunk dict image for data deduplication.
    pub chunk_dict: Option<PathBuf>,
    /// File path patterns to prefetch.
    pub prefetch_patterns: Vec<String>,
    /// Overall builder deadline; the subprocess is killed on expiry.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub work_dir: Option<PathBuf>,
    pub chunk_dict: Option<PathBuf>,
    pub prefetch_patterns: Vec<String>,
    /// Wrap the merged bootstrap in a tar stream instead of raw bytes.
    pub with_tar: bool,
    pub timeout: Option<Duration>,
}

/// Scoped working directory for one conversion or merge.
fn scoped_workdir(explicit: Option<&Path>) -> Result<TempDir> {
    let root = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(crate::tool::ENV_NYDUS_WORKDIR).map(PathBuf::from));

    let mut builder = tempfile::Builder::new();
    builder.prefix("nydus-converter-");
    match root {
        Some(root) => {
            fs::create_dir_all(&root)
                .with_context(|| format!("create work root {}", root.display()))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .context("create work directory")
}

/// Converts OCI layers to nydus format and merges the results, driving the
/// external builder `B`.
pub struct NydusConverter<B: NydusTool = NydusImage> {
    tool: B,
}

impl NydusConverter<NydusImage> {
    /// Converter using the `nydus-image` binary resolved from the
    /// environment.
    pub fn from_env() -> Self {
        NydusConverter::new(NydusImage::from_env())
    }
}

impl<B: NydusTool> NydusConverter<B> {
    pub fn new(tool: B) -> Self {
        NydusConverter { tool }
    }

    /// The injected builder tool.
    pub fn tool(&self) -> &B {
        &self.tool
    }

    /// Starts one layer conversion. Write the OCI tar stream (plain or
    /// gzipped) into the returned [`ConvertStream`], then call `finish` —
    /// the destination must be discarded if `finish` fails.
    pub fn convert<W: Write + Send>(
        &self,
        token: &CancelToken,
        dest: W,
        options: ConvertOptions,
    ) -> Result<ConvertStream<'_, B, W>> {
        let work_dir = scoped_workdir(options.work_dir.as_deref())?;
        let source_dir = work_dir.path().join("source");
        fs::create_dir_all(&source_dir).context("create source directory")?;

        let (reader, writer) = io::pipe().context("create unpack pipe")?;

        let unpack_token = token.clone();
        let unpack_dir = source_dir.clone();
        let unpack = thread::spawn(move || {
            untar::unpack_oci_tar(CancelReader::new(&unpack_token, reader), &unpack_dir)
                .with_context(|| format!("unpack to {}", unpack_dir.display()))
        });

        Ok(ConvertStream {
            tool: &self.tool,
            token: token.clone(),
            options,
            work_dir,
            source_dir,
            writer: Some(writer),
            unpack: Some(unpack),
            dest: Some(dest),
        })
    }

    /// Merges the bootstraps of `layers` (bottom-most first) into one
    /// overlay bootstrap written to `dest`.
    pub fn merge<W: Write>(
        &self,
        token: &CancelToken,
        layers: &[Layer<'_>],
        dest: &mut W,
        options: MergeOptions,
    ) -> Result<()> {
        if layers.is_empty() {
            bail!("no layers to merge");
        }

        let work_dir = scoped_workdir(options.work_dir.as_deref())?;

        // Per-layer scratch files named by blob digest, extracted
        // concurrently. All of them must land before the merge tool runs.
        let source_bootstraps: Vec<PathBuf> = layers
            .iter()
            .map(|layer| work_dir.path().join(layer.digest_hex()))
            .collect();

        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = layers
                .iter()
                .zip(&source_bootstraps)
                .map(|(layer, path)| {
                    scope.spawn(move || -> Result<()> {
                        token.check()?;
                        let mut bootstrap = File::create(path).with_context(|| {
                            format!("create source bootstrap {}", path.display())
                        })?;
                        locator::unpack_bootstrap(&layer.content, &mut bootstrap)
                            .with_context(|| format!("unpack layer {}", layer.digest))?;
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("bootstrap extraction thread panicked")))
                })
                .collect()
        });
        for result in results {
            result.context("unpack all bootstraps")?;
        }

        token.check()?;
        let target_bootstrap = work_dir.path().join("bootstrap");
        self.tool
            .merge(&ToolMergeArgs {
                source_bootstraps,
                target_bootstrap: target_bootstrap.clone(),
                chunk_dict: options.chunk_dict.clone(),
                prefetch_patterns: options.prefetch_patterns.clone(),
                timeout: options.timeout,
            })
            .context("merge bootstrap")?;

        if options.with_tar {
            pack_to_tar(
                &target_bootstrap,
                &format!("image/{}", locator::BOOTSTRAP_NAME_IN_TAR),
                dest,
            )
            .context("pack bootstrap to tar")?;
        } else {
            let bootstrap = File::open(&target_bootstrap).context("open target bootstrap")?;
            let mut reader = CancelReader::new(token, bootstrap);
            io::copy(&mut reader, dest).context("copy merged bootstrap")?;
        }

        Ok(())
    }
}

/// Sink for one layer conversion. `finish` is the barrier: it joins the
/// extraction, runs the builder against a named pipe, and drains the blob
/// into the destination.
pub struct ConvertStream<'a, B: NydusTool, W: Write + Send> {
    tool: &'a B,
    token: CancelToken,
    options: ConvertOptions,
    work_dir: TempDir,
    source_dir: PathBuf,
    writer: Option<io::PipeWriter>,
    unpack: Option<JoinHandle<Result<()>>>,
    dest: Option<W>,
}

impl<B: NydusTool, W: Write + Send> Write for ConvertStream<'_, B, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.writer {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "conversion stream already finished",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<B: NydusTool, W: Write + Send> ConvertStream<'_, B, W> {
    /// Completes the conversion and returns the destination. Blocks until
    /// extraction, the builder and the blob copy have all finished; the
    /// first error wins and the destination must be discarded on failure.
    pub fn finish(mut self) -> Result<W> {
        // Close the caller side. The extractor stops at the tar trailer for
        // well-formed input; for truncated input it now sees EOF and fails
        // instead of blocking.
        drop(self.writer.take());

        let unpack = self.unpack.take().expect("finish consumes the stream");
        match unpack.join() {
            Ok(result) => result?,
            Err(_) => bail!("unpack thread panicked"),
        }

        let blob_path = self.work_dir.path().join("blob");
        nix::unistd::mkfifo(&blob_path, nix::sys::stat::Mode::from_bits_truncate(0o644))
            .context("create blob fifo")?;

        // FIFO open order: a nonblocking probe reader lets the sentinel
        // writer open without a blocked peer; holding the sentinel keeps the
        // blocking reader from seeing EOF until the builder has exited, no
        // matter whether the builder ever opens the pipe.
        let probe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&blob_path)
            .context("open blob fifo probe")?;
        let sentinel = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&blob_path)
            .context("open blob fifo sentinel")?;
        let blob = File::open(&blob_path).context("open blob fifo")?;
        drop(probe);

        let mut dest = self.dest.take().expect("finish consumes the stream");
        let token = self.token.clone();

        let (build_result, copy_result) = thread::scope(|scope| {
            let copier = scope.spawn(|| -> Result<u64> {
                let mut reader = CancelReader::new(&token, io::BufReader::new(blob));
                io::copy(&mut reader, &mut dest).context("pack nydus tar")
            });

            let build_result = self.tool.convert(&ToolConvertArgs {
                source_dir: self.source_dir.clone(),
                blob_path: blob_path.clone(),
                fs_version: self.options.fs_version,
                chunk_dict: self.options.chunk_dict.clone(),
                prefetch_patterns: self.options.prefetch_patterns.clone(),
                timeout: self.options.timeout,
            });
            drop(sentinel);

            let copy_result = copier
                .join()
                .unwrap_or_else(|_| Err(anyhow!("blob copy thread panicked")));
            (build_result, copy_result)
        });

        if let Err(build_err) = build_result {
            // A canceled copy tears down the builder's pipe; report the
            // cause, not the symptom.
            return Err(match copy_result {
                Err(copy_err) if crate::error::is_canceled(&copy_err) => copy_err,
                _ => {
                    build_err.context(format!("convert blob for {}", self.source_dir.display()))
                }
            });
        }
        copy_result?;

        Ok(dest)
    }
}

/// Writes `src` into `dest` as a synthetic tar stream: one directory entry
/// plus one file entry named `name`.
fn pack_to_tar<W: Write>(src: &Path, name: &str, dest: &mut W) -> Result<()> {
    let file = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let size = file.metadata().context("stat bootstrap")?.len();

    let dir_name = Path::new(name)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("");

    let mut builder = tar_rs::Builder::new(&mut *dest);

    if !dir_name.is_empty() {
        let mut dir = tar_rs::Header::new_gnu();
        dir.set_path(format!("{}/", dir_name))
            .context("set directory entry path")?;
        dir.set_entry_type(tar_rs::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder
            .append(&dir, io::empty())
            .context("write directory entry")?;
    }

    let mut header = tar_rs::Header::new_gnu();
    header.set_path(name).context("set file entry path")?;
    header.set_mode(0o444);
    header.set_size(size);
    header.set_cksum();
    builder.append(&header, file).context("write file entry")?;

    builder.finish().context("finish tar stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_layer_digest_hex() {
        let content: &[u8] = b"";
        let layer = Layer {
            digest: "sha256:deadbeef".to_string(),
            original_digest: None,
            content: &content,
        };
        assert_eq!(layer.digest_hex(), "deadbeef");

        let bare = Layer {
            digest: "cafe".to_string(),
            original_digest: None,
            content: &content,
        };
        assert_eq!(bare.digest_hex(), "cafe");
    }

    #[test]
    fn test_pack_to_tar_shape() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bootstrap");
        fs::write(&src, b"superblock").unwrap();

        let mut out = Vec::new();
        pack_to_tar(&src, "image/image.boot", &mut out).unwrap();

        let mut archive = tar_rs::Archive::new(out.as_slice());
        let mut entries = archive.entries().unwrap();

        let dir_entry = entries.next().unwrap().unwrap();
        assert_eq!(
            dir_entry.header().entry_type(),
            tar_rs::EntryType::Directory
        );
        assert_eq!(dir_entry.path().unwrap(), Path::new("image/"));

        let mut file_entry = entries.next().unwrap().unwrap();
        assert_eq!(file_entry.path().unwrap(), Path::new("image/image.boot"));
        let mut content = Vec::new();
        file_entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"superblock");

        assert!(entries.next().is_none());
    }

    #[test]
    fn test_scoped_workdir_explicit_root() {
        let root = tempfile::tempdir().unwrap();
        let explicit = root.path().join("work");
        let work_dir = scoped_workdir(Some(&explicit)).unwrap();
        assert!(work_dir.path().starts_with(&explicit));
        let kept = work_dir.path().to_path_buf();
        drop(work_dir);
        assert!(!kept.exists());
    }
}

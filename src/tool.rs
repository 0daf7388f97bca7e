//! The external image builder, behind a trait so tests can substitute a
//! deterministic double.
//!
//! The builder is a black box to this crate: it reads an extracted source
//! tree (or a set of per-layer bootstraps) and produces nydus metadata plus a
//! blob stream. [`NydusImage`] drives the real `nydus-image` binary; the
//! binary path comes from `NYDUS_BUILDER` when set.

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use wait_timeout::ChildExt;

pub const ENV_NYDUS_BUILDER: &str = "NYDUS_BUILDER";
pub const ENV_NYDUS_WORKDIR: &str = "NYDUS_WORKDIR";

/// Nydus RAFS format version. V6 is EROFS-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsVersion {
    V5,
    #[default]
    V6,
}

impl FsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsVersion::V5 => "5",
            FsVersion::V6 => "6",
        }
    }
}

/// Arguments for one layer conversion: build `source_dir` into metadata plus
/// a blob streamed to `blob_path` (a named pipe in the pipeline).
#[derive(Debug, Clone)]
pub struct ToolConvertArgs {
    pub source_dir: PathBuf,
    pub blob_path: PathBuf,
    pub fs_version: FsVersion,
    pub chunk_dict: Option<PathBuf>,
    pub prefetch_patterns: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Arguments for one merge: combine `source_bootstraps` (bottom-most layer
/// first; order decides who wins on conflicting paths) into
/// `target_bootstrap`.
#[derive(Debug, Clone)]
pub struct ToolMergeArgs {
    pub source_bootstraps: Vec<PathBuf>,
    pub target_bootstrap: PathBuf,
    pub chunk_dict: Option<PathBuf>,
    pub prefetch_patterns: Vec<String>,
    pub timeout: Option<Duration>,
}

/// External builder capability. Nonzero exit or a failed spawn is a hard
/// failure; retry policy belongs to the caller.
pub trait NydusTool {
    fn convert(&self, args: &ToolConvertArgs) -> Result<()>;
    fn merge(&self, args: &ToolMergeArgs) -> Result<()>;
}

/// The real `nydus-image` binary.
pub struct NydusImage {
    binary: PathBuf,
}

impl NydusImage {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        NydusImage {
            binary: binary.into(),
        }
    }

    /// Binary path from `NYDUS_BUILDER`, falling back to `nydus-image` on
    /// `PATH`.
    pub fn from_env() -> Self {
        let binary = std::env::var_os(ENV_NYDUS_BUILDER)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("nydus-image"));
        NydusImage::new(binary)
    }

    fn run(
        &self,
        args: Vec<OsString>,
        stdin_data: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        log::debug!("executing: {} {:?}", self.binary.display(), args);

        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn builder {}", self.binary.display()))?;

        if let Some(data) = stdin_data {
            use std::io::Write;
            let mut stdin = child.stdin.take().context("open builder stdin")?;
            stdin
                .write_all(data.as_bytes())
                .context("write prefetch patterns to builder stdin")?;
            // dropping closes the pipe so the builder sees EOF
        }

        // Drain stderr concurrently so a chatty builder cannot block on a
        // full pipe while we wait on it.
        let stderr = child.stderr.take();
        let drain = std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text);
            }
            text
        });

        let status = match timeout {
            Some(timeout) => match child
                .wait_timeout(timeout)
                .context("wait for builder with timeout")?
            {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    bail!(
                        "builder {} timed out after {:?}",
                        self.binary.display(),
                        timeout
                    );
                }
            },
            None => child.wait().context("wait for builder")?,
        };

        let stderr_text = drain.join().unwrap_or_default();
        if !status.success() {
            bail!(
                "builder {} failed with {}: {}",
                self.binary.display(),
                status,
                stderr_text.trim()
            );
        }
        Ok(())
    }
}

impl NydusTool for NydusImage {
    fn convert(&self, args: &ToolConvertArgs) -> Result<()> {
        let mut argv: Vec<OsString> = vec![
            "create".into(),
            "--log-level".into(),
            "warn".into(),
            "--fs-version".into(),
            args.fs_version.as_str().into(),
            "--source-type".into(),
            "directory".into(),
            "--whiteout-spec".into(),
            "oci".into(),
            "--inline-bootstrap".into(),
            "--blob".into(),
            args.blob_path.clone().into(),
        ];
        if let Some(chunk_dict) = &args.chunk_dict {
            argv.push("--chunk-dict".into());
            let mut value = OsString::from("bootstrap=");
            value.push(chunk_dict);
            argv.push(value);
        }
        let stdin_data = if args.prefetch_patterns.is_empty() {
            None
        } else {
            argv.push("--prefetch-policy".into());
            argv.push("fs".into());
            Some(args.prefetch_patterns.join("\n"))
        };
        argv.push(args.source_dir.clone().into());

        self.run(argv, stdin_data, args.timeout)
            .with_context(|| format!("convert source {}", args.source_dir.display()))
    }

    fn merge(&self, args: &ToolMergeArgs) -> Result<()> {
        let mut argv: Vec<OsString> = vec![
            "merge".into(),
            "--log-level".into(),
            "warn".into(),
            "--bootstrap".into(),
            args.target_bootstrap.clone().into(),
        ];
        if let Some(chunk_dict) = &args.chunk_dict {
            argv.push("--chunk-dict".into());
            let mut value = OsString::from("bootstrap=");
            value.push(chunk_dict);
            argv.push(value);
        }
        let stdin_data = if args.prefetch_patterns.is_empty() {
            None
        } else {
            argv.push("--prefetch-policy".into());
            argv.push("fs".into());
            Some(args.prefetch_patterns.join("\n"))
        };
        for bootstrap in &args.source_bootstraps {
            argv.push(bootstrap.clone().into());
        }

        self.run(argv, stdin_data, args.timeout)
            .with_context(|| format!("merge {} bootstraps", args.source_bootstraps.len()))
    }
}

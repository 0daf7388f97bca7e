//! Shared helpers: a deterministic stand-in for the external builder and
//! constructors for synthetic nydus blobs.

use anyhow::{Context, Result};
use oci2nydus::tool::{NydusTool, ToolConvertArgs, ToolMergeArgs};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::sync::Mutex;

/// One `[data][512-byte header]` member pair in the nydus tar layout.
pub fn member(name: &str, data: &[u8]) -> Vec<u8> {
    let mut header = tar_rs::Header::new_gnu();
    header.set_path(name).unwrap();
    header.set_size(data.len() as u64);
    header.set_mode(0o444);
    header.set_cksum();

    let mut out = data.to_vec();
    out.extend_from_slice(header.as_bytes());
    out
}

/// A minimal nydus tar blob: a data member followed by the bootstrap.
pub fn nydus_blob(data: &[u8], bootstrap: &[u8]) -> Vec<u8> {
    let mut blob = member("image.blob", data);
    blob.extend_from_slice(&member("image.boot", bootstrap));
    blob
}

/// Deterministic builder double.
///
/// `convert` walks the extracted source tree and emits a nydus blob whose
/// bootstrap is the newline-joined listing of relative paths and whose data
/// member is the concatenated file contents, both in walk order. `merge`
/// treats each source bootstrap as `path=layer` lines where later layers win
/// on conflicting paths, and records the order of every invocation.
#[derive(Default)]
pub struct FakeTool {
    pub merge_calls: Mutex<Vec<Vec<String>>>,
}

impl FakeTool {
    pub fn new() -> Self {
        FakeTool::default()
    }
}

impl NydusTool for FakeTool {
    fn convert(&self, args: &ToolConvertArgs) -> Result<()> {
        let mut paths = Vec::new();
        let mut data = Vec::new();

        for entry in walkdir::WalkDir::new(&args.source_dir).sort_by_file_name() {
            let entry = entry.context("walk source tree")?;
            if entry.path() == args.source_dir {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&args.source_dir)
                .context("strip source prefix")?
                .to_string_lossy()
                .into_owned();
            if entry.file_type().is_dir() {
                paths.push(format!("{}/", rel));
            } else if entry.file_type().is_file() {
                data.extend(fs::read(entry.path()).context("read source file")?);
                paths.push(rel);
            } else {
                paths.push(rel);
            }
        }

        let bootstrap = paths.join("\n");
        let blob = nydus_blob(&data, bootstrap.as_bytes());

        let mut out = File::create(&args.blob_path).context("open blob output")?;
        out.write_all(&blob).context("write blob output")?;
        Ok(())
    }

    fn merge(&self, args: &ToolMergeArgs) -> Result<()> {
        self.merge_calls.lock().unwrap().push(
            args.source_bootstraps
                .iter()
                .map(|path| {
                    path.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default()
                })
                .collect(),
        );

        let mut winners: BTreeMap<String, String> = BTreeMap::new();
        for path in &args.source_bootstraps {
            let content = fs::read_to_string(path).context("read source bootstrap")?;
            for line in content.lines().filter(|line| !line.is_empty()) {
                match line.split_once('=') {
                    Some((path, layer)) => winners.insert(path.to_string(), layer.to_string()),
                    None => winners.insert(line.to_string(), String::new()),
                };
            }
        }

        let merged = winners
            .iter()
            .map(|(path, layer)| {
                if layer.is_empty() {
                    path.clone()
                } else {
                    format!("{}={}", path, layer)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(&args.target_bootstrap, merged).context("write target bootstrap")?;
        Ok(())
    }
}

//! Object store rooted at a local directory.
//!
//! Objects live at `<root>/<key>`; multipart sessions stage their parts
//! under `<root>/.uploads/<upload id>/` and completion concatenates them in
//! part order into a scratch file that is renamed into place, so a reader
//! never observes a half-written object. Useful on its own for air-gapped
//! setups and as the reference store in tests.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use super::uploader::{MultipartStore, Part};
use crate::stream::ActionWriter;

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create store root {}", root.display()))?;
        Ok(LocalStore { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(".uploads")
    }

    fn session_dir(&self, upload_id: &str) -> Result<PathBuf> {
        if upload_id.is_empty() || upload_id.contains('/') || upload_id.contains("..") {
            bail!("invalid upload id {:?}", upload_id);
        }
        Ok(self.staging_root().join(upload_id))
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> Result<PathBuf> {
        Ok(self
            .session_dir(upload_id)?
            .join(format!("part-{:05}", part_number)))
    }
}

impl MultipartStore for LocalStore {
    fn kind(&self) -> &'static str {
        "localfs"
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key).is_file())
    }

    fn initiate(&self, key: &str) -> Result<String> {
        let staging = self.staging_root();
        fs::create_dir_all(&staging)
            .with_context(|| format!("create staging root {}", staging.display()))?;
        let session = tempfile::Builder::new()
            .prefix("multipart-")
            .tempdir_in(&staging)
            .context("create multipart session directory")?;
        log::debug!("initiated multipart session for {}", key);
        // the session outlives this call; it is removed on complete/abort
        let path = session.keep();
        let upload_id = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("derive upload id from session directory")?
            .to_string();
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: &mut dyn Read,
        len: u64,
    ) -> Result<Part> {
        let path = self.part_path(upload_id, part_number)?;
        let file = File::create(&path)
            .with_context(|| format!("create part file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let written = io::copy(data, &mut writer)
            .with_context(|| format!("write part file {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flush part file {}", path.display()))?;
        if written != len {
            bail!(
                "part {} is {} bytes, expected {}",
                part_number,
                written,
                len
            );
        }
        Ok(Part {
            number: part_number,
            etag: format!("part-{:05}-{}", part_number, written),
        })
    }

    fn complete(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        let session = self.session_dir(upload_id)?;
        let object = self.object_path(key);
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create object directory {}", parent.display()))?;
        }

        // Assemble into a scratch file inside the session, then publish with
        // a rename once the last byte is flushed.
        let scratch = session.join("object");
        let file = File::create(&scratch)
            .with_context(|| format!("create scratch object {}", scratch.display()))?;
        let mut writer = ActionWriter::new(BufWriter::new(file), || {
            fs::rename(&scratch, &object)
                .with_context(|| format!("publish object {}", object.display()))
        });

        for part in parts {
            let path = self.part_path(upload_id, part.number)?;
            let mut part_file = File::open(&path)
                .with_context(|| format!("open part file {}", path.display()))?;
            io::copy(&mut part_file, &mut writer)
                .with_context(|| format!("assemble part {}", part.number))?;
        }
        writer.finish()?;

        fs::remove_dir_all(&session)
            .with_context(|| format!("remove session directory {}", session.display()))?;
        Ok(())
    }

    fn abort(&self, _key: &str, upload_id: &str) -> Result<()> {
        let session = self.session_dir(upload_id)?;
        if session.exists() {
            fs::remove_dir_all(&session)
                .with_context(|| format!("remove session directory {}", session.display()))?;
        }
        Ok(())
    }
}

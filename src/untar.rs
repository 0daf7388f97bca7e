//! Streamed extraction of an OCI layer tar into a working tree.
//!
//! The conversion pipeline feeds this from the caller-side pipe: the stream
//! is sniffed for gzip magic and decompressed on the fly, entries are
//! extracted with paths normalized so nothing escapes the destination root,
//! and hardlinks/symlinks are resolved in a second pass once their targets
//! exist.
//!
//! Whiteout markers (`.wh.` files) are extracted verbatim: they refer to
//! lower layers, and the image builder consumes them with the OCI whiteout
//! spec. Applying them here would be wrong for a single-layer source tree.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// Normalizes an archive path for extraction under a root directory.
/// Parent components cannot climb above the root; absolute prefixes are
/// dropped.
fn normalize_tar_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    out
}

fn is_whiteout(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(".wh."))
        .unwrap_or(false)
}

struct PendingLink {
    dest: PathBuf,
    target: PathBuf,
    symlink: bool,
}

fn remove_existing(dest: &Path) -> Result<()> {
    // symlink_metadata so broken symlinks are still detected
    if let Ok(metadata) = fs::symlink_metadata(dest) {
        if metadata.is_dir() {
            fs::remove_dir_all(dest)
                .with_context(|| format!("remove existing directory {}", dest.display()))?;
        } else {
            fs::remove_file(dest)
                .with_context(|| format!("remove existing file {}", dest.display()))?;
        }
    }
    Ok(())
}

/// Hardlink with copy fallback for filesystems that refuse the link.
fn link_or_copy(target: &Path, dest: &Path) -> Result<()> {
    if let Err(e) = fs::hard_link(target, dest) {
        log::debug!(
            "hardlink failed ({}), falling back to copy: {} -> {}",
            e,
            target.display(),
            dest.display()
        );
        fs::copy(target, dest)
            .with_context(|| format!("copy {} to {}", target.display(), dest.display()))?;
    }
    Ok(())
}

/// Extracts an OCI-formatted tar stream (plain or gzipped) into `dst`,
/// keeping whiteout markers in place.
pub fn unpack_oci_tar<R: Read>(mut reader: R, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create directory {}", dst.display()))?;

    // Sniff the gzip magic, then stitch the consumed bytes back on.
    let mut magic = [0u8; 2];
    let mut sniffed = 0;
    while sniffed < magic.len() {
        match reader
            .read(&mut magic[sniffed..])
            .context("sniff stream magic")?
        {
            0 => break,
            n => sniffed += n,
        }
    }
    let head = io::Cursor::new(magic[..sniffed].to_vec());
    if sniffed == 2 && magic == [0x1f, 0x8b] {
        extract_entries(GzDecoder::new(head.chain(reader)), dst)
    } else {
        extract_entries(head.chain(reader), dst)
    }
}

fn extract_entries<R: Read>(stream: R, dst: &Path) -> Result<()> {
    let mut archive = tar_rs::Archive::new(stream);
    let mut pending: Vec<PendingLink> = Vec::new();

    for entry_result in archive.entries().context("read tar entries")? {
        let mut entry = entry_result.context("read tar entry")?;
        let entry_type = entry.header().entry_type();

        let raw_path = entry.path().context("get entry path")?.into_owned();
        let rel_path = normalize_tar_path(&raw_path);
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        let dest = dst.join(&rel_path);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        match entry_type {
            tar_rs::EntryType::Directory => {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("create directory {}", dest.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = entry.header().mode().unwrap_or(0o755);
                    // keep directories traversable for the builder
                    let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode | 0o700));
                }
            }
            tar_rs::EntryType::Regular => {
                if is_whiteout(&rel_path) {
                    log::debug!("keeping whiteout marker: {}", rel_path.display());
                }
                remove_existing(&dest)?;
                let mut file = File::create(&dest)
                    .with_context(|| format!("create file {}", dest.display()))?;
                io::copy(&mut entry, &mut file)
                    .with_context(|| format!("write file {}", dest.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        let _ = fs::set_permissions(
                            &dest,
                            fs::Permissions::from_mode(mode & 0o7777),
                        );
                    }
                }
            }
            tar_rs::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .context("get symlink target")?
                    .map(|t| t.into_owned())
                    .unwrap_or_default();
                pending.push(PendingLink {
                    dest,
                    target,
                    symlink: true,
                });
            }
            tar_rs::EntryType::Link => {
                let target = entry
                    .link_name()
                    .context("get hardlink target")?
                    .map(|t| normalize_tar_path(&t))
                    .unwrap_or_default();
                pending.push(PendingLink {
                    dest,
                    target: dst.join(target),
                    symlink: false,
                });
            }
            other => {
                log::debug!(
                    "skipping unsupported entry type {:?}: {}",
                    other,
                    rel_path.display()
                );
            }
        }
    }

    // Second pass: link targets exist now.
    for link in pending {
        remove_existing(&link.dest)?;
        if link.symlink {
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link.target, &link.dest).with_context(|| {
                format!(
                    "symlink {} -> {}",
                    link.dest.display(),
                    link.target.display()
                )
            })?;
        } else if link.target.exists() {
            link_or_copy(&link.target, &link.dest)?;
        } else {
            // Target removed by this layer or simply absent; skip rather
            // than fail the whole extraction.
            log::debug!(
                "hardlink target missing, skipping: {}",
                link.target.display()
            );
        }
    }

    Ok(())
}

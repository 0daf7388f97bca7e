//! Recovers single members from the tail of a nydus-formatted tar blob.
//!
//! A nydus tar blob is a sequence of `[member data][512-byte tar header]`
//! pairs, with the bootstrap (`image.boot`) guaranteed to be the last member.
//! Scanning backwards from end-of-blob therefore costs O(distance from the
//! end) instead of a forward pass over a potentially multi-gigabyte blob:
//! step back one header block at a time, try to parse a tar header, and skip
//! anything that does not parse.
//!
//! Blobs converted with a table of contents additionally carry a
//! `rafs.blob.toc` member of fixed-size records (see [`crate::toc`]) that
//! addresses raw byte ranges inside the blob, possibly zstd-compressed.

use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::stream::{ReaderAt, SectionReader};
use crate::toc::{self, Compressor, TocEntry};

/// Well-known name of the bootstrap member, always the last one in the blob.
pub const BOOTSTRAP_NAME_IN_TAR: &str = "image.boot";

/// Well-known name of the table-of-contents member.
pub const TOC_NAME_IN_TAR: &str = "rafs.blob.toc";

const HEADER_SIZE: u64 = 512;

/// Locates the member `name` by reverse scan, returning the byte range of
/// its data as `(offset, size)`.
fn find_member<R: ReaderAt>(ra: &R, name: &str) -> Result<(u64, u64)> {
    let blob_size = ra.size().context("query blob size")?;
    let mut cur = blob_size;

    while cur >= HEADER_SIZE {
        cur -= HEADER_SIZE;

        // A candidate header block. Parse failures (garbage, truncation,
        // checksum mismatch, end-of-archive zero blocks) just continue the
        // scan one block earlier.
        let section = SectionReader::to_end(ra, cur).context("open header section")?;
        let mut archive = tar_rs::Archive::new(section);
        let mut entries = match archive.entries() {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let entry = match entries.next() {
            Some(Ok(entry)) => entry,
            _ => continue,
        };

        let matches = entry
            .path()
            .map(|path| path == Path::new(name))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let size = entry.header().entry_size().context("parse entry size")?;
        let offset = match cur.checked_sub(size) {
            Some(offset) => offset,
            None => bail!(
                "entry {} declares {} bytes but only {} precede its header",
                name,
                size,
                cur
            ),
        };
        return Ok((offset, size));
    }

    bail!("can't find {} in nydus tar", name)
}

/// Recovers the bootstrap member bytes, writing them to `out`.
/// Returns the number of bytes written.
pub fn unpack_bootstrap<R: ReaderAt, W: Write>(ra: &R, out: &mut W) -> Result<u64> {
    let (offset, size) = find_member(ra, BOOTSTRAP_NAME_IN_TAR)?;
    let mut section = SectionReader::new(ra, offset, size);
    let copied = io::copy(&mut section, out).context("copy bootstrap to target")?;
    if copied != size {
        bail!("bootstrap truncated: copied {} of {} bytes", copied, size);
    }
    Ok(copied)
}

/// Reads and parses the table-of-contents member.
pub fn read_toc<R: ReaderAt>(ra: &R) -> Result<Vec<TocEntry>> {
    let (offset, size) = find_member(ra, TOC_NAME_IN_TAR)?;
    if size % toc::TOC_ENTRY_SIZE as u64 != 0 {
        bail!(
            "TOC member size {} is not a multiple of the {}-byte entry size",
            size,
            toc::TOC_ENTRY_SIZE
        );
    }
    let mut bytes = Vec::with_capacity(size as usize);
    let mut section = SectionReader::new(ra, offset, size);
    section.read_to_end(&mut bytes).context("read TOC member")?;
    toc::parse_entries(&bytes)
}

struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Extracts the raw range a TOC entry addresses, decompressing when the
/// entry says so, and verifies the recorded uncompressed digest and size.
pub fn unpack_toc_entry<R: ReaderAt, W: Write>(
    ra: &R,
    entry: &TocEntry,
    out: &mut W,
) -> Result<u64> {
    let section = SectionReader::new(ra, entry.compressed_offset(), entry.compressed_size());
    let mut digest_out = DigestWriter {
        inner: out,
        hasher: Sha256::new(),
        written: 0,
    };

    match entry.compressor()? {
        Compressor::None => {
            let mut reader = section;
            io::copy(&mut reader, &mut digest_out)
                .with_context(|| format!("copy entry {}", entry.name()))?;
        }
        Compressor::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(section)
                .with_context(|| format!("open zstd stream for entry {}", entry.name()))?;
            io::copy(&mut decoder, &mut digest_out)
                .with_context(|| format!("decompress entry {}", entry.name()))?;
        }
    }

    if digest_out.written != entry.uncompressed_size() {
        bail!(
            "entry {} uncompressed to {} bytes, expected {}",
            entry.name(),
            digest_out.written,
            entry.uncompressed_size()
        );
    }
    let actual = digest_out.hasher.finalize();
    if actual.as_slice() != entry.uncompressed_digest() {
        bail!(
            "entry {} digest mismatch: got {}, expected {}",
            entry.name(),
            hex::encode(actual),
            entry.uncompressed_digest_hex()
        );
    }
    Ok(digest_out.written)
}

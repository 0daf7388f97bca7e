//! Table-of-contents records packed inside a converted nydus tar blob.
//!
//! A TOC is an array of fixed 128-byte records, one per packed member
//! (bootstrap, blob metadata, ...), carried in a tar member of its own (see
//! [`crate::locator`]). It allows picking a single member out of a
//! multi-gigabyte blob without a linear scan. The record layout is bit-exact:
//!
//! ```text
//! flags:               u32 le      0x0001 = uncompressed, 0x0002 = zstd
//! reserved:            u32
//! name:                [16]u8      NUL-padded
//! uncompressed_sha256: [32]u8
//! compressed_offset:   u64 le
//! compressed_size:     u64 le
//! uncompressed_size:   u64 le
//! reserved:            [44]u8      (+4 bytes tail padding to 128)
//! ```

use anyhow::{bail, Result};

/// On-disk size of one TOC record.
pub const TOC_ENTRY_SIZE: usize = 128;

pub const COMPRESSOR_NONE: u32 = 0x0001;
pub const COMPRESSOR_ZSTD: u32 = 0x0002;

/// Compression applied to one packed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Zstd,
}

/// One fixed-size TOC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    flags: u32,
    name: [u8; 16],
    uncompressed_digest: [u8; 32],
    compressed_offset: u64,
    compressed_size: u64,
    uncompressed_size: u64,
}

impl TocEntry {
    pub fn new(
        name: &str,
        compressor: Compressor,
        uncompressed_digest: [u8; 32],
        compressed_offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Result<Self> {
        if name.len() > 16 {
            bail!("entry name {:?} exceeds 16 bytes", name);
        }
        let mut padded = [0u8; 16];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        let flags = match compressor {
            Compressor::None => COMPRESSOR_NONE,
            Compressor::Zstd => COMPRESSOR_ZSTD,
        };
        Ok(TocEntry {
            flags,
            name: padded,
            uncompressed_digest,
            compressed_offset,
            compressed_size,
            uncompressed_size,
        })
    }

    /// Parses one record from a 128-byte block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < TOC_ENTRY_SIZE {
            bail!(
                "truncated TOC entry: {} bytes, expected {}",
                block.len(),
                TOC_ENTRY_SIZE
            );
        }
        let le_u32 = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(block[range].try_into().expect("4-byte slice"))
        };
        let le_u64 = |range: std::ops::Range<usize>| {
            u64::from_le_bytes(block[range].try_into().expect("8-byte slice"))
        };
        let mut name = [0u8; 16];
        name.copy_from_slice(&block[8..24]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&block[24..56]);
        Ok(TocEntry {
            flags: le_u32(0..4),
            name,
            uncompressed_digest: digest,
            compressed_offset: le_u64(56..64),
            compressed_size: le_u64(64..72),
            uncompressed_size: le_u64(72..80),
        })
    }

    pub fn to_bytes(&self) -> [u8; TOC_ENTRY_SIZE] {
        let mut out = [0u8; TOC_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[8..24].copy_from_slice(&self.name);
        out[24..56].copy_from_slice(&self.uncompressed_digest);
        out[56..64].copy_from_slice(&self.compressed_offset.to_le_bytes());
        out[64..72].copy_from_slice(&self.compressed_size.to_le_bytes());
        out[72..80].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out
    }

    /// Compressor encoded in the flag bits. An unrecognized combination is a
    /// format error.
    pub fn compressor(&self) -> Result<Compressor> {
        if self.flags & COMPRESSOR_NONE == COMPRESSOR_NONE {
            Ok(Compressor::None)
        } else if self.flags & COMPRESSOR_ZSTD == COMPRESSOR_ZSTD {
            Ok(Compressor::Zstd)
        } else {
            bail!("unsupported compressor, entry flags {:#x}", self.flags)
        }
    }

    /// Member name with NUL padding stripped.
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn uncompressed_digest(&self) -> &[u8; 32] {
        &self.uncompressed_digest
    }

    pub fn uncompressed_digest_hex(&self) -> String {
        hex::encode(self.uncompressed_digest)
    }

    pub fn compressed_offset(&self) -> u64 {
        self.compressed_offset
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }
}

/// Parses a whole TOC member: a concatenation of 128-byte records.
pub fn parse_entries(bytes: &[u8]) -> Result<Vec<TocEntry>> {
    if bytes.len() % TOC_ENTRY_SIZE != 0 {
        bail!(
            "TOC size {} is not a multiple of the {}-byte entry size",
            bytes.len(),
            TOC_ENTRY_SIZE
        );
    }
    bytes.chunks(TOC_ENTRY_SIZE).map(TocEntry::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TocEntry {
        TocEntry::new("image.boot", Compressor::Zstd, [0xab; 32], 1024, 2048, 4096).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let entry = sample();
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), TOC_ENTRY_SIZE);
        let parsed = TocEntry::parse(&bytes).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.name(), "image.boot");
        assert_eq!(parsed.compressor().unwrap(), Compressor::Zstd);
        assert_eq!(parsed.compressed_offset(), 1024);
        assert_eq!(parsed.compressed_size(), 2048);
        assert_eq!(parsed.uncompressed_size(), 4096);
        assert_eq!(parsed.uncompressed_digest_hex(), "ab".repeat(32));
    }

    #[test]
    fn test_unknown_flags_are_a_format_error() {
        let mut bytes = sample().to_bytes();
        bytes[0..4].copy_from_slice(&0x0004u32.to_le_bytes());
        let parsed = TocEntry::parse(&bytes).unwrap();
        assert!(parsed.compressor().is_err());
    }

    #[test]
    fn test_name_too_long_rejected() {
        assert!(TocEntry::new("a-very-long-entry-name", Compressor::None, [0; 32], 0, 0, 0).is_err());
    }

    #[test]
    fn test_parse_entries_rejects_ragged_input() {
        assert!(parse_entries(&[0u8; 64]).is_err());
        let entries = parse_entries(&[]).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_parse_entries_many() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&sample().to_bytes());
        bytes.extend_from_slice(
            &TocEntry::new("blob.meta", Compressor::None, [1; 32], 0, 10, 10)
                .unwrap()
                .to_bytes(),
        );
        let entries = parse_entries(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name(), "blob.meta");
    }
}

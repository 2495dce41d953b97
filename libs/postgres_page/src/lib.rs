//!
//! The on-disk layout of a PostgreSQL heap page header, copied from
//! `bufpage.h`.
//!
//! Only the fixed 24-byte header is modeled; everything past it is opaque to
//! the backup machinery. The one question this crate answers is "does this
//! block look like a live page, and if so, how recent is it?".
//!

use bytes::{Buf, BufMut};
use utils::lsn::Lsn;

/// Size of `PageHeaderData` up to and including `pd_prune_xid`.
pub const PAGE_HEADER_SIZE: usize = 24;

/// The stock `BLCKSZ`. The actual block size is a run-time parameter, this is
/// only the default.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Current page layout version; `pd_pagesize_version` stores it added to the
/// block size.
pub const PAGE_LAYOUT_VERSION: u16 = 4;

/// PD_HAS_FREE_LINES | PD_PAGE_FULL | PD_ALL_VISIBLE. Anything else set in
/// `pd_flags` means the block is not a page of a supported layout.
pub const PD_VALID_FLAG_BITS: u16 = 0x0007;

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("block of {0} bytes is shorter than a page header")]
    ShortBlock(usize),
}

/// Decoded `PageHeaderData`. Fields are laid out on disk as native
/// little-endian fixed-width values, LSN halves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
    pub prune_xid: u32,
}

impl PageHeader {
    /// Decode the header from the first 24 bytes of a block. Never fails on
    /// content, only on length; a header full of garbage is reported by
    /// [`PageHeader::is_valid`] instead, with the LSN still extracted.
    pub fn decode(block: &[u8]) -> Result<PageHeader, PageError> {
        if block.len() < PAGE_HEADER_SIZE {
            return Err(PageError::ShortBlock(block.len()));
        }
        let mut buf = &block[..PAGE_HEADER_SIZE];
        let hi = buf.get_u32_le();
        let lo = buf.get_u32_le();
        Ok(PageHeader {
            lsn: Lsn::from_hi_lo(hi, lo),
            checksum: buf.get_u16_le(),
            flags: buf.get_u16_le(),
            lower: buf.get_u16_le(),
            upper: buf.get_u16_le(),
            special: buf.get_u16_le(),
            pagesize_version: buf.get_u16_le(),
            prune_xid: buf.get_u32_le(),
        })
    }

    /// Encode back into the on-disk form.
    pub fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut header = [0u8; PAGE_HEADER_SIZE];
        let mut buf = &mut header[..];
        buf.put_u32_le((u64::from(self.lsn) >> 32) as u32);
        buf.put_u32_le(u64::from(self.lsn) as u32);
        buf.put_u16_le(self.checksum);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.lower);
        buf.put_u16_le(self.upper);
        buf.put_u16_le(self.special);
        buf.put_u16_le(self.pagesize_version);
        buf.put_u32_le(self.prune_xid);
        header
    }

    /// Whether the header describes a live page of the given block size:
    /// no reserved flag bits, line pointer bounds ordered within the block,
    /// a non-zero LSN, and the expected layout version.
    pub fn is_valid(&self, block_size: usize) -> bool {
        self.flags & !PD_VALID_FLAG_BITS == 0
            && self.lower >= PAGE_HEADER_SIZE as u16
            && self.lower <= self.upper
            && self.upper <= self.special
            && self.special as usize <= block_size
            && self.lsn.is_valid()
            && self.pagesize_version == block_size as u16 + PAGE_LAYOUT_VERSION
    }
}

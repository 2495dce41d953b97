//! The per-file backup container.
//!
//! An incremental artifact is one encoded `Vec<u32>` of the form
//! `[magic, p0, p1, ...]` (the changed-page indices, ascending), followed by
//! the raw payloads of those pages, each exactly one block long, in the same
//! order. `[magic]` alone marks a file that did not change at all. A stream
//! that does not decode to a magic-headed array is a plain whole-file copy.

use std::io::{self, Read, Write};

use anyhow::Context;
use bincode::Options;

/// Hard cap on the encoded prefix. A whole-file stream handed to the decoder
/// by mistake starts with arbitrary bytes; without the cap those bytes could
/// read as a multi-gigabyte array length.
const PREFIX_SIZE_LIMIT: u64 = 16 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
        .with_limit(PREFIX_SIZE_LIMIT)
}

/// Emit `[magic, p0, p1, ...]`.
pub fn write_prefix<W: Write>(sink: &mut W, magic: u32, pages: &[u32]) -> anyhow::Result<()> {
    let mut prefix = Vec::with_capacity(pages.len() + 1);
    prefix.push(magic);
    prefix.extend_from_slice(pages);
    codec()
        .serialize_into(sink, &prefix)
        .context("write artifact prefix")
}

/// Emit the bare `[magic]` marker for a file that has not changed since the
/// previous run.
pub fn write_unchanged<W: Write>(sink: &mut W, magic: u32) -> anyhow::Result<()> {
    write_prefix(sink, magic, &[])
}

/// Byte length of the encoded prefix. The encoding is deterministic, so a
/// caller holding the page list can compute where the payloads start without
/// reading the stream.
pub fn prefix_len(magic: u32, pages: &[u32]) -> anyhow::Result<u64> {
    let mut prefix = Vec::with_capacity(pages.len() + 1);
    prefix.push(magic);
    prefix.extend_from_slice(pages);
    codec()
        .serialized_size(&prefix)
        .context("size artifact prefix")
}

/// Read the structured prefix. Returns the changed-page list only when a
/// non-empty array headed by `magic` decodes; the source is then positioned
/// exactly on the first payload byte. Any other outcome means the stream is a
/// whole-file copy and the caller restarts it from offset 0.
pub fn read_prefix<R: Read>(source: &mut R, magic: u32) -> Option<Vec<u32>> {
    let prefix: Vec<u32> = codec().deserialize_from(source).ok()?;
    match prefix.split_first() {
        Some((&m, pages)) if m == magic => Some(pages.to_vec()),
        _ => None,
    }
}

/// Fill `buf` from `source`, tolerating partial reads. Returns the number of
/// bytes read, which is short only at end of stream.
pub fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Copy `source` to `sink` in block-sized reads until end of stream. Returns
/// the number of bytes copied.
pub fn copy_blocks<R: Read, W: Write>(
    source: &mut R,
    sink: &mut W,
    block_size: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; block_size];
    let mut total = 0u64;
    loop {
        let got = read_full(source, &mut buf)?;
        if got == 0 {
            return Ok(total);
        }
        sink.write_all(&buf[..got])?;
        total += got as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAGIC: u32 = 2359285;

    #[test]
    fn prefix_round_trip() {
        let pages = vec![0u32, 2, 17];
        let mut buf = Vec::new();
        write_prefix(&mut buf, MAGIC, &pages).unwrap();
        assert_eq!(buf.len() as u64, prefix_len(MAGIC, &pages).unwrap());

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_prefix(&mut cursor, MAGIC), Some(pages));
        assert_eq!(cursor.position() as usize, buf.len());
    }

    #[test]
    fn unchanged_marker_reads_as_empty_page_list() {
        let mut buf = Vec::new();
        write_unchanged(&mut buf, MAGIC).unwrap();
        assert_eq!(read_prefix(&mut Cursor::new(&buf), MAGIC), Some(vec![]));
    }

    #[test]
    fn cursor_lands_on_first_payload_byte() {
        let mut buf = Vec::new();
        write_prefix(&mut buf, MAGIC, &[5]).unwrap();
        buf.extend_from_slice(b"payload");

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_prefix(&mut cursor, MAGIC), Some(vec![5]));
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn wrong_magic_is_a_whole_file_stream() {
        let mut buf = Vec::new();
        write_prefix(&mut buf, MAGIC + 1, &[0, 1]).unwrap();
        assert_eq!(read_prefix(&mut Cursor::new(&buf), MAGIC), None);
    }

    #[test]
    fn raw_bytes_are_a_whole_file_stream() {
        // A page-sized block of 0xFF reads as an absurd array length and must
        // be rejected, not allocated.
        let raw = vec![0xFFu8; 8192];
        assert_eq!(read_prefix(&mut Cursor::new(&raw), MAGIC), None);

        // Short garbage too.
        assert_eq!(read_prefix(&mut Cursor::new(&[1u8, 2, 3]), MAGIC), None);
    }

    #[test]
    fn read_full_reports_short_tail() {
        let mut source = Cursor::new(vec![7u8; 10]);
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut source, &mut buf).unwrap(), 8);
        assert_eq!(read_full(&mut source, &mut buf).unwrap(), 2);
        assert_eq!(read_full(&mut source, &mut buf).unwrap(), 0);
    }

    #[test]
    fn copy_blocks_preserves_odd_sized_streams() {
        let payload: Vec<u8> = (0..10_000u32).map(|n| n as u8).collect();
        let mut sink = Vec::new();
        let copied = copy_blocks(&mut Cursor::new(&payload), &mut sink, 4096).unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink, payload);
    }
}

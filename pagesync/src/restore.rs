//! Per-file restore.
//!
//! The artifact decides the strategy: a magic-headed prefix means the listed
//! pages are patched into the existing target (an empty list meaning the file
//! never changed), anything else is a whole-file rewrite. After patching, the
//! target is cut back to the length the manifest records, since the live file
//! may have grown past the backed-up state.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{bail, Context};
use camino::Utf8Path;
use postgres_page::PageHeader;
use tracing::{debug, error};
use utils::crashsafe;

use crate::artifact;
use crate::config::Config;
use crate::transport::GenericTransport;

/// Restore one manifest entry, reporting success the way the driver harvests
/// it. The error chain goes to the log.
pub fn restore_file(cfg: &Config, rel: &str) -> (String, bool) {
    match try_restore_file(cfg, rel) {
        Ok(()) => (rel.to_string(), true),
        Err(e) => {
            error!("restore of {rel} failed: {e:?}");
            (rel.to_string(), false)
        }
    }
}

fn try_restore_file(cfg: &Config, rel: &str) -> anyhow::Result<()> {
    let tmp = cfg.tmpdir.join(rel);
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {parent}"))?;
    }
    let transport = GenericTransport::from_config(cfg);
    transport.fetch(rel, &tmp)?;

    let target = cfg.pgdata.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {parent}"))?;
    }

    let mut source = cfg.compression.reader(File::open(&tmp)?);
    match artifact::read_prefix(&mut source, cfg.magic) {
        Some(pages) if pages.is_empty() => {
            debug!("{rel} unchanged, leaving target alone");
        }
        Some(pages) => {
            patch_pages(cfg, rel, &mut source, &pages, &target)?;
            crashsafe::fsync_file_and_parent(&target)
                .with_context(|| format!("fsync {target}"))?;
        }
        None => {
            // Whole-file stream; restart it from the first byte.
            drop(source);
            let mut source = cfg.compression.reader(File::open(&tmp)?);
            rewrite_file(cfg, &mut source, &target)?;
            crashsafe::fsync_file_and_parent(&target)
                .with_context(|| format!("fsync {target}"))?;
        }
    }
    fs::remove_file(&tmp).with_context(|| format!("unlink {tmp}"))?;
    Ok(())
}

/// Seek-and-write every listed page over the existing target.
fn patch_pages(
    cfg: &Config,
    rel: &str,
    source: &mut impl Read,
    pages: &[u32],
    target: &Utf8Path,
) -> anyhow::Result<()> {
    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .with_context(|| format!("open {target} for page patching"))?;

    let mut block = vec![0u8; cfg.block_size];
    for &p in pages {
        let got = artifact::read_full(source, &mut block)?;
        if got < cfg.block_size {
            bail!("unable to read page {p} of {rel}");
        }
        let header = PageHeader::decode(&block)?;
        if !header.is_valid(cfg.block_size) {
            bail!("incorrect page {p} in {rel}");
        }
        out.seek(SeekFrom::Start(p as u64 * cfg.block_size as u64))?;
        out.write_all(&block)?;
    }

    // The artifact was taken against the manifest size; drop anything the
    // live file accumulated past it.
    if let Some(expected) = cfg.input_file_list.size_of(rel) {
        if out.metadata()?.len() > expected {
            debug!("truncating {rel} to {expected} bytes");
            out.set_len(expected)?;
        }
    }
    Ok(())
}

fn rewrite_file(cfg: &Config, source: &mut impl Read, target: &Utf8Path) -> anyhow::Result<()> {
    let mut out = File::create(target).with_context(|| format!("rewrite {target}"))?;
    artifact::copy_blocks(source, &mut out, cfg.block_size)
        .with_context(|| format!("rewrite {target}"))?;
    Ok(())
}

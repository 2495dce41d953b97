//! Per-file backup.
//!
//! With a watermark set, the file is scanned page by page and only pages at
//! or past the watermark are packed into the artifact. Anything that breaks
//! the page-wise view (a short tail, a header that does not validate) drops
//! the file back to a whole-file copy. Without a watermark the whole-file
//! copy is taken directly.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};

use anyhow::Context;
use camino::Utf8Path;
use postgres_page::PageHeader;
use tracing::{debug, error, warn};
use utils::lsn::Lsn;

use crate::artifact;
use crate::config::Config;
use crate::transport::{GenericTransport, TransferKind};

/// Back up one file, reporting success the way the driver harvests it. The
/// full error chain stays in the log; the driver only needs to know whether
/// the artifact made it to the backup location.
pub fn backup_file(cfg: &Config, rel: &str) -> (String, bool) {
    match try_backup_file(cfg, rel) {
        Ok(()) => (rel.to_string(), true),
        Err(e) => {
            error!("backup of {rel} failed: {e:?}");
            (rel.to_string(), false)
        }
    }
}

fn try_backup_file(cfg: &Config, rel: &str) -> anyhow::Result<()> {
    let src = cfg.pgdata.join(rel);
    let tmp = cfg.tmpdir.join(rel);
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {parent}"))?;
    }

    let meta = fs::metadata(&src).with_context(|| format!("stat {src}"))?;

    // Unchanged shortcut: same size as the previous run and untouched since
    // the cutoff. The artifact degenerates to the bare magic marker.
    if cfg.lsn.is_some()
        && cfg.input_file_list.size_of(rel) == Some(meta.len())
        && before_cutoff(&meta, cfg.last_ts)
    {
        debug!("{rel} unchanged since last run");
        let out = File::create(&tmp).with_context(|| format!("create {tmp}"))?;
        let mut sink = cfg.compression.writer(out);
        artifact::write_unchanged(&mut sink, cfg.magic)?;
        return finish_and_send(cfg, rel, &tmp, sink);
    }

    let mut input = File::open(&src).with_context(|| format!("open {src}"))?;

    let changed = match cfg.lsn {
        Some(watermark) => scan_changed_pages(&mut input, cfg, rel, watermark)?,
        None => None,
    };

    let out = File::create(&tmp).with_context(|| format!("create {tmp}"))?;
    let mut sink = cfg.compression.writer(out);
    match changed {
        Some(pages) => {
            debug!("{rel}: {} changed pages", pages.len());
            artifact::write_prefix(&mut sink, cfg.magic, &pages)?;
            let mut block = vec![0u8; cfg.block_size];
            for &n in &pages {
                input.seek(SeekFrom::Start(n as u64 * cfg.block_size as u64))?;
                let got = artifact::read_full(&mut input, &mut block)
                    .with_context(|| format!("reread page {n} of {src}"))?;
                if got < cfg.block_size {
                    anyhow::bail!("page {n} of {src} truncated while packing");
                }
                sink.write_all(&block)?;
            }
        }
        None => {
            input.seek(SeekFrom::Start(0))?;
            let copied = artifact::copy_blocks(&mut input, &mut sink, cfg.block_size)
                .with_context(|| format!("copy {src}"))?;
            debug!("{rel}: whole-file copy of {copied} bytes");
        }
    }
    finish_and_send(cfg, rel, &tmp, sink)
}

/// Walk the file block by block collecting indices of pages at or past the
/// watermark. `None` means the file cannot be handled page-wise and must be
/// copied whole.
fn scan_changed_pages(
    input: &mut File,
    cfg: &Config,
    rel: &str,
    watermark: Lsn,
) -> anyhow::Result<Option<Vec<u32>>> {
    let mut changed = Vec::new();
    let mut block = vec![0u8; cfg.block_size];
    let mut n: u32 = 0;
    loop {
        let got = artifact::read_full(input, &mut block)
            .with_context(|| format!("read page {n} of {rel}"))?;
        if got == 0 {
            break;
        }
        if got < cfg.block_size {
            warn!("short read of {got} bytes at page {n} of {rel}, copying whole file");
            return Ok(None);
        }
        let header = PageHeader::decode(&block)?;
        if !header.is_valid(cfg.block_size) {
            warn!("invalid page {n} in {rel}, copying whole file");
            return Ok(None);
        }
        if header.lsn >= watermark {
            changed.push(n);
        }
        n += 1;
    }
    Ok(Some(changed))
}

fn before_cutoff(meta: &fs::Metadata, last_ts: Option<i64>) -> bool {
    use std::os::unix::fs::MetadataExt;
    last_ts.is_some_and(|cutoff| meta.mtime() < cutoff)
}

fn finish_and_send(
    cfg: &Config,
    rel: &str,
    tmp: &Utf8Path,
    sink: crate::compression::ArtifactWriter,
) -> anyhow::Result<()> {
    let file = sink.finish().with_context(|| format!("finish {tmp}"))?;
    file.sync_all().with_context(|| format!("fsync {tmp}"))?;
    drop(file);

    let transport = GenericTransport::from_config(cfg);
    transport.send_relative(&cfg.tmpdir, rel, TransferKind::File)?;
    fs::remove_file(tmp).with_context(|| format!("unlink {tmp}"))?;
    Ok(())
}

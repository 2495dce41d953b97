//! The two top-level modes.
//!
//! Backup walks the tablespaces, then the data directory, then the forced
//! includes, then fences the run with `pg_control` and only afterwards
//! publishes the manifest. Restore materializes tablespace symlinks, applies
//! every manifest entry, recreates directories, prunes what the manifest
//! does not know, and makes sure `backup_label` is in place.

use std::fs;

use anyhow::{anyhow, bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use scopeguard::defer;
use tracing::{info, warn};

use crate::backup;
use crate::compression::Compression;
use crate::config::Config;
use crate::driver::{self, Job};
use crate::manifest::{FileList, FILE_LIST_NAME};
use crate::restore;
use crate::transport::{self, GenericTransport, TransferKind};

pub const PG_CONTROL: &str = "global/pg_control";
pub const BACKUP_LABEL: &str = "backup_label";
const PG_TBLSPC: &str = "pg_tblspc";

pub fn backup(cfg: &Config) -> anyhow::Result<()> {
    fs::create_dir_all(&cfg.tmpdir).with_context(|| format!("create {}", cfg.tmpdir))?;
    let tmpdir = cfg.tmpdir.clone();
    defer! {
        if let Err(e) = fs::remove_dir_all(&tmpdir) {
            warn!("could not remove {tmpdir}: {e}");
        }
    }

    // An incremental run needs the previous manifest; without it there is
    // nothing to be incremental against.
    let cfg = if cfg.lsn.is_some() {
        let src = cfg
            .file_list
            .as_deref()
            .ok_or_else(|| anyhow!("incremental backup requires the prior file list (-f)"))?;
        let local = cfg.tmpdir.join(FILE_LIST_NAME);
        transport::fetch_location(cfg, src, &local).context("fetch prior file list")?;
        cfg.with_input_file_list(FileList::load(&local)?)
    } else {
        cfg.clone()
    };

    let mut processed = FileList::new();

    // Tablespaces first; whatever they cover is skipped when the data
    // directory itself is walked.
    for (name, target) in cfg.tablespaces.iter() {
        backup_tablespace(&cfg, name, target, &mut processed)?;
    }

    driver::process_tree(&cfg, &cfg.pgdata, "", &mut processed)?;

    for path in cfg.include_files.iter() {
        let Ok(rel) = path.strip_prefix(&cfg.pgdata) else {
            warn!("include file {path} is outside {}, skipping", cfg.pgdata);
            continue;
        };
        let rel = rel.as_str();
        let icfg = cfg.with_lsn(None).with_compression(Compression::NONE);
        let (_, ok) = backup::backup_file(&icfg, rel);
        if !ok {
            bail!("backup of include file {rel} failed");
        }
        processed.insert_file(rel, fs::metadata(path)?.len());
    }

    // pg_control is the consistency fencepost: it goes up strictly after
    // every other file, and the manifest only after it.
    let control_cfg = cfg.with_lsn(None).with_compression(Compression::NONE);
    let (_, ok) = backup::backup_file(&control_cfg, PG_CONTROL);
    if !ok {
        bail!("backup of {PG_CONTROL} failed");
    }
    processed.insert_file(PG_CONTROL, fs::metadata(cfg.pgdata.join(PG_CONTROL))?.len());

    processed.save(&cfg.tmpdir.join(FILE_LIST_NAME))?;
    GenericTransport::from_config(&cfg)
        .send_relative(&cfg.tmpdir, FILE_LIST_NAME, TransferKind::File)
        .context("upload file list")?;
    info!("backed up {} entries", processed.len());
    Ok(())
}

/// Validate a tablespace symlink against the configuration and back up its
/// tree. A target inside the data directory keeps its real relative paths
/// (the later walk then skips them); one outside is recorded under
/// `pg_tblspc/<name>/` so restore writes through the recreated symlink.
fn backup_tablespace(
    cfg: &Config,
    name: &str,
    target: &Utf8Path,
    processed: &mut FileList,
) -> anyhow::Result<()> {
    let link = cfg.pgdata.join(PG_TBLSPC).join(name);
    let actual = fs::read_link(&link).with_context(|| format!("read tablespace link {link}"))?;
    let actual = Utf8PathBuf::from_path_buf(actual)
        .map_err(|p| anyhow!("non-utf8 tablespace target {}", p.display()))?;
    if actual != *target {
        bail!("tablespace {name} points at {actual}, configuration says {target}");
    }

    let tcfg = cfg.with_bwlimit(cfg.tablespaces_bw.get(name).copied().or(cfg.bwlimit));
    if target.starts_with(&cfg.pgdata) {
        let rel_base = target.strip_prefix(&cfg.pgdata)?.as_str().to_string();
        driver::process_tree(&tcfg, target, &rel_base, processed)
    } else {
        driver::process_tree(&tcfg, target, &format!("{PG_TBLSPC}/{name}"), processed)
    }
}

pub fn restore(cfg: &Config) -> anyhow::Result<()> {
    fs::create_dir_all(&cfg.tmpdir).with_context(|| format!("create {}", cfg.tmpdir))?;
    let tmpdir = cfg.tmpdir.clone();
    defer! {
        if let Err(e) = fs::remove_dir_all(&tmpdir) {
            warn!("could not remove {tmpdir}: {e}");
        }
    }
    fs::create_dir_all(cfg.pgdata.join(PG_TBLSPC))?;

    restore_tablespace_links(cfg)?;

    let transport = GenericTransport::from_config(cfg);
    let local = cfg.tmpdir.join(FILE_LIST_NAME);
    transport.fetch(FILE_LIST_NAME, &local).context("fetch file list")?;
    let cfg = cfg.with_input_file_list(FileList::load(&local)?);

    let jobs: Vec<Job> = cfg
        .input_file_list
        .files()
        .map(|(rel, _)| Job::Restore {
            cfg: restore_config_for(&cfg, rel),
            rel: rel.to_string(),
        })
        .collect();
    info!("dispatching {} restore jobs", jobs.len());
    let results = driver::run_pool(jobs, cfg.parallel);
    let failed: Vec<_> = results
        .iter()
        .filter(|r| !r.ok)
        .map(|r| r.rel.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("restore failed for {} files, first {}", failed.len(), failed[0]);
    }

    for dir in cfg.input_file_list.dirs() {
        let path = cfg.pgdata.join(dir.trim_end_matches('/'));
        fs::create_dir_all(&path).with_context(|| format!("create {path}"))?;
    }

    prune_stale_entries(&cfg)?;

    if !cfg.pgdata.join(BACKUP_LABEL).exists() {
        let (_, ok) = restore::restore_file(&cfg, BACKUP_LABEL);
        if !ok {
            bail!("unable to restore {BACKUP_LABEL}");
        }
    }
    info!("restored {} entries", cfg.input_file_list.len());
    Ok(())
}

/// Configs and the control file were written uncompressed; everything else
/// was written with the configured codec.
fn restore_config_for(cfg: &Config, rel: &str) -> Config {
    if rel.ends_with(".conf") || rel == PG_CONTROL {
        cfg.with_compression(Compression::NONE)
    } else {
        cfg.clone()
    }
}

/// Bring `pg_tblspc` in line with the configuration: create missing links,
/// re-point wrong ones, drop stale ones.
fn restore_tablespace_links(cfg: &Config) -> anyhow::Result<()> {
    let tblspc_dir = cfg.pgdata.join(PG_TBLSPC);
    for (name, target) in cfg.tablespaces.iter() {
        let link = tblspc_dir.join(name);
        match fs::read_link(&link) {
            Ok(actual) if actual == target.as_std_path() => continue,
            Ok(actual) => {
                warn!("re-pointing tablespace {name} from {} to {target}", actual.display());
                fs::remove_file(&link)?;
            }
            Err(_) if link.symlink_metadata().is_ok() => {
                bail!("{link} exists and is not a symlink");
            }
            Err(_) => {}
        }
        fs::create_dir_all(target).with_context(|| format!("create tablespace target {target}"))?;
        std::os::unix::fs::symlink(target, &link)
            .with_context(|| format!("symlink {link} -> {target}"))?;
    }
    for entry in fs::read_dir(&tblspc_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !cfg.tablespaces.iter().any(|(n, _)| *n == name) {
            warn!("removing stale tablespace link {name}");
            fs::remove_file(entry.path())
                .with_context(|| format!("remove stale tablespace link {name}"))?;
        }
    }
    Ok(())
}

/// Delete whatever lives under the data directory but not in the manifest.
/// Tablespace targets inside the data directory are left to their own
/// traversal, and the configured symlinks themselves are kept.
fn prune_stale_entries(cfg: &Config) -> anyhow::Result<()> {
    let keep_roots: Vec<&Utf8PathBuf> = cfg
        .tablespaces
        .iter()
        .filter(|(_, target)| target.starts_with(&cfg.pgdata))
        .map(|(_, target)| target)
        .collect();
    let keep_links: Vec<Utf8PathBuf> = cfg
        .tablespaces
        .iter()
        .map(|(name, _)| cfg.pgdata.join(PG_TBLSPC).join(name))
        .collect();

    let mut walk = walkdir::WalkDir::new(&cfg.pgdata).min_depth(1).into_iter();
    while let Some(entry) = walk.next() {
        let entry = entry.with_context(|| format!("walk {}", cfg.pgdata))?;
        let path = Utf8Path::from_path(entry.path())
            .with_context(|| format!("non-utf8 path under {}", cfg.pgdata))?;
        if keep_roots.iter().any(|root| path.starts_with(root)) {
            if entry.file_type().is_dir() {
                walk.skip_current_dir();
            }
            continue;
        }
        if keep_links.iter().any(|link| link.as_path() == path) {
            continue;
        }
        let rel = path.strip_prefix(&cfg.pgdata)?.as_str();
        if entry.file_type().is_dir() {
            if !cfg.input_file_list.contains(&format!("{rel}/")) {
                info!("pruning stale directory {rel}");
                fs::remove_dir_all(path).with_context(|| format!("remove {path}"))?;
                walk.skip_current_dir();
            }
        } else if !cfg.input_file_list.contains(rel) {
            info!("pruning stale file {rel}");
            fs::remove_file(path).with_context(|| format!("remove {path}"))?;
        }
    }
    Ok(())
}

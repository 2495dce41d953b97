//! The data-tree walk and the parallel per-file dispatch.
//!
//! Jobs share no mutable state; the pool hands results back over a channel
//! tagged with the submission index, and the driver folds them into the
//! output manifest in submission order. Only the driver ever touches that
//! manifest.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::{mpsc, Mutex};

use anyhow::{bail, Context};
use camino::Utf8Path;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::backup;
use crate::compression::Compression;
use crate::config::Config;
use crate::manifest::FileList;
use crate::restore;
use crate::transport::{GenericTransport, TransferKind};

/// One unit of pool work. Each job carries the config variant it was
/// dispatched with.
pub enum Job {
    Backup { rel: String, cfg: Config },
    MakeDir { rel: String, cfg: Config },
    Restore { rel: String, cfg: Config },
}

pub struct JobResult {
    pub rel: String,
    pub ok: bool,
    pub is_dir: bool,
}

impl Job {
    fn run(&self) -> JobResult {
        match self {
            Job::Backup { rel, cfg } => {
                let (rel, ok) = backup::backup_file(cfg, rel);
                JobResult {
                    rel,
                    ok,
                    is_dir: false,
                }
            }
            Job::MakeDir { rel, cfg } => materialize_dir(cfg, rel),
            Job::Restore { rel, cfg } => {
                let (rel, ok) = restore::restore_file(cfg, rel);
                JobResult {
                    rel,
                    ok,
                    is_dir: false,
                }
            }
        }
    }
}

/// Mirror an (empty) directory entry at the backup destination so restore
/// can recreate empty leaves.
fn materialize_dir(cfg: &Config, rel: &str) -> JobResult {
    let transport = GenericTransport::from_config(cfg);
    let ok = match transport.send_relative(&cfg.pgdata, rel, TransferKind::Directory) {
        Ok(()) => true,
        Err(e) => {
            error!("directory entry {rel} failed: {e:?}");
            false
        }
    };
    JobResult {
        rel: rel.to_string(),
        ok,
        is_dir: true,
    }
}

/// Run jobs on a pool of `parallel` worker threads. Results come back in
/// submission order.
pub fn run_pool(jobs: Vec<Job>, parallel: usize) -> Vec<JobResult> {
    let total = jobs.len();
    let mut slots: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();
    let queue = Mutex::new(jobs.into_iter().enumerate());
    let (tx, rx) = mpsc::channel();

    std::thread::scope(|s| {
        for _ in 0..parallel.max(1) {
            let tx = tx.clone();
            let queue = &queue;
            s.spawn(move || loop {
                let next = queue.lock().unwrap().next();
                let Some((idx, job)) = next else { break };
                if tx.send((idx, job.run())).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for (idx, result) in rx {
            slots[idx] = Some(result);
        }
    });

    slots.into_iter().flatten().collect()
}

/// Walk one tree and build its backup job list. `walk_root` is where the
/// files physically live; `rel_base` is prepended to each manifest path
/// (empty for the data directory itself, `pg_tblspc/<name>` for a tablespace
/// living elsewhere).
pub fn collect_backup_jobs(
    cfg: &Config,
    walk_root: &Utf8Path,
    rel_base: &str,
    processed: &FileList,
) -> anyhow::Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for entry in WalkDir::new(walk_root).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {walk_root}"))?;
        let path = Utf8Path::from_path(entry.path())
            .with_context(|| format!("non-utf8 path under {walk_root}"))?;
        let tail = path.strip_prefix(walk_root)?.as_str();
        let rel = if rel_base.is_empty() {
            tail.to_string()
        } else {
            format!("{rel_base}/{tail}")
        };

        let ftype = entry.file_type();
        let key = if ftype.is_dir() {
            format!("{rel}/")
        } else {
            rel.clone()
        };
        if processed.contains(&key) {
            debug!("{key} already processed, skipping");
            continue;
        }
        if cfg.exclude.iter().any(|pat| pat.matches(&key)) {
            debug!("{key} excluded");
            continue;
        }

        if ftype.is_dir() {
            jobs.push(Job::MakeDir {
                rel,
                cfg: cfg.clone(),
            });
        } else if ftype.is_file() {
            jobs.push(Job::Backup {
                cfg: backup_config_for(cfg, &rel),
                rel,
            });
        } else {
            // Tablespace symlinks are handled by the orchestrator; anything
            // else non-regular has no business in a backup.
            debug!("skipping non-regular entry {rel}");
        }
    }
    Ok(jobs)
}

/// The per-file dispatch rules: configs travel uncompressed and whole,
/// files known to the prior run may go incremental, new files go whole.
fn backup_config_for(cfg: &Config, rel: &str) -> Config {
    if rel.ends_with(".conf") {
        cfg.with_lsn(None).with_compression(Compression::NONE)
    } else if cfg.input_file_list.contains(rel) {
        cfg.clone()
    } else {
        cfg.with_lsn(None)
    }
}

/// Walk a tree, dispatch its jobs, and fold the results into `processed`.
pub fn process_tree(
    cfg: &Config,
    walk_root: &Utf8Path,
    rel_base: &str,
    processed: &mut FileList,
) -> anyhow::Result<()> {
    let jobs = collect_backup_jobs(cfg, walk_root, rel_base, processed)?;
    info!("dispatching {} jobs under {walk_root}", jobs.len());
    let results = run_pool(jobs, cfg.parallel);
    harvest_backup_results(cfg, results, processed)
}

/// Fold pool results into the output manifest, applying the failure policy:
/// a failed file that predates the run is fatal, anything younger is left to
/// WAL replay on the restored cluster.
fn harvest_backup_results(
    cfg: &Config,
    results: Vec<JobResult>,
    processed: &mut FileList,
) -> anyhow::Result<()> {
    for result in results {
        if result.ok {
            if result.is_dir {
                processed.insert_dir(&result.rel);
                continue;
            }
            match fs::metadata(cfg.pgdata.join(&result.rel)) {
                Ok(meta) => processed.insert_file(&result.rel, meta.len()),
                Err(_) => {
                    info!("{} seems deleted during backup, dropping it", result.rel);
                }
            }
        } else {
            let existed_before = fs::metadata(cfg.pgdata.join(&result.rel))
                .map(|meta| meta.ctime() < cfg.start_time)
                .unwrap_or(false);
            if existed_before {
                bail!("backup of pre-existing {} failed", result.rel);
            }
            warn!("{} failed but should appear on wal apply", result.rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_exclude_list;
    use crate::manifest::FileList;
    use camino::Utf8PathBuf;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_config(pgdata: &Utf8Path) -> Config {
        Config {
            pgdata: pgdata.to_path_buf(),
            backup_path: "/nowhere".to_string(),
            lsn: None,
            last_ts: None,
            compression: Compression::NONE,
            tmpdir: Utf8PathBuf::from("/tmp/pagesync"),
            exclude: Arc::new(parse_exclude_list("*pg_xlog/*").unwrap()),
            retries: 1,
            pause: 0,
            file_list: None,
            parallel: 2,
            tablespaces: Arc::new(Vec::new()),
            block_size: 8192,
            magic: 2359285,
            bwlimit: None,
            tablespaces_bw: Arc::new(HashMap::new()),
            include_files: Arc::new(Vec::new()),
            rsync_args: Arc::new(Vec::new()),
            input_file_list: Arc::new(FileList::new()),
            start_time: 0,
        }
    }

    #[test]
    fn walk_applies_skip_and_exclude_rules() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path();
        std::fs::create_dir_all(pgdata.join("base/1")).unwrap();
        std::fs::create_dir_all(pgdata.join("pg_xlog")).unwrap();
        std::fs::write(pgdata.join("base/1/1234"), b"x").unwrap();
        std::fs::write(pgdata.join("pg_xlog/0001"), b"x").unwrap();
        std::fs::write(pgdata.join("postgresql.conf"), b"x").unwrap();

        let cfg = test_config(pgdata);
        let mut processed = FileList::new();
        processed.insert_file("base/1/1234", 1);

        let jobs = collect_backup_jobs(&cfg, pgdata, "", &processed).unwrap();
        let rels: Vec<&str> = jobs
            .iter()
            .map(|j| match j {
                Job::Backup { rel, .. } | Job::MakeDir { rel, .. } | Job::Restore { rel, .. } => {
                    rel.as_str()
                }
            })
            .collect();

        // The glob covers the directory entry and its contents; the
        // already-processed file is skipped.
        assert!(!rels.contains(&"pg_xlog"));
        assert!(!rels.contains(&"pg_xlog/0001"));
        assert!(!rels.contains(&"base/1/1234"));
        assert!(rels.contains(&"postgresql.conf"));
        assert!(rels.contains(&"base"));
        assert!(rels.contains(&"base/1"));
    }

    #[test]
    fn dispatch_rules_pick_mode_and_codec() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.lsn = Some(utils::lsn::Lsn(150));
        cfg.compression = "gzip".parse().unwrap();
        let mut prior = FileList::new();
        prior.insert_file("base/1/1234", 8192);
        let cfg = cfg.with_input_file_list(prior);

        let conf = backup_config_for(&cfg, "postgresql.conf");
        assert_eq!(conf.lsn, None);
        assert_eq!(conf.compression, Compression::NONE);

        let known = backup_config_for(&cfg, "base/1/1234");
        assert_eq!(known.lsn, cfg.lsn);

        let fresh = backup_config_for(&cfg, "base/1/9999");
        assert_eq!(fresh.lsn, None);
        assert_eq!(fresh.compression, cfg.compression);
    }

    #[test]
    fn pool_returns_results_in_submission_order() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = dir.path();
        let cfg = test_config(pgdata);
        // MakeDir against an unwritable destination still yields a result
        // per job; order must match submission despite parallelism.
        let jobs: Vec<Job> = (0..16)
            .map(|n| Job::MakeDir {
                rel: format!("dir{n}"),
                cfg: cfg.with_bwlimit(None),
            })
            .collect();
        let results = run_pool(jobs, 4);
        assert_eq!(results.len(), 16);
        for (n, result) in results.iter().enumerate() {
            assert_eq!(result.rel, format!("dir{n}"));
            assert!(result.is_dir);
        }
    }
}

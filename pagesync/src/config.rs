//! Run configuration.
//!
//! `Config` is an immutable bundle: dispatch never mutates it, it derives a
//! per-task variant through the `with_*` methods. The shared heavyweight
//! members sit behind `Arc` so those copies stay cheap even with a large
//! prior manifest.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use glob::Pattern;
use utils::lsn::Lsn;

use crate::compression::Compression;
use crate::manifest::FileList;

#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory root.
    pub pgdata: Utf8PathBuf,
    /// Backup destination root, local path or `host:/path`.
    pub backup_path: String,
    /// Incremental watermark; `None` means whole-file backups.
    pub lsn: Option<Lsn>,
    /// Unix-time mtime cutoff for the unchanged-file shortcut.
    pub last_ts: Option<i64>,
    pub compression: Compression,
    /// Scratch directory for artifacts in flight.
    pub tmpdir: Utf8PathBuf,
    pub exclude: Arc<Vec<Pattern>>,
    /// Transport attempts per copy.
    pub retries: u32,
    /// Seconds between transport attempts.
    pub pause: u64,
    /// Where the prior run's manifest lives, for incremental backups.
    pub file_list: Option<String>,
    /// Worker pool size.
    pub parallel: usize,
    /// Tablespace name to target path, as configured on the cluster.
    pub tablespaces: Arc<Vec<(String, Utf8PathBuf)>>,
    pub block_size: usize,
    /// First element of every artifact prefix.
    pub magic: u32,
    /// Global transport rate cap, KB/s.
    pub bwlimit: Option<u64>,
    /// Per-tablespace rate caps overriding the global one.
    pub tablespaces_bw: Arc<HashMap<String, u64>>,
    /// Absolute paths forced into whole-file, uncompressed backup.
    pub include_files: Arc<Vec<Utf8PathBuf>>,
    /// Extra arguments handed to every rsync invocation.
    pub rsync_args: Arc<Vec<String>>,
    /// The prior run's manifest (empty for a full backup); on restore, the
    /// manifest of the backup being applied.
    pub input_file_list: Arc<FileList>,
    /// Unix time the run started; files older than this must not fail.
    pub start_time: i64,
}

impl Config {
    pub fn with_lsn(&self, lsn: Option<Lsn>) -> Config {
        Config { lsn, ..self.clone() }
    }

    pub fn with_compression(&self, compression: Compression) -> Config {
        Config {
            compression,
            ..self.clone()
        }
    }

    pub fn with_bwlimit(&self, bwlimit: Option<u64>) -> Config {
        Config {
            bwlimit,
            ..self.clone()
        }
    }

    pub fn with_input_file_list(&self, input_file_list: FileList) -> Config {
        Config {
            input_file_list: Arc::new(input_file_list),
            ..self.clone()
        }
    }

    /// The transport rate cap one worker may use: the configured limit split
    /// evenly across the pool, with a 1 KB/s floor.
    pub fn worker_bwlimit(&self) -> Option<u64> {
        self.bwlimit
            .map(|w| std::cmp::max(w / self.parallel.max(1) as u64, 1))
    }
}

/// Parse a comma-separated glob list, `*pg_xlog/*,*pg_stat_tmp/*` style.
pub fn parse_exclude_list(s: &str) -> anyhow::Result<Vec<Pattern>> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| Pattern::new(part).with_context(|| format!("bad exclude pattern {part:?}")))
        .collect()
}

/// Parse a `name:path,name:path` tablespace map.
pub fn parse_tablespace_map(s: &str) -> anyhow::Result<Vec<(String, Utf8PathBuf)>> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let Some((name, path)) = part.split_once(':') else {
                bail!("bad tablespace spec {part:?}, expected name:path");
            };
            Ok((name.to_string(), Utf8PathBuf::from(path)))
        })
        .collect()
}

/// Parse a `name:KBps,name:KBps` bandwidth map.
pub fn parse_bwlimit_map(s: &str) -> anyhow::Result<HashMap<String, u64>> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let Some((name, limit)) = part.split_once(':') else {
                bail!("bad tablespace bandwidth spec {part:?}, expected name:KBps");
            };
            let limit: u64 = limit
                .parse()
                .with_context(|| format!("bad bandwidth limit in {part:?}"))?;
            Ok((name.to_string(), limit))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_list_parses_and_matches() {
        let patterns = parse_exclude_list("*pg_xlog/*,*pg_stat_tmp/*").unwrap();
        assert_eq!(patterns.len(), 2);
        assert!(patterns[0].matches("pg_xlog/000000010000000000000001"));
        // The wildcards tolerate an empty tail, so the directory key itself
        // is covered too.
        assert!(patterns[0].matches("pg_xlog/"));
        assert!(!patterns[0].matches("pg_xlogs"));
        assert!(!patterns[1].matches("base/1/1234"));
        assert!(parse_exclude_list("").unwrap().is_empty());
    }

    #[test]
    fn tablespace_map_parses() {
        let map = parse_tablespace_map("ts1:/mnt/ssd,ts2:/mnt/hdd").unwrap();
        assert_eq!(
            map,
            vec![
                ("ts1".to_string(), Utf8PathBuf::from("/mnt/ssd")),
                ("ts2".to_string(), Utf8PathBuf::from("/mnt/hdd")),
            ]
        );
        assert!(parse_tablespace_map("nocolon").is_err());
    }

    #[test]
    fn bwlimit_map_parses() {
        let map = parse_bwlimit_map("ts1:2048").unwrap();
        assert_eq!(map.get("ts1"), Some(&2048));
        assert!(parse_bwlimit_map("ts1:fast").is_err());
    }

    #[test]
    fn worker_bwlimit_splits_across_the_pool() {
        let cfg = test_config();
        assert_eq!(cfg.worker_bwlimit(), None);
        let cfg = Config {
            bwlimit: Some(1000),
            parallel: 4,
            ..cfg
        };
        assert_eq!(cfg.worker_bwlimit(), Some(250));
        let cfg = Config {
            bwlimit: Some(2),
            parallel: 8,
            ..cfg
        };
        assert_eq!(cfg.worker_bwlimit(), Some(1));
    }

    #[test]
    fn with_methods_derive_without_mutating() {
        let cfg = test_config();
        let derived = cfg.with_lsn(Some(Lsn(150))).with_compression(Compression::NONE);
        assert_eq!(derived.lsn, Some(Lsn(150)));
        assert_eq!(cfg.lsn, None);
    }

    fn test_config() -> Config {
        Config {
            pgdata: Utf8PathBuf::from("/var/lib/pgsql/data"),
            backup_path: "/backup".to_string(),
            lsn: None,
            last_ts: None,
            compression: Compression::NONE,
            tmpdir: Utf8PathBuf::from("/tmp/pagesync"),
            exclude: Arc::new(Vec::new()),
            retries: 5,
            pause: 30,
            file_list: None,
            parallel: 1,
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
}

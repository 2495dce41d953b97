//!
//! `pagesync` takes incremental page-level backups of a PostgreSQL data
//! directory and restores them:
//! - `backup` walks the data directory (tablespaces included), packs every
//!   file into an artifact (only the pages past the `-l` watermark, when one
//!   is given) and ships artifacts plus a `file.list` manifest to the backup
//!   location, `global/pg_control` strictly last.
//! - `restore` applies a backup onto an existing directory: patching listed
//!   pages in place, rewriting whole files, recreating directories and
//!   tablespace symlinks, and pruning whatever the manifest does not know.
//!
//! Usage example:
//! ```sh
//! pagesync backup -D /var/lib/pgsql/data -b backup@host:/srv/backups/node1 \
//!                 -l 2/8F000000 -f backup@host:/srv/backups/node1/file.list \
//!                 -c gzip-6 -p 4
//! ```
//!
use std::process::exit;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, ArgMatches};
use tracing::error;
use utils::lsn::Lsn;

use pagesync::config::{self, Config};
use pagesync::logger;
use pagesync::orchestrator;

fn main() {
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            // Help and version land on stdout and exit clean; everything
            // else is a usage error.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            exit(code);
        }
    };

    logger::init(matches.get_count("verbose"));

    if let Err(e) = run(&matches) {
        error!("{e:?}");
        exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let cfg = build_config(matches)?;
    let action = matches.get_one::<String>("action").expect("required");
    match action.as_str() {
        "backup" => orchestrator::backup(&cfg),
        "restore" => orchestrator::restore(&cfg),
        other => bail!("unknown action {other:?}, expected backup or restore"),
    }
}

fn build_config(matches: &ArgMatches) -> Result<Config> {
    let lsn = matches
        .get_one::<String>("lsn")
        .map(|s| s.parse::<Lsn>())
        .transpose()
        .context("parse -l")?;
    let last_ts = matches
        .get_one::<String>("after")
        .map(|s| s.parse::<i64>())
        .transpose()
        .context("parse -a")?;
    let compression = matches
        .get_one::<String>("compress")
        .expect("defaulted")
        .parse()
        .context("parse -c")?;
    let block_size: usize = matches
        .get_one::<String>("block-size")
        .expect("defaulted")
        .parse()
        .context("parse -Z")?;
    if block_size < postgres_page::PAGE_HEADER_SIZE {
        bail!("block size {block_size} is smaller than a page header");
    }
    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs() as i64;

    Ok(Config {
        pgdata: Utf8PathBuf::from(matches.get_one::<String>("pgdata").expect("defaulted")),
        backup_path: matches
            .get_one::<String>("backup-path")
            .expect("required")
            .clone(),
        lsn,
        last_ts,
        compression,
        tmpdir: Utf8PathBuf::from(matches.get_one::<String>("tmpdir").expect("defaulted")),
        exclude: Arc::new(config::parse_exclude_list(
            matches.get_one::<String>("exclude").expect("defaulted"),
        )?),
        retries: *matches.get_one::<u32>("retries").expect("defaulted"),
        pause: *matches.get_one::<u64>("pause").expect("defaulted"),
        file_list: matches.get_one::<String>("file-list").cloned(),
        parallel: *matches.get_one::<usize>("parallel").expect("defaulted"),
        tablespaces: Arc::new(config::parse_tablespace_map(
            matches.get_one::<String>("tablespaces").expect("defaulted"),
        )?),
        block_size,
        magic: *matches.get_one::<u32>("magic").expect("defaulted"),
        bwlimit: matches.get_one::<u64>("bwlimit").copied(),
        tablespaces_bw: Arc::new(config::parse_bwlimit_map(
            matches
                .get_one::<String>("tablespaces-bw")
                .expect("defaulted"),
        )?),
        include_files: Arc::new(
            matches
                .get_one::<String>("include-files")
                .expect("defaulted")
                .split(',')
                .filter(|s| !s.is_empty())
                .map(Utf8PathBuf::from)
                .collect(),
        ),
        rsync_args: Arc::new(
            matches
                .get_one::<String>("rsync-args")
                .expect("defaulted")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        ),
        input_file_list: Arc::new(Default::default()),
        start_time,
    })
}

fn cli() -> clap::Command {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("unknown");
    clap::Command::new("pagesync")
        .version(version)
        .about("Incremental page-level backup and restore of a PostgreSQL data directory")
        .arg(
            Arg::new("action")
                .value_name("ACTION")
                .help("backup | restore")
                .required(true),
        )
        .arg(
            Arg::new("pgdata")
                .short('D')
                .long("pgdata")
                .value_name("DATADIR")
                .default_value("/var/lib/pgsql/data"),
        )
        .arg(
            Arg::new("backup-path")
                .short('b')
                .long("backup-path")
                .value_name("BACKUP_PATH")
                .help("Backup destination root, local path or host:/path")
                .required(true),
        )
        .arg(
            Arg::new("lsn")
                .short('l')
                .long("lsn")
                .value_name("LSN")
                .help("Incremental watermark; omit for a full backup"),
        )
        .arg(
            Arg::new("after")
                .short('a')
                .long("after")
                .value_name("UNIX_TIME")
                .help("Treat files not modified since this time as unchanged"),
        )
        .arg(
            Arg::new("compress")
                .short('c')
                .long("compress")
                .value_name("CODEC")
                .help("none|gzip[-N]|bzip2[-N]|lzma[-N]")
                .default_value("none"),
        )
        .arg(
            Arg::new("tmpdir")
                .short('t')
                .long("tmpdir")
                .value_name("TMPDIR")
                .default_value("/tmp/pagesync"),
        )
        .arg(
            Arg::new("exclude")
                .short('e')
                .long("exclude")
                .value_name("GLOBS")
                .default_value("*pg_xlog/*,*pg_log/*,*pg_stat_tmp/*,*pg_replslot/*"),
        )
        .arg(
            Arg::new("retries")
                .short('r')
                .long("retries")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .default_value("5"),
        )
        .arg(
            Arg::new("pause")
                .short('s')
                .long("pause")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .default_value("30"),
        )
        .arg(
            Arg::new("file-list")
                .short('f')
                .long("file-list")
                .value_name("LOCATION")
                .help("Prior manifest, required for an incremental backup"),
        )
        .arg(
            Arg::new("parallel")
                .short('p')
                .long("parallel")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .default_value("1"),
        )
        .arg(
            Arg::new("tablespaces")
                .short('T')
                .long("tablespaces")
                .value_name("NAME:PATH,...")
                .default_value(""),
        )
        .arg(
            Arg::new("block-size")
                .short('Z')
                .long("block-size")
                .value_name("BYTES")
                .default_value("8192"),
        )
        .arg(
            Arg::new("magic")
                .short('m')
                .long("magic")
                .value_name("U32")
                .value_parser(clap::value_parser!(u32))
                .default_value("2359285"),
        )
        .arg(
            Arg::new("bwlimit")
                .short('w')
                .long("bwlimit")
                .value_name("KBPS")
                .value_parser(clap::value_parser!(u64))
                .help("Global transport rate cap, split across workers"),
        )
        .arg(
            Arg::new("tablespaces-bw")
                .short('W')
                .long("tablespaces-bw")
                .value_name("NAME:KBPS,...")
                .default_value(""),
        )
        .arg(
            Arg::new("include-files")
                .short('i')
                .long("include-files")
                .value_name("PATHS")
                .help("Absolute paths forced into whole-file uncompressed backup")
                .default_value(""),
        )
        .arg(
            Arg::new("rsync-args")
                .short('R')
                .long("rsync-args")
                .value_name("ARGS")
                .default_value(" -v"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
}

#[test]
fn verify_cli() {
    cli().debug_assert()
}

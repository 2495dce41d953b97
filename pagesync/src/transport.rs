//! Copying artifacts to and from the backup location.
//!
//! Two backends behind one dispatch: `rsync` for remote destinations
//! (`host:/path` or `rsync://`), a plain filesystem copy for local ones.
//! Both honor the same contract: a configurable number of attempts with a
//! pause in between, and relative-path preservation so the backup tree
//! mirrors the data directory exactly. Transport exhaustion is the one
//! non-retryable I/O error in the system; everything above it either falls
//! back or fails the file.

use std::fs;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::config::Config;

/// What lands at the destination. Directories are transferred as bare
/// entries (`rsync -Rd`), never recursively; their contents travel as
/// individual jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    File,
    Directory,
}

pub enum GenericTransport {
    Rsync(RsyncTransport),
    LocalFs(LocalFsTransport),
}

impl GenericTransport {
    pub fn from_config(cfg: &Config) -> GenericTransport {
        if is_remote(&cfg.backup_path) {
            GenericTransport::Rsync(RsyncTransport {
                dest: cfg.backup_path.clone(),
                retries: cfg.retries,
                pause: cfg.pause,
                bwlimit: cfg.worker_bwlimit(),
                extra_args: cfg.rsync_args.as_ref().clone(),
            })
        } else {
            GenericTransport::LocalFs(LocalFsTransport {
                dest: Utf8PathBuf::from(&cfg.backup_path),
                retries: cfg.retries,
                pause: cfg.pause,
            })
        }
    }

    /// Copy `base/rel` to `<backup root>/rel`, preserving the relative path.
    pub fn send_relative(
        &self,
        base: &Utf8Path,
        rel: &str,
        kind: TransferKind,
    ) -> anyhow::Result<()> {
        match self {
            GenericTransport::Rsync(t) => t.send_relative(base, rel, kind),
            GenericTransport::LocalFs(t) => t.send_relative(base, rel, kind),
        }
    }

    /// Fetch `<backup root>/rel` into the local path `to`.
    pub fn fetch(&self, rel: &str, to: &Utf8Path) -> anyhow::Result<()> {
        match self {
            GenericTransport::Rsync(t) => t.fetch(rel, to),
            GenericTransport::LocalFs(t) => t.fetch(rel, to),
        }
    }
}

/// Fetch an arbitrary source (`host:/path` or local) into `to`. Used for the
/// prior manifest, which need not live under the current backup root.
pub fn fetch_location(cfg: &Config, src: &str, to: &Utf8Path) -> anyhow::Result<()> {
    if is_remote(src) {
        let t = RsyncTransport {
            dest: String::new(),
            retries: cfg.retries,
            pause: cfg.pause,
            bwlimit: cfg.worker_bwlimit(),
            extra_args: cfg.rsync_args.as_ref().clone(),
        };
        t.copy_to_local(src, to)
    } else {
        with_retries(
            &format!("copy {src} to {to}"),
            cfg.retries,
            cfg.pause,
            || {
                fs::copy(src, to)
                    .map(|_| ())
                    .with_context(|| format!("copy {src} to {to}"))
            },
        )
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("rsync://")
        || location
            .split('/')
            .next()
            .is_some_and(|head| head.contains(':'))
}

fn with_retries(
    what: &str,
    retries: u32,
    pause: u64,
    mut op: impl FnMut() -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let attempts = retries.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e.context(format!("{what}: giving up after {attempt} attempts")));
                }
                warn!("{what} failed (attempt {attempt}/{attempts}): {e:#}");
                thread::sleep(Duration::from_secs(pause));
            }
        }
    }
}

pub struct RsyncTransport {
    dest: String,
    retries: u32,
    pause: u64,
    /// KB/s, already divided down to this worker's share.
    bwlimit: Option<u64>,
    extra_args: Vec<String>,
}

impl RsyncTransport {
    fn send_relative(&self, base: &Utf8Path, rel: &str, kind: TransferKind) -> anyhow::Result<()> {
        // The `/./` marker tells rsync -R where the preserved relative path
        // starts.
        let src = format!("{base}/./{rel}");
        let mut args = vec![match kind {
            TransferKind::File => "-R".to_string(),
            TransferKind::Directory => "-Rd".to_string(),
        }];
        self.push_common_args(&mut args);
        args.push(src);
        args.push(format!("{}/", self.dest));
        with_retries(
            &format!("rsync {rel} to {}", self.dest),
            self.retries,
            self.pause,
            || run_rsync(&args),
        )
    }

    fn fetch(&self, rel: &str, to: &Utf8Path) -> anyhow::Result<()> {
        self.copy_to_local(&format!("{}/{rel}", self.dest), to)
    }

    fn copy_to_local(&self, src: &str, to: &Utf8Path) -> anyhow::Result<()> {
        let mut args = Vec::new();
        self.push_common_args(&mut args);
        args.push(src.to_string());
        args.push(to.to_string());
        with_retries(
            &format!("rsync {src} to {to}"),
            self.retries,
            self.pause,
            || run_rsync(&args),
        )
    }

    fn push_common_args(&self, args: &mut Vec<String>) {
        args.extend(self.extra_args.iter().cloned());
        if let Some(limit) = self.bwlimit {
            args.push(format!("--bwlimit={limit}"));
        }
    }
}

fn run_rsync(args: &[String]) -> anyhow::Result<()> {
    debug!("running rsync {args:?}");
    let output = Command::new("rsync")
        .args(args)
        .output()
        .context("spawn rsync")?;
    if !output.status.success() {
        bail!(
            "rsync {:?} exited with {}: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub struct LocalFsTransport {
    dest: Utf8PathBuf,
    retries: u32,
    pause: u64,
}

impl LocalFsTransport {
    fn send_relative(&self, base: &Utf8Path, rel: &str, kind: TransferKind) -> anyhow::Result<()> {
        let to = self.dest.join(rel);
        with_retries(
            &format!("copy {rel} to {}", self.dest),
            self.retries,
            self.pause,
            || match kind {
                TransferKind::File => {
                    if let Some(parent) = to.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create {parent}"))?;
                    }
                    fs::copy(base.join(rel), &to)
                        .map(|_| ())
                        .with_context(|| format!("copy {rel} to {to}"))
                }
                TransferKind::Directory => {
                    fs::create_dir_all(&to).with_context(|| format!("create {to}"))
                }
            },
        )
    }

    fn fetch(&self, rel: &str, to: &Utf8Path) -> anyhow::Result<()> {
        let src = self.dest.join(rel);
        with_retries(
            &format!("copy {src} to {to}"),
            self.retries,
            self.pause,
            || {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).with_context(|| format!("create {parent}"))?;
                }
                fs::copy(&src, to)
                    .map(|_| ())
                    .with_context(|| format!("copy {src} to {to}"))
            },
        )
    }
}

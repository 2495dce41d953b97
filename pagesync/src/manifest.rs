//! The backup manifest, `file.list`: one `<relative-path>|<size>` line per
//! entry. Directory entries carry a trailing slash and size 0. The manifest
//! is the authority on which artifacts exist in a backup and how long each
//! restored file must be.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use anyhow::{bail, Context};
use camino::Utf8Path;

pub const FILE_LIST_NAME: &str = "file.list";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileList {
    entries: BTreeMap<String, u64>,
}

impl FileList {
    pub fn new() -> FileList {
        FileList::default()
    }

    pub fn insert_file(&mut self, path: &str, size: u64) {
        self.entries.insert(path.to_string(), size);
    }

    pub fn insert_dir(&mut self, path: &str) {
        let key = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        self.entries.insert(key, 0);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn size_of(&self, path: &str) -> Option<u64> {
        self.entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Non-directory entries.
    pub fn files(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries
            .iter()
            .filter(|(path, _)| !path.ends_with('/'))
            .map(|(path, size)| (path.as_str(), *size))
    }

    /// Directory entries, trailing slash included.
    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(path, _)| path.ends_with('/'))
            .map(|(path, _)| path.as_str())
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<FileList> {
        let file = File::open(path).with_context(|| format!("open file list {path}"))?;
        let mut entries = BTreeMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Some((entry, size)) = line.rsplit_once('|') else {
                bail!("malformed file list line {line:?} in {path}");
            };
            let size: u64 = size
                .parse()
                .with_context(|| format!("malformed size in file list line {line:?}"))?;
            entries.insert(entry.to_string(), size);
        }
        Ok(FileList { entries })
    }

    pub fn save(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let file = File::create(path).with_context(|| format!("create file list {path}"))?;
        let mut out = BufWriter::new(file);
        for (entry, size) in &self.entries {
            writeln!(out, "{entry}|{size}")?;
        }
        out.into_inner()
            .map_err(|e| e.into_error())
            .and_then(|f| f.sync_all())
            .with_context(|| format!("flush file list {path}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_LIST_NAME);

        let mut list = FileList::new();
        list.insert_file("base/1/1234", 24576);
        list.insert_file("global/pg_control", 8192);
        list.insert_dir("pg_wal");
        list.insert_dir("pg_notify/");
        list.save(&path).unwrap();

        let loaded = FileList::load(&path).unwrap();
        assert_eq!(loaded, list);
        assert_eq!(loaded.size_of("base/1/1234"), Some(24576));
        assert!(loaded.contains("pg_wal/"));
        assert_eq!(loaded.files().count(), 2);
        assert_eq!(loaded.dirs().count(), 2);
    }

    #[test]
    fn load_rejects_malformed_lines() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_LIST_NAME);

        std::fs::write(&path, "no-separator-here\n").unwrap();
        assert!(FileList::load(&path).is_err());

        std::fs::write(&path, "file|big\n").unwrap();
        assert!(FileList::load(&path).is_err());
    }

    #[test]
    fn paths_may_contain_pipes_only_before_the_size() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_LIST_NAME);
        std::fs::write(&path, "odd|name|42\n").unwrap();
        let list = FileList::load(&path).unwrap();
        assert_eq!(list.size_of("odd|name"), Some(42));
    }
}

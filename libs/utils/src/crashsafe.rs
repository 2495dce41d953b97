use std::fs::File;
use std::io;

use camino::Utf8Path;

/// Flush a file's contents to stable storage.
pub fn fsync_file(path: &Utf8Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Flush a freshly written file and the directory entry pointing at it.
pub fn fsync_file_and_parent(path: &Utf8Path) -> io::Result<()> {
    fsync_file(path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsync_existing_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("some_file");
        std::fs::write(&path, b"payload").unwrap();
        fsync_file_and_parent(&path).unwrap();
    }

    #[test]
    fn fsync_missing_file_is_an_error() {
        let dir = camino_tempfile::tempdir().unwrap();
        assert!(fsync_file(&dir.path().join("nope")).is_err());
    }
}

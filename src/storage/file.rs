/// Data and WAL file plumbing: creation with a durable parent directory,
/// positioned I/O and the read-only map of the data file.
use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::Mmap;

use crate::error::Result;

/// Open a file for read/write, creating it if needed. A newly created file is
/// made durable by fsyncing its parent directory, so a crash right after
/// creation cannot lose the directory entry.
pub(crate) fn open_or_create(path: &Path) -> Result<File> {
    let existed = path.exists();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    if !existed {
        fsync_parent(path);
    }
    Ok(file)
}

/// Best-effort fsync of the parent directory to persist metadata updates.
pub(crate) fn fsync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// Map the data file read-only.
///
/// Safety: the map is never written through; all writes go through positioned
/// writes on the same descriptor, which this engine serializes, and the file
/// is only ever grown while a map is live.
pub(crate) fn map_file(file: &File) -> Result<Mmap> {
    let map = unsafe { Mmap::map(file)? };
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.gvrn");
        {
            let file = open_or_create(&path).unwrap();
            file.set_len(8192).unwrap();
            file.write_all_at(b"hello", 100).unwrap();
        }
        let file = open_or_create(&path).unwrap();
        let mut buf = [0u8; 5];
        file.read_exact_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_map_sees_positioned_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.gvrn");
        let file = open_or_create(&path).unwrap();
        file.set_len(8192).unwrap();
        let map = map_file(&file).unwrap();
        file.write_all_at(b"through the fd", 0).unwrap();
        assert_eq!(&map[..14], b"through the fd");
    }
}

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;

use super::error::StorageError;
use crate::torrent::TorrentFile;

/// Backing store for the files of a torrent.
///
/// Offsets are relative to the start of `file`. Implementations must be
/// callable from any thread.
pub trait PieceWriter: Send + Sync {
    fn exists(&self, file: &TorrentFile) -> Result<bool, StorageError>;

    /// Fills all of `buf` starting at `offset`.
    fn read(&self, file: &TorrentFile, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write(&self, file: &TorrentFile, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    fn flush(&self, file: &TorrentFile) -> Result<(), StorageError>;

    /// Releases any handle held for `file`. The file may be reopened later.
    fn close(&self, file: &TorrentFile) -> Result<(), StorageError>;

    /// Moves the data of `file` to `new_path`.
    fn move_to(&self, file: &TorrentFile, new_path: &Path) -> Result<(), StorageError>;
}

fn check_bounds(file: &TorrentFile, offset: u64, length: usize) -> Result<(), StorageError> {
    match offset.checked_add(length as u64) {
        Some(end) if end <= file.length => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            offset,
            length,
            size: file.length,
        }),
    }
}

/// Keeps every file in memory. Used for tests and for torrents that are only
/// ever seeded from a buffer.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `path` with existing content.
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.lock().insert(path.into(), data);
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }
}

impl PieceWriter for MemoryWriter {
    fn exists(&self, file: &TorrentFile) -> Result<bool, StorageError> {
        Ok(self.files.lock().contains_key(&file.path))
    }

    fn read(&self, file: &TorrentFile, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(file, offset, buf.len())?;
        let files = self.files.lock();
        let data = files
            .get(&file.path)
            .ok_or_else(|| StorageError::FileNotFound(file.path.display().to_string()))?;

        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::OutOfBounds {
                offset,
                length: buf.len(),
                size: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, file: &TorrentFile, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(file, offset, data.len())?;
        let mut files = self.files.lock();
        let contents = files.entry(file.path.clone()).or_default();

        let start = offset as usize;
        let end = start + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self, _file: &TorrentFile) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&self, _file: &TorrentFile) -> Result<(), StorageError> {
        Ok(())
    }

    fn move_to(&self, file: &TorrentFile, new_path: &Path) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let data = files
            .remove(&file.path)
            .ok_or_else(|| StorageError::FileNotFound(file.path.display().to_string()))?;
        files.insert(new_path.to_path_buf(), data);
        Ok(())
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Stores files under a download directory, keeping one open handle per
/// file until it is closed.
#[derive(Debug)]
pub struct FileWriter {
    root: PathBuf,
    handles: Mutex<HashMap<PathBuf, File>>,
}

impl FileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, file: &TorrentFile) -> Result<PathBuf, StorageError> {
        validate_file_path(&file.path)?;
        Ok(self.root.join(&file.path))
    }

    fn with_handle<T>(
        &self,
        file: &TorrentFile,
        create: bool,
        op: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> Result<T, StorageError> {
        let path = self.full_path(file)?;
        let mut handles = self.handles.lock();

        if !handles.contains_key(&path) {
            if create {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(&path);
            let handle = match opened {
                Ok(handle) => handle,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::FileNotFound(path.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            };
            handles.insert(path.clone(), handle);
        }

        match handles.get_mut(&path) {
            Some(handle) => Ok(op(handle)?),
            None => Err(StorageError::FileNotFound(path.display().to_string())),
        }
    }
}

impl PieceWriter for FileWriter {
    fn exists(&self, file: &TorrentFile) -> Result<bool, StorageError> {
        Ok(self.full_path(file)?.is_file())
    }

    fn read(&self, file: &TorrentFile, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(file, offset, buf.len())?;
        self.with_handle(file, false, |handle| {
            handle.seek(SeekFrom::Start(offset))?;
            handle.read_exact(buf)
        })
    }

    fn write(&self, file: &TorrentFile, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(file, offset, data.len())?;
        self.with_handle(file, true, |handle| {
            handle.seek(SeekFrom::Start(offset))?;
            handle.write_all(data)
        })
    }

    fn flush(&self, file: &TorrentFile) -> Result<(), StorageError> {
        let path = self.full_path(file)?;
        if let Some(handle) = self.handles.lock().get_mut(&path) {
            handle.flush()?;
            handle.sync_data()?;
        }
        Ok(())
    }

    fn close(&self, file: &TorrentFile) -> Result<(), StorageError> {
        let path = self.full_path(file)?;
        if let Some(mut handle) = self.handles.lock().remove(&path) {
            handle.flush()?;
        }
        Ok(())
    }

    fn move_to(&self, file: &TorrentFile, new_path: &Path) -> Result<(), StorageError> {
        self.close(file)?;
        let from = self.full_path(file)?;
        if !from.is_file() {
            return Err(StorageError::FileNotFound(from.display().to_string()));
        }
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, new_path)?;
        Ok(())
    }
}

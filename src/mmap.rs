use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{Error, Result};

/// A writable, file-backed shared mapping. Owned by the producer.
pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn lock(&self) -> Result<()> {
        self.map.lock()?;
        Ok(())
    }
}

/// A read-only view of a mapping created by another process.
pub struct MmapView {
    map: Mmap,
    len: usize,
}

impl MmapView {
    /// Maps the first `len` bytes of `path` read-only. The file handle is not
    /// needed once the mapping exists and is closed before returning.
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if len == 0 || file_len < len {
            return Err(Error::Corrupt("segment file shorter than advertised"));
        }
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(Self { map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

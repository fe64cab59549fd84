use std::mem::{align_of, size_of};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::layout::{Payload, SegmentLayout, StreamSlot, STREAM_COUNT};
use crate::mmap::{MmapFile, MmapView};
use crate::{Error, Result};

/// What a consumer needs to map the segment: the backing file and how many
/// bytes of it hold the layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub path: PathBuf,
    pub len: usize,
}

/// The producer's writable mapping. Sole owner of ring mutation.
pub struct SharedSegment {
    mmap: MmapFile,
    ptr: *const SegmentLayout,
    path: PathBuf,
    // (dev, ino) of the file this segment created.
    identity: (u64, u64),
}

static NEXT_STAGING: AtomicU64 = AtomicU64::new(0);

// SAFETY: every field reachable through `ptr` is an atomic, and the mapping
// outlives the pointer because both are owned by this struct.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Builds the segment under a private name and renames it over `path`
    /// once the header is ready, so a consumer never maps a half-built file
    /// and an existing mapping at `path` is never truncated.
    pub fn create(path: &Path) -> Result<Self> {
        let len = page_align(size_of::<SegmentLayout>());
        let staging = staging_path(path);
        let mut mmap = match MmapFile::create(&staging, len) {
            Ok(mmap) => mmap,
            Err(err) => {
                let _ = std::fs::remove_file(&staging);
                return Err(err);
            }
        };
        mmap.as_mut_slice().fill(0);
        let ptr = mmap.as_slice().as_ptr() as *const SegmentLayout;
        if (ptr as usize) % align_of::<SegmentLayout>() != 0 {
            let _ = std::fs::remove_file(&staging);
            return Err(Error::Corrupt("segment mapping misaligned"));
        }
        let meta = mmap.file().metadata()?;
        let mut segment = Self {
            mmap,
            ptr,
            path: staging,
            identity: (meta.dev(), meta.ino()),
        };
        segment.layout().init();
        std::fs::rename(&segment.path, path)?;
        segment.path = path.to_path_buf();
        log::debug!(
            "created segment {} ({} bytes, {} streams)",
            path.display(),
            segment.mmap.len(),
            STREAM_COUNT
        );
        Ok(segment)
    }

    pub fn reference(&self) -> SegmentRef {
        SegmentRef {
            path: self.path.clone(),
            len: self.mmap.len(),
        }
    }

    pub fn layout(&self) -> &SegmentLayout {
        unsafe { &*self.ptr }
    }

    pub fn running(&self) -> i32 {
        self.layout().running()
    }

    pub(crate) fn add_running(&self, delta: i32) -> (i32, i32) {
        self.layout().add_running(delta)
    }

    pub(crate) fn publish(&self, stream: usize, payload: &Payload, timestamp: f64) -> (usize, u32) {
        self.layout().stream(stream).publish(payload, timestamp)
    }

    /// Marks every stream as not producing.
    pub(crate) fn disarm_all(&self) {
        for stream in self.layout().streams() {
            stream.disarm();
        }
    }

    pub fn lock_in_memory(&self) -> Result<()> {
        self.mmap.lock()
    }
}

impl SharedSegment {
    /// Whether `path` still names the file this segment created.
    pub fn owns_path(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => (meta.dev(), meta.ino()) == self.identity,
            Err(_) => false,
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // Consumers keep their own mapping; only the name goes away, and only
        // if nobody has replaced it since.
        if self.owns_path() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        NEXT_STAGING.fetch_add(1, Ordering::Relaxed)
    ));
    PathBuf::from(name)
}

/// A consumer's read-only mapping.
pub struct SegmentView {
    _mmap: MmapView,
    ptr: *const SegmentLayout,
}

// SAFETY: read-only mapping of atomics, owned alongside the pointer.
unsafe impl Send for SegmentView {}
unsafe impl Sync for SegmentView {}

impl SegmentView {
    pub fn open(reference: &SegmentRef) -> Result<Self> {
        if reference.len < size_of::<SegmentLayout>() {
            return Err(Error::Corrupt("segment reference too small"));
        }
        let mmap = MmapView::open(&reference.path, reference.len)?;
        let ptr = mmap.as_slice().as_ptr() as *const SegmentLayout;
        if (ptr as usize) % align_of::<SegmentLayout>() != 0 {
            return Err(Error::Corrupt("segment mapping misaligned"));
        }
        let view = Self { _mmap: mmap, ptr };
        view.layout().check_ready()?;
        Ok(view)
    }

    fn layout(&self) -> &SegmentLayout {
        unsafe { &*self.ptr }
    }

    pub fn running(&self) -> i32 {
        self.layout().running()
    }

    pub fn streams(&self) -> &[StreamSlot; STREAM_COUNT] {
        self.layout().streams()
    }

    pub fn stream(&self, index: usize) -> &StreamSlot {
        self.layout().stream(index)
    }
}

fn page_align(len: usize) -> usize {
    const PAGE: usize = 4096;
    (len + PAGE - 1) / PAGE * PAGE
}

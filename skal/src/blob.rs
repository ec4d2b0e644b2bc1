//! Blobs: reference-counted shared buffers behind pluggable allocators
//!
//! A blob is an opaque byte region created by an allocator. Access goes
//! through a [`BlobProxy`], which holds one reference to the blob, and
//! through [`BlobProxy::scoped_map`], which grants exclusive access to the
//! bytes for the guard's lifetime. At most one mapping is active per blob
//! at any instant — across every thread of this process and, for
//! shared-memory blobs, across every process sharing the segment;
//! concurrent mappers block until the active one ends.
//!
//! Two allocators are always registered:
//!
//! - `in-process`: heap-backed, ids generated, only reachable from this
//!   process
//! - `shared-memory`: OS shared memory, ids name the segment, reachable
//!   from any process on this computer
//!
//! Custom allocators (video-card buffers, network-attached storage, ...)
//! implement [`Allocator`] and are added with [`register_allocator`].

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use memmap2::MmapMut;
use once_cell::sync::Lazy;
use parking_lot::{FairMutex, FairMutexGuard};
use tracing::debug;

use crate::error::{Result, SkalError};

/// Name of the built-in heap-backed allocator
pub const IN_PROCESS_ALLOCATOR: &str = "in-process";

/// Name of the built-in shared-memory allocator
pub const SHARED_MEMORY_ALLOCATOR: &str = "shared-memory";

/// How far a blob created by an allocator can be shared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorScope {
    /// Current process only; e.g. the `in-process` allocator
    Process,
    /// Current machine; e.g. the `shared-memory` allocator
    Computer,
    /// Current system; e.g. network-attached object storage
    System,
}

impl fmt::Display for AllocatorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocatorScope::Process => "process",
            AllocatorScope::Computer => "computer",
            AllocatorScope::System => "system",
        };
        f.write_str(s)
    }
}

/// The raw byte region backing a blob
///
/// Implementations provide storage; the runtime provides reference
/// counting and mapping exclusion on top.
pub trait Region: Send {
    /// The region's bytes
    fn as_slice(&self) -> &[u8];

    /// The region's bytes, writable
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Check the region is still sound; called on every mapping attempt
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Take the region's cross-process mapping lock, if it has one
    ///
    /// Called with the in-process mapping mutex already held, right
    /// before the bytes are handed out. Blocks until the lock is
    /// available. Regions only reachable from one process need no lock.
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the lock taken by [`Region::acquire`]
    fn release(&mut self) {}
}

struct Blob {
    allocator: String,
    id: String,
    size: usize,
    // Fair unlock order: concurrent mappers are served first-come
    // first-served.
    region: FairMutex<Box<dyn Region>>,
}

/// A handle holding one reference to a blob
///
/// Cloning the proxy increments the blob's reference count; dropping it
/// decrements it, destroying the blob when the count reaches zero.
pub struct BlobProxy {
    blob: Arc<Blob>,
}

impl Clone for BlobProxy {
    fn clone(&self) -> Self {
        Self {
            blob: Arc::clone(&self.blob),
        }
    }
}

impl fmt::Debug for BlobProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobProxy")
            .field("allocator", &self.blob.allocator)
            .field("id", &self.blob.id)
            .field("size", &self.blob.size)
            .finish()
    }
}

impl BlobProxy {
    /// Wrap a freshly allocated region into a blob with one reference
    ///
    /// For use by [`Allocator`] implementations.
    pub fn new(
        allocator: impl Into<String>,
        id: impl Into<String>,
        size: usize,
        region: Box<dyn Region>,
    ) -> Self {
        Self {
            blob: Arc::new(Blob {
                allocator: allocator.into(),
                id: id.into(),
                size,
                region: FairMutex::new(region),
            }),
        }
    }

    /// Name of the allocator that created the blob
    pub fn allocator_name(&self) -> &str {
        &self.blob.allocator
    }

    /// Blob identifier
    pub fn id(&self) -> &str {
        &self.blob.id
    }

    /// Blob size in bytes
    pub fn size(&self) -> usize {
        self.blob.size
    }

    /// Current number of references to the blob
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.blob)
    }

    /// A weak handle that does not keep the blob alive
    ///
    /// Allocators use this to resolve `open` calls against blobs that are
    /// still referenced somewhere in the process.
    pub fn downgrade(&self) -> BlobWeak {
        BlobWeak {
            blob: Arc::downgrade(&self.blob),
        }
    }

    /// Map the blob's bytes into the caller's scope
    ///
    /// Blocks while another mapping is active, then yields a guard that
    /// dereferences to the bytes. The mapping ends when the guard drops,
    /// on every exit path. The guard borrows the proxy mutably, so a
    /// mapped proxy cannot be copied by its owner.
    ///
    /// Fails with a bad-blob error if the underlying region reports
    /// corruption.
    pub fn scoped_map(&mut self) -> Result<ScopedMap<'_>> {
        let mut guard = self.blob.region.lock();
        guard.validate()?;
        guard.acquire()?;
        Ok(ScopedMap { guard })
    }
}

/// Weak counterpart of [`BlobProxy`]
#[derive(Clone)]
pub struct BlobWeak {
    blob: Weak<Blob>,
}

impl BlobWeak {
    /// Recover a full proxy, if the blob is still referenced
    pub fn upgrade(&self) -> Option<BlobProxy> {
        self.blob.upgrade().map(|blob| BlobProxy { blob })
    }

    /// Whether the blob is still referenced
    pub fn is_alive(&self) -> bool {
        self.blob.strong_count() > 0
    }
}

/// Exclusive view of a blob's bytes
///
/// Keep the scope as short as possible; other mappers block until it
/// ends.
pub struct ScopedMap<'a> {
    guard: FairMutexGuard<'a, Box<dyn Region>>,
}

impl Deref for ScopedMap<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

impl DerefMut for ScopedMap<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.as_mut_slice()
    }
}

impl Drop for ScopedMap<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

/// A blob allocator
///
/// Allocators are identified by name; within a scope the name must be
/// unique, and allocators of `Computer` or wider scope must resolve the
/// same name to the same storage in every process that shares it.
pub trait Allocator: Send + Sync {
    /// Allocator name
    fn name(&self) -> &str;

    /// Reachability of the blobs this allocator creates
    fn scope(&self) -> AllocatorScope;

    /// Create a blob
    ///
    /// Whether `id` is used depends on the allocator. Fails with a
    /// bad-blob error on id collision or when the blob cannot be
    /// created.
    fn create(&self, id: &str, size: usize) -> Result<BlobProxy>;

    /// Open an existing blob by id
    ///
    /// Fails with a bad-blob error if no such blob exists or it cannot be
    /// opened.
    fn open(&self, id: &str) -> Result<BlobProxy>;
}

static ALLOCATORS: Lazy<DashMap<String, Arc<dyn Allocator>>> = Lazy::new(|| {
    let map: DashMap<String, Arc<dyn Allocator>> = DashMap::new();
    map.insert(
        IN_PROCESS_ALLOCATOR.to_string(),
        Arc::new(InProcessAllocator::default()),
    );
    map.insert(
        SHARED_MEMORY_ALLOCATOR.to_string(),
        Arc::new(SharedMemoryAllocator::default()),
    );
    map
});

/// Add a custom allocator to the process-wide registry
pub fn register_allocator(allocator: Arc<dyn Allocator>) -> Result<()> {
    let name = allocator.name().to_string();
    match ALLOCATORS.entry(name.clone()) {
        dashmap::mapref::entry::Entry::Occupied(_) => Err(SkalError::DuplicateName(name)),
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            debug!(allocator = %name, scope = %allocator.scope(), "registered allocator");
            slot.insert(allocator);
            Ok(())
        }
    }
}

/// Find an allocator by name
pub fn find_allocator(name: &str) -> Result<Arc<dyn Allocator>> {
    ALLOCATORS
        .get(name)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| SkalError::NoSuchAllocator(name.to_string()))
}

/// Create a blob through the named allocator
pub fn create_blob(allocator_name: &str, id: &str, size: usize) -> Result<BlobProxy> {
    find_allocator(allocator_name)?.create(id, size)
}

/// Open an existing blob through the named allocator
pub fn open_blob(allocator_name: &str, id: &str) -> Result<BlobProxy> {
    find_allocator(allocator_name)?.open(id)
}

struct HeapRegion {
    data: Vec<u8>,
}

impl Region for HeapRegion {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Heap-backed allocator; ids are generated and only meaningful while the
/// blob is alive in this process.
#[derive(Default)]
struct InProcessAllocator {
    seq: AtomicU64,
    live: DashMap<String, BlobWeak>,
}

impl Allocator for InProcessAllocator {
    fn name(&self) -> &str {
        IN_PROCESS_ALLOCATOR
    }

    fn scope(&self) -> AllocatorScope {
        AllocatorScope::Process
    }

    fn create(&self, _id: &str, size: usize) -> Result<BlobProxy> {
        if size == 0 {
            return Err(SkalError::bad_blob("in-process blob size must be > 0"));
        }
        let id = format!("ip-{:08x}", self.seq.fetch_add(1, Ordering::Relaxed));
        let proxy = BlobProxy::new(
            IN_PROCESS_ALLOCATOR,
            id.clone(),
            size,
            Box::new(HeapRegion {
                data: vec![0; size],
            }),
        );
        self.live.retain(|_, weak| weak.is_alive());
        self.live.insert(id, proxy.downgrade());
        Ok(proxy)
    }

    fn open(&self, id: &str) -> Result<BlobProxy> {
        let proxy = self.live.get(id).and_then(|weak| weak.upgrade());
        proxy.ok_or_else(|| SkalError::bad_blob(format!("no live in-process blob `{id}`")))
    }
}

const SEGMENT_MAGIC: u64 = 0x534b_414c_424c_4f42;
const SEGMENT_HEADER: usize = 16;

struct ShmRegion {
    mmap: MmapMut,
    // Kept open for the region's lifetime; mapping exclusion across
    // processes rides on flock(2) of this file description. Local
    // mappers are already serialized by the blob's mutex, so the fd is
    // never locked twice from this process.
    file: File,
    path: PathBuf,
    size: usize,
    owner: bool,
}

fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    loop {
        // Safety: flock takes a valid open fd and an operation constant.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl Region for ShmRegion {
    fn as_slice(&self) -> &[u8] {
        &self.mmap[SEGMENT_HEADER..SEGMENT_HEADER + self.size]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[SEGMENT_HEADER..SEGMENT_HEADER + self.size]
    }

    fn validate(&self) -> Result<()> {
        validate_segment(&self.mmap).map(|_| ())
    }

    fn acquire(&mut self) -> Result<()> {
        flock(&self.file, libc::LOCK_EX).map_err(|err| {
            SkalError::bad_blob(format!(
                "cannot lock segment `{}`: {err}",
                self.path.display()
            ))
        })
    }

    fn release(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn validate_segment(mmap: &[u8]) -> Result<usize> {
    if mmap.len() < SEGMENT_HEADER {
        return Err(SkalError::bad_blob("shared-memory segment truncated"));
    }
    let magic = u64::from_le_bytes(mmap[..8].try_into().expect("8-byte slice"));
    let size = u64::from_le_bytes(mmap[8..16].try_into().expect("8-byte slice")) as usize;
    if magic != SEGMENT_MAGIC || mmap.len() < SEGMENT_HEADER + size {
        return Err(SkalError::bad_blob("shared-memory segment corrupted"));
    }
    Ok(size)
}

/// OS shared-memory allocator; `id` names the segment computer-wide.
#[derive(Default)]
struct SharedMemoryAllocator {
    live: DashMap<String, BlobWeak>,
}

impl SharedMemoryAllocator {
    fn segment_path(id: &str) -> PathBuf {
        let base = Path::new("/dev/shm");
        let base = if base.is_dir() {
            base.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        base.join(format!("skal-{id}"))
    }
}

impl Allocator for SharedMemoryAllocator {
    fn name(&self) -> &str {
        SHARED_MEMORY_ALLOCATOR
    }

    fn scope(&self) -> AllocatorScope {
        AllocatorScope::Computer
    }

    fn create(&self, id: &str, size: usize) -> Result<BlobProxy> {
        if id.is_empty() {
            return Err(SkalError::bad_blob("shared-memory blobs need an id"));
        }
        if size == 0 {
            return Err(SkalError::bad_blob("shared-memory blob size must be > 0"));
        }
        let path = Self::segment_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    SkalError::bad_blob(format!("shared-memory blob `{id}` already exists"))
                } else {
                    SkalError::bad_blob(format!("cannot create segment for `{id}`: {e}"))
                }
            })?;
        file.set_len((SEGMENT_HEADER + size) as u64)
            .map_err(|e| SkalError::bad_blob(format!("cannot size segment for `{id}`: {e}")))?;
        // Safety: the segment file was just created with create_new and is
        // sized above; concurrent access is serialized by the blob's
        // mapping mutex.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| SkalError::bad_blob(format!("cannot map segment for `{id}`: {e}")))?;
        mmap[..8].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        mmap[8..16].copy_from_slice(&(size as u64).to_le_bytes());

        let proxy = BlobProxy::new(
            SHARED_MEMORY_ALLOCATOR,
            id,
            size,
            Box::new(ShmRegion {
                mmap,
                file,
                path,
                size,
                owner: true,
            }),
        );
        self.live.retain(|_, weak| weak.is_alive());
        self.live.insert(id.to_string(), proxy.downgrade());
        Ok(proxy)
    }

    fn open(&self, id: &str) -> Result<BlobProxy> {
        if let Some(proxy) = self.live.get(id).and_then(|weak| weak.upgrade()) {
            return Ok(proxy);
        }
        let path = Self::segment_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| SkalError::bad_blob(format!("no shared-memory blob `{id}`")))?;
        // Safety: as in create; the header is validated before use.
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| SkalError::bad_blob(format!("cannot map segment for `{id}`: {e}")))?;
        let size = validate_segment(&mmap)?;

        let proxy = BlobProxy::new(
            SHARED_MEMORY_ALLOCATOR,
            id,
            size,
            Box::new(ShmRegion {
                mmap,
                file,
                path,
                size,
                owner: false,
            }),
        );
        self.live.insert(id.to_string(), proxy.downgrade());
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique_id(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "test-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_in_process_create_and_map() {
        let mut proxy = create_blob(IN_PROCESS_ALLOCATOR, "", 100).unwrap();
        assert_eq!(proxy.size(), 100);
        assert_eq!(proxy.ref_count(), 1);

        {
            let mut map = proxy.scoped_map().unwrap();
            assert_eq!(map.len(), 100);
            map[..5].copy_from_slice(b"hello");
        }
        let map = proxy.scoped_map().unwrap();
        assert_eq!(&map[..5], b"hello");
    }

    #[test]
    fn test_in_process_zero_size_rejected() {
        assert!(matches!(
            create_blob(IN_PROCESS_ALLOCATOR, "", 0),
            Err(SkalError::BadBlob(_))
        ));
    }

    #[test]
    fn test_in_process_open_resolves_live_blob_only() {
        let proxy = create_blob(IN_PROCESS_ALLOCATOR, "", 8).unwrap();
        let id = proxy.id().to_string();

        let reopened = open_blob(IN_PROCESS_ALLOCATOR, &id).unwrap();
        assert_eq!(reopened.ref_count(), 2);
        drop(reopened);

        drop(proxy);
        assert!(matches!(
            open_blob(IN_PROCESS_ALLOCATOR, &id),
            Err(SkalError::BadBlob(_))
        ));
    }

    #[test]
    fn test_unknown_allocator() {
        assert!(matches!(
            create_blob("frame-buffer", "x", 8),
            Err(SkalError::NoSuchAllocator(_))
        ));
    }

    #[test]
    fn test_shared_memory_create_open_drop() {
        let id = unique_id("shm");
        let mut created = create_blob(SHARED_MEMORY_ALLOCATOR, &id, 32).unwrap();
        created.scoped_map().unwrap()[..4].copy_from_slice(b"ping");

        // Duplicate id is a collision
        assert!(matches!(
            create_blob(SHARED_MEMORY_ALLOCATOR, &id, 32),
            Err(SkalError::BadBlob(_))
        ));

        let mut reopened = open_blob(SHARED_MEMORY_ALLOCATOR, &id).unwrap();
        assert_eq!(reopened.size(), 32);
        assert_eq!(&reopened.scoped_map().unwrap()[..4], b"ping");

        drop(created);
        drop(reopened);
    }

    #[test]
    fn test_shared_memory_map_excludes_other_openers() {
        let id = unique_id("flock");
        let mut created = create_blob(SHARED_MEMORY_ALLOCATOR, &id, 16).unwrap();

        // Another process would open the segment on its own file
        // description; emulate its lock attempt with a second open.
        let outsider = OpenOptions::new()
            .read(true)
            .write(true)
            .open(SharedMemoryAllocator::segment_path(&id))
            .unwrap();

        let map = created.scoped_map().unwrap();
        let rc = unsafe { libc::flock(outsider.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(rc, -1, "segment lock must be held while mapped");
        drop(map);

        let rc = unsafe { libc::flock(outsider.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(rc, 0, "segment lock must be free once the mapping ends");
        unsafe { libc::flock(outsider.as_raw_fd(), libc::LOCK_UN) };
    }

    #[test]
    fn test_shared_memory_open_missing() {
        assert!(matches!(
            open_blob(SHARED_MEMORY_ALLOCATOR, &unique_id("missing")),
            Err(SkalError::BadBlob(_))
        ));
    }

    #[test]
    fn test_shared_memory_requires_id() {
        assert!(matches!(
            create_blob(SHARED_MEMORY_ALLOCATOR, "", 8),
            Err(SkalError::BadBlob(_))
        ));
    }

    #[test]
    fn test_register_allocator_duplicate() {
        struct Dummy;
        impl Allocator for Dummy {
            fn name(&self) -> &str {
                IN_PROCESS_ALLOCATOR
            }
            fn scope(&self) -> AllocatorScope {
                AllocatorScope::Process
            }
            fn create(&self, _id: &str, _size: usize) -> Result<BlobProxy> {
                unreachable!()
            }
            fn open(&self, _id: &str) -> Result<BlobProxy> {
                unreachable!()
            }
        }
        assert!(matches!(
            register_allocator(Arc::new(Dummy)),
            Err(SkalError::DuplicateName(_))
        ));
    }
}

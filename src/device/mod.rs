//! Devices, mounts, file handles, and path resolution (§4.3).
//!
//! A [`Device`] is polymorphic over the small capability set the loader
//! actually needs (`read`, `identify`); a filesystem is *probed* against a
//! device and, on success, produces a [`MountedFs`], a per-mount object
//! that has already captured the device handle it needs for subsequent
//! reads, so a filesystem instance (not just a file) owns its device.

pub mod iso9660;
pub mod partition;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt::Debug;

use crate::error::{IoError, IoResult};

/// What a [`Device`] physically is. Informational only; dispatch happens
/// through [`DeviceOps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Net,
    Virtual,
}

/// The capability set a block-ish device exposes to filesystem code.
pub trait DeviceOps: Debug + Send + Sync {
    /// Reads `buf.len()` bytes starting at byte `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> IoResult<()>;

    /// Fills `buf` with a device-specific identification string (model,
    /// image path, ...); used only for diagnostics. Returns the number of
    /// bytes written.
    fn identify(&self, buf: &mut [u8]) -> IoResult<usize>;

    /// Total size of the device in bytes, when known.
    fn size(&self) -> Option<u64>;
}

/// A probed device, optionally mounted.
pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    pub ops: Arc<dyn DeviceOps>,
    pub mount: Option<Arc<Mount>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mounted", &self.mount.is_some())
            .finish()
    }
}

/// The type of a resolved filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Dir,
}

/// A single entry produced while iterating a directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Filesystem-opaque state carried by a [`FileHandle`].
pub struct FileState {
    pub kind: EntryKind,
    pub size: u64,
    pub private: Box<dyn FilePrivate>,
}

impl Debug for FileState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileState")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}

/// Filesystem-private per-handle state, opaque outside the [`MountedFs`]
/// impl that produced it. `as_any` lets a `MountedFs` impl downcast a
/// `FileState` it is handed back to recover its own private state.
pub trait FilePrivate: Debug + Send + Sync {
    fn as_any(&self) -> &dyn core::any::Any;
}

/// A filesystem implementation that has already recognized and bound
/// itself to one device. Produced by a registered [`FsProbe`] (§4.3
/// "filesystem discovery").
pub trait MountedFs: Debug + Send + Sync {
    fn root(&self) -> FileState;
    fn uuid(&self) -> Option<String>;
    fn label(&self) -> Option<String>;
    fn case_insensitive(&self) -> bool;

    fn read(&self, handle: &FileState, buf: &mut [u8], offset: u64) -> IoResult<usize>;
    fn open_entry(&self, handle: &FileState, name: &str) -> IoResult<FileState>;
    /// Invokes `cb` once per entry in the directory `handle`.
    fn iterate(&self, handle: &FileState, cb: &mut dyn FnMut(DirEntry)) -> IoResult<()>;
}

/// A filesystem recognizer, registered against the built-in dispatch table
/// and probed in order against each device.
pub trait FsProbe: Debug {
    /// Returns `Err(UnknownFs)` if this filesystem doesn't recognize
    /// `device`; any other error is a genuine I/O failure while probing.
    fn probe(&self, device: Arc<dyn DeviceOps>) -> IoResult<Box<dyn MountedFs>>;
}

/// A mounted filesystem instance.
pub struct Mount {
    pub fs: Arc<dyn MountedFs>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub case_insensitive: bool,
}

impl Debug for Mount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mount")
            .field("uuid", &self.uuid)
            .field("label", &self.label)
            .finish()
    }
}

struct HandleInner {
    mount: Arc<Mount>,
    state: FileState,
}

/// A retain-counted handle over an open file or directory. `clone`/
/// [`retain`](Self::retain) bump the count; dropping the last reference
/// tears down the underlying state.
pub struct FileHandle {
    inner: Arc<HandleInner>,
}

impl FileHandle {
    fn new(mount: Arc<Mount>, state: FileState) -> Self {
        Self {
            inner: Arc::new(HandleInner { mount, state }),
        }
    }

    #[must_use]
    pub fn retain(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Drops this reference. Kept as an explicit method (rather than just
    /// relying on `Drop`) to mirror the retain/release vocabulary in §3.
    pub fn release(self) {}

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.inner.state.kind
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.state.size
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        self.inner.mount.fs.read(&self.inner.state, buf, offset)
    }

    pub fn iterate(&self, mut cb: impl FnMut(DirEntry)) -> IoResult<()> {
        if self.inner.state.kind != EntryKind::Dir {
            return Err(IoError::NotDir);
        }
        self.inner.mount.fs.iterate(&self.inner.state, &mut cb)
    }

    /// Opens `name` as a direct child of this directory handle. Whether
    /// the lookup is case-insensitive is entirely up to the `MountedFs`
    /// implementation (ISO9660 without Joliet mounts case-insensitively;
    /// Joliet and everything else is case-sensitive, see §4.3).
    pub fn open_entry(&self, name: &str) -> IoResult<FileHandle> {
        if self.inner.state.kind != EntryKind::Dir {
            return Err(IoError::NotDir);
        }
        let state = self.inner.mount.fs.open_entry(&self.inner.state, name)?;
        Ok(FileHandle::new(self.inner.mount.clone(), state))
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        self.retain()
    }
}

/// Which kind of entry a `fs_open` caller requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredKind {
    Any,
    File,
    Dir,
}

/// Resolves `path` starting from `start`, walking one path component at a
/// time via [`FileHandle::open_entry`]. `path` may not contain a
/// `(device)` prefix; that is stripped by the environment layer before
/// calling this (§4.3 "Path resolution").
///
/// # Errors
///
/// `NotFound` if a component is missing, `NotFile`/`NotDir` if the final
/// entry doesn't match `required`.
pub fn fs_open(start: &FileHandle, path: &str, required: RequiredKind) -> IoResult<FileHandle> {
    let mut current = start.retain();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let next = current.open_entry(component)?;
        current = next;
    }
    match (required, current.kind()) {
        (RequiredKind::File, EntryKind::Dir) => Err(IoError::NotFile),
        (RequiredKind::Dir, EntryKind::Regular) => Err(IoError::NotDir),
        _ => Ok(current),
    }
}

/// Mounts `device` by probing `fs_registry` in order and taking the first
/// implementation that recognizes it (§4.3 "Filesystem discovery").
pub fn probe_mount(
    device: Arc<dyn DeviceOps>,
    fs_registry: &[Arc<dyn FsProbe>],
) -> IoResult<Mount> {
    for prober in fs_registry {
        match prober.probe(device.clone()) {
            Ok(fs) => {
                let fs: Arc<dyn MountedFs> = fs.into();
                return Ok(Mount {
                    uuid: fs.uuid(),
                    label: fs.label(),
                    case_insensitive: fs.case_insensitive(),
                    fs,
                });
            }
            Err(IoError::UnknownFs) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(IoError::UnknownFs)
}

/// Builds the root [`FileHandle`] of a mounted filesystem.
#[must_use]
pub fn mount_root(mount: Arc<Mount>) -> FileHandle {
    let root = mount.fs.root();
    FileHandle::new(mount, root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::sync::Arc;

    #[derive(Debug)]
    struct NullPrivate;
    impl FilePrivate for NullPrivate {
        fn as_any(&self) -> &dyn core::any::Any {
            self
        }
    }

    #[derive(Debug)]
    struct MemFs;

    impl MountedFs for MemFs {
        fn root(&self) -> FileState {
            FileState {
                kind: EntryKind::Dir,
                size: 0,
                private: Box::new(NullPrivate),
            }
        }
        fn uuid(&self) -> Option<String> {
            Some("test-uuid".to_string())
        }
        fn label(&self) -> Option<String> {
            None
        }
        fn case_insensitive(&self) -> bool {
            false
        }
        fn read(&self, _handle: &FileState, _buf: &mut [u8], _offset: u64) -> IoResult<usize> {
            Ok(0)
        }
        fn open_entry(&self, _handle: &FileState, name: &str) -> IoResult<FileState> {
            if name == "missing" {
                return Err(IoError::NotFound);
            }
            Ok(FileState {
                kind: if name == "dir" { EntryKind::Dir } else { EntryKind::Regular },
                size: 42,
                private: Box::new(NullPrivate),
            })
        }
        fn iterate(&self, _handle: &FileState, _cb: &mut dyn FnMut(DirEntry)) -> IoResult<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct MemFsProbe;
    impl FsProbe for MemFsProbe {
        fn probe(&self, _device: Arc<dyn DeviceOps>) -> IoResult<Box<dyn MountedFs>> {
            Ok(Box::new(MemFs))
        }
    }

    #[derive(Debug)]
    struct NullDevice;
    impl DeviceOps for NullDevice {
        fn read(&self, _buf: &mut [u8], _offset: u64) -> IoResult<()> {
            Ok(())
        }
        fn identify(&self, _buf: &mut [u8]) -> IoResult<usize> {
            Ok(0)
        }
        fn size(&self) -> Option<u64> {
            None
        }
    }

    fn mounted_root() -> FileHandle {
        let registry: alloc::vec::Vec<Arc<dyn FsProbe>> = alloc::vec![Arc::new(MemFsProbe)];
        let mount = Arc::new(probe_mount(Arc::new(NullDevice), &registry).unwrap());
        mount_root(mount)
    }

    #[test]
    fn open_and_retain_release() {
        let root = mounted_root();
        let child = root.open_entry("file.txt").unwrap();
        assert_eq!(child.kind(), EntryKind::Regular);
        assert_eq!(child.size(), 42);
        let retained = child.retain();
        retained.release();
        child.release();
    }

    #[test]
    fn fs_open_missing_is_not_found() {
        let root = mounted_root();
        assert_eq!(
            fs_open(&root, "missing", RequiredKind::Any).unwrap_err(),
            IoError::NotFound
        );
    }

    #[test]
    fn fs_open_type_mismatch() {
        let root = mounted_root();
        assert_eq!(
            fs_open(&root, "dir", RequiredKind::File).unwrap_err(),
            IoError::NotFile
        );
        assert_eq!(
            fs_open(&root, "file.txt", RequiredKind::Dir).unwrap_err(),
            IoError::NotDir
        );
    }

    #[test]
    fn fs_open_walks_multiple_components() {
        let root = mounted_root();
        let leaf = fs_open(&root, "dir/dir/file.txt", RequiredKind::File).unwrap();
        assert_eq!(leaf.kind(), EntryKind::Regular);
    }
}

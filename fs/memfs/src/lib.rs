//! A flat, in-memory filesystem.
//!
//! `memfs` keeps every file as a byte vector in memory. There are no
//! directories: a file is named by a single component of at most
//! [`NAME_MAX`] bytes. Files grow on writes past their end, up to
//! [`MAX_FILE_SIZE`].
//!
//! Each [`MemFs::open`] returns a fresh handle. The filesystem counts the open
//! handles of every file, which lets tests observe when the kernel really
//! closes a file.
//!
//! ```no_run
//! use keel::SystemConfigurationBuilder;
//! use memfs::MemFs;
//! use std::sync::Arc;
//!
//! let fs = MemFs::new().with_file("hello.txt", b"Hello, keel!");
//! SystemConfigurationBuilder::new()
//!     .filesystem(Arc::new(fs.clone()))
//!     .boot(|| {
//!         let file = keel::fs::FileSystem::open("hello.txt").unwrap();
//!         assert_eq!(file.length(), 12);
//!     });
//! ```
use keel::{
    KernelError,
    fs::{
        InodeNumber,
        traits::{FileSystem, RegularFile},
    },
    sync::SpinLock,
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

/// Longest file name, in bytes.
pub const NAME_MAX: usize = 14;

/// Largest size a file may grow to.
pub const MAX_FILE_SIZE: usize = 8 << 20;

struct Inode {
    ino: InodeNumber,
    data: SpinLock<Vec<u8>>,
    open_count: AtomicUsize,
}

impl Inode {
    fn len(&self) -> usize {
        let data = self.data.lock();
        let len = data.len();
        data.unlock();
        len
    }
}

struct Inner {
    files: SpinLock<BTreeMap<String, Arc<Inode>>>,
    next_ino: AtomicU32,
}

/// The in-memory filesystem.
///
/// Cloning a [`MemFs`] yields another reference to the same files.
#[derive(Clone)]
pub struct MemFs(Arc<Inner>);

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn check_name(name: &str) -> Result<(), KernelError> {
    if name.is_empty() || name.contains('/') {
        Err(KernelError::InvalidArgument)
    } else if name.len() > NAME_MAX {
        Err(KernelError::NameTooLong)
    } else {
        Ok(())
    }
}

impl MemFs {
    /// Creates an empty filesystem.
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            files: SpinLock::new(BTreeMap::new()),
            // Inode 1 is reserved for the root.
            next_ino: AtomicU32::new(2),
        }))
    }

    /// Adds a file with `contents`, replacing any file of the same name.
    ///
    /// # Panics
    /// If `name` is not a valid file name.
    pub fn with_file(self, name: &str, contents: &[u8]) -> Self {
        if let Err(e) = check_name(name) {
            panic!("Invalid file name {name:?}: {e}");
        }
        let inode = self.new_inode(contents.to_vec());
        let mut files = self.0.files.lock();
        files.insert(name.to_string(), inode);
        files.unlock();
        self
    }

    fn new_inode(&self, data: Vec<u8>) -> Arc<Inode> {
        let ino = InodeNumber::new(self.0.next_ino.fetch_add(1, Ordering::SeqCst))
            .unwrap_or_else(|| panic!("Inode numbers exhausted."));
        Arc::new(Inode {
            ino,
            data: SpinLock::new(data),
            open_count: AtomicUsize::new(0),
        })
    }

    fn lookup(&self, name: &str) -> Option<Arc<Inode>> {
        let files = self.0.files.lock();
        let inode = files.get(name).cloned();
        files.unlock();
        inode
    }

    /// Number of open handles of the file named `name`.
    pub fn open_count(&self, name: &str) -> Option<usize> {
        self.lookup(name)
            .map(|inode| inode.open_count.load(Ordering::SeqCst))
    }

    /// Current contents of the file named `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.lookup(name).map(|inode| {
            let data = inode.data.lock();
            let copy = data.clone();
            data.unlock();
            copy
        })
    }

    /// Names of every file, sorted.
    pub fn file_names(&self) -> Vec<String> {
        let files = self.0.files.lock();
        let names = files.keys().cloned().collect();
        files.unlock();
        names
    }
}

impl FileSystem for MemFs {
    fn create(&self, name: &str, initial_size: usize) -> Result<(), KernelError> {
        check_name(name)?;
        if initial_size > MAX_FILE_SIZE {
            return Err(KernelError::NoSpace);
        }
        let mut files = self.0.files.lock();
        let result = if files.contains_key(name) {
            Err(KernelError::FileExist)
        } else {
            let inode = self.new_inode(vec![0; initial_size]);
            files.insert(name.to_string(), inode);
            Ok(())
        };
        files.unlock();
        log::trace!("memfs: create {name} ({initial_size} bytes) -> {result:?}");
        result
    }

    fn open(&self, name: &str) -> Result<Arc<dyn RegularFile>, KernelError> {
        check_name(name)?;
        let inode = self.lookup(name).ok_or(KernelError::NoSuchEntry)?;
        inode.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Handle { inode }))
    }

    fn remove(&self, name: &str) -> Result<(), KernelError> {
        check_name(name)?;
        let mut files = self.0.files.lock();
        let removed = files.remove(name);
        files.unlock();
        removed.map(|_| ()).ok_or(KernelError::NoSuchEntry)
    }
}

/// An open handle of a [`MemFs`] file.
pub struct Handle {
    inode: Arc<Inode>,
}

impl RegularFile for Handle {
    fn ino(&self) -> InodeNumber {
        self.inode.ino
    }

    fn size(&self) -> usize {
        self.inode.len()
    }

    fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let data = self.inode.data.lock();
        let start = position.min(data.len());
        let end = position.saturating_add(buf.len()).min(data.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
        data.unlock();
        Ok(end - start)
    }

    fn write(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let end = position
            .checked_add(buf.len())
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(KernelError::NoSpace)?;
        let mut data = self.inode.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[position..end].copy_from_slice(buf);
        data.unlock();
        Ok(buf.len())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.inode.open_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_read_write() {
        let fs = MemFs::new();
        fs.create("a.txt", 3).unwrap();
        assert_eq!(fs.create("a.txt", 0), Err(KernelError::FileExist));
        let file = fs.open("a.txt").unwrap();
        assert_eq!(file.size(), 3);
        assert_eq!(file.write(5, b"xy"), Ok(2));
        assert_eq!(
            fs.contents("a.txt").unwrap(),
            vec![0, 0, 0, 0, 0, b'x', b'y']
        );
        let mut buf = [0; 8];
        assert_eq!(file.read(5, &mut buf), Ok(2));
        assert_eq!(file.read(100, &mut buf), Ok(0));
    }

    #[test]
    fn names_are_checked() {
        let fs = MemFs::new();
        assert_eq!(fs.create("", 0), Err(KernelError::InvalidArgument));
        assert_eq!(
            fs.create("a-very-long-name.txt", 0),
            Err(KernelError::NameTooLong)
        );
        assert_eq!(fs.open("missing").err(), Some(KernelError::NoSuchEntry));
        assert_eq!(fs.remove("missing"), Err(KernelError::NoSuchEntry));
    }

    #[test]
    fn open_handles_are_counted() {
        let fs = MemFs::new().with_file("f", b"data");
        let first = fs.open("f").unwrap();
        let second = fs.open("f").unwrap();
        assert_eq!(fs.open_count("f"), Some(2));
        drop(first);
        assert_eq!(fs.open_count("f"), Some(1));
        drop(second);
        assert_eq!(fs.open_count("f"), Some(0));
    }

    #[test]
    fn removed_file_stays_readable() {
        let fs = MemFs::new().with_file("f", b"data");
        let handle = fs.open("f").unwrap();
        fs.remove("f").unwrap();
        assert!(fs.open("f").is_err());
        let mut buf = [0; 4];
        assert_eq!(handle.read(0, &mut buf), Ok(4));
        assert_eq!(&buf, b"data");
    }
}

//! # File descriptor table.
//!
//! Every process owns a [`FileStruct`], a table that maps small integers,
//! the **file descriptors**, to open files. User programs never see a
//! [`File`] directly; they name it by the descriptor the kernel handed back
//! from `open`.
//!
//! ```text
//!   fd   slot
//!  ---- -------------------------------
//!   0    standard input  (console unless redirected)
//!   1    standard output (console unless redirected)
//!   2    Arc<File> "data.txt"  ──┐
//!   3    (empty)                 │ shared open file,
//!   4    Arc<File> "data.txt"  ──┘ shared position
//!   ...
//!  511
//! ```
//!
//! Slots `0` and `1` are never handed out by [`FileStruct::install_file`];
//! while empty they stand for the console. They can still be occupied with
//! [`FileStruct::dup2`], which redirects the standard streams.
//!
//! Open files are shared with [`Arc`]. Duplicating a descriptor, or forking
//! a process, clones the [`Arc`] and nothing else, so every descriptor
//! referring to the same open file also shares its position. The file is
//! closed when its last descriptor goes away.
//!
//! Each operation validates the descriptor against the table capacity
//! ([`MAX_FD`]) at the boundary and returns
//! [`KernelError::BadFileDescriptor`] instead of touching a slot that does
//! not exist.

use keel::{
    KernelError,
    fs::{File, FileSystem},
    teletype,
};
use std::{collections::BTreeMap, sync::Arc};

/// Number of descriptor slots of a process.
pub const MAX_FD: i32 = 512;

/// Standard input.
pub const STDIN: FileDescriptor = FileDescriptor(0);
/// Standard output.
pub const STDOUT: FileDescriptor = FileDescriptor(1);

/// A file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileDescriptor(pub i32);

impl FileDescriptor {
    /// Whether this descriptor names a slot of the table.
    #[inline]
    pub fn is_valid(self) -> bool {
        (0..MAX_FD).contains(&self.0)
    }

    fn check(self) -> Result<Self, KernelError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(KernelError::BadFileDescriptor)
        }
    }
}

impl From<usize> for FileDescriptor {
    /// Takes the low 32 bits of a system call argument.
    fn from(arg: usize) -> Self {
        Self(arg as i32)
    }
}

/// The file descriptor table of a process.
#[derive(Default, Clone)]
pub struct FileStruct {
    files: BTreeMap<FileDescriptor, Arc<File>>,
}

impl FileStruct {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `file` at the lowest free descriptor in `2..MAX_FD`.
    ///
    /// If every slot is taken the file is dropped, which closes it unless
    /// another descriptor still refers to it.
    pub fn install_file(&mut self, file: Arc<File>) -> Result<FileDescriptor, KernelError> {
        let fd = (2..MAX_FD)
            .map(FileDescriptor)
            .find(|fd| !self.files.contains_key(fd))
            .ok_or(KernelError::TooManyOpenFile)?;
        self.files.insert(fd, file);
        Ok(fd)
    }

    /// Opens the file named `name` and installs it.
    ///
    /// A failed open does not consume a descriptor.
    pub fn open(&mut self, name: &str) -> Result<FileDescriptor, KernelError> {
        let file = FileSystem::open(name)?;
        let fd = self.install_file(Arc::new(file))?;
        log::debug!("open({name}) = {}", fd.0);
        Ok(fd)
    }

    /// Closes `fd`.
    ///
    /// Closing an empty or out-of-range descriptor does nothing.
    pub fn close(&mut self, fd: FileDescriptor) {
        if let Some(file) = self.files.remove(&fd) {
            log::trace!("close({}) -> {}", fd.0, file.name());
        }
    }

    /// The open file behind `fd`, if any.
    pub fn get(&self, fd: FileDescriptor) -> Option<&Arc<File>> {
        self.files.get(&fd)
    }

    fn get_file(&self, fd: FileDescriptor) -> Result<&Arc<File>, KernelError> {
        self.files
            .get(&fd.check()?)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Reads up to `buf.len()` bytes from `fd` into `buf`.
    ///
    /// An empty standard input reads the console one byte at a time and
    /// stops early once the console runs out of input.
    pub fn read(&self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
        match self.get_file(fd) {
            Ok(file) => file.read(buf),
            Err(_) if fd == STDIN => {
                let mut read = 0;
                for byte in buf.iter_mut() {
                    match teletype::input_getc() {
                        Some(b) => *byte = b,
                        None => break,
                    }
                    read += 1;
                }
                Ok(read)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes `buf` to `fd`.
    ///
    /// An empty slot other than standard input is the console. Writing
    /// nothing always succeeds.
    pub fn write(&self, fd: FileDescriptor, buf: &[u8]) -> Result<usize, KernelError> {
        fd.check()?;
        if buf.is_empty() {
            return Ok(0);
        }
        match self.files.get(&fd) {
            Some(file) => file.write(buf),
            None if fd == STDIN => Err(KernelError::BadFileDescriptor),
            None => {
                teletype::putbuf(buf);
                Ok(buf.len())
            }
        }
    }

    /// Size in bytes of the file behind `fd`.
    pub fn filesize(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.get_file(fd).map(|file| file.length())
    }

    /// Moves the position of `fd` to `position`.
    pub fn seek(&self, fd: FileDescriptor, position: usize) -> Result<(), KernelError> {
        self.get_file(fd).map(|file| file.seek(position))
    }

    /// The position of `fd`.
    pub fn tell(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        self.get_file(fd).map(|file| file.tell())
    }

    /// Makes `newfd` refer to the open file of `oldfd`.
    ///
    /// - Either descriptor out of range: [`KernelError::BadFileDescriptor`].
    /// - `oldfd == newfd`, or both already share one open file: nothing
    ///   changes.
    /// - Otherwise `newfd` is closed first, then receives a new reference to
    ///   the open file of `oldfd`. If `oldfd` is empty, `newfd` stays empty.
    ///
    /// Returns `newfd`.
    pub fn dup2(
        &mut self,
        oldfd: FileDescriptor,
        newfd: FileDescriptor,
    ) -> Result<FileDescriptor, KernelError> {
        oldfd.check()?;
        newfd.check()?;
        if oldfd == newfd {
            return Ok(newfd);
        }
        if let (Some(old), Some(new)) = (self.files.get(&oldfd), self.files.get(&newfd))
            && Arc::ptr_eq(old, new)
        {
            return Ok(newfd);
        }
        self.close(newfd);
        if let Some(file) = self.files.get(&oldfd).cloned() {
            self.files.insert(newfd, file);
        }
        Ok(newfd)
    }

    /// Closes every descriptor.
    pub fn close_all(&mut self) {
        while let Some((fd, _)) = self.files.pop_first() {
            log::trace!("close({}) on exit", fd.0);
        }
    }

    /// Occupied descriptors in ascending order.
    pub fn descriptors(&self) -> Vec<FileDescriptor> {
        self.files.keys().copied().collect()
    }

    /// Number of occupied descriptors.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no descriptor is occupied.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::SystemConfigurationBuilder;
    use memfs::MemFs;

    fn with_fs(fs: MemFs, f: impl FnOnce()) -> String {
        SystemConfigurationBuilder::new()
            .quiet(true)
            .stdin(b"xyz")
            .filesystem(Arc::new(fs))
            .boot(f)
            .output
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        with_fs(MemFs::new().with_file("a", b"aaa"), || {
            let mut table = FileStruct::new();
            let first = table.open("a").unwrap();
            let second = table.open("a").unwrap();
            assert_eq!((first, second), (FileDescriptor(2), FileDescriptor(3)));
            table.close(first);
            assert_eq!(
                table.open("a"),
                Ok(FileDescriptor(2)),
                "A closed descriptor must be reusable."
            );
        });
    }

    #[test]
    fn missing_file_consumes_no_slot() {
        with_fs(MemFs::new(), || {
            let mut table = FileStruct::new();
            assert_eq!(table.open("x.txt"), Err(KernelError::NoSuchEntry));
            assert!(table.is_empty());
        });
    }

    #[test]
    fn table_is_bounded() {
        let fs = MemFs::new().with_file("a", b"");
        let disk = fs.clone();
        with_fs(fs, move || {
            let mut table = FileStruct::new();
            for fd in 2..MAX_FD {
                assert_eq!(table.open("a"), Ok(FileDescriptor(fd)));
            }
            assert_eq!(table.open("a"), Err(KernelError::TooManyOpenFile));
            assert_eq!(
                disk.open_count("a"),
                Some(MAX_FD as usize - 2),
                "The file opened for a full table must be closed again."
            );
            table.close_all();
            assert_eq!(disk.open_count("a"), Some(0));
        });
    }

    #[test]
    fn close_is_lenient() {
        with_fs(MemFs::new(), || {
            let mut table = FileStruct::new();
            table.close(FileDescriptor(5));
            table.close(FileDescriptor(-1));
            table.close(FileDescriptor(MAX_FD));
            assert!(table.is_empty());
        });
    }

    #[test]
    fn standard_streams() {
        let output = with_fs(MemFs::new(), || {
            let table = FileStruct::new();
            let mut buf = [0; 5];
            assert_eq!(table.read(STDIN, &mut buf), Ok(3));
            assert_eq!(&buf[..3], b"xyz");
            assert_eq!(table.read(STDIN, &mut buf), Ok(0));
            assert_eq!(table.write(STDOUT, b"out"), Ok(3));
            assert_eq!(table.write(FileDescriptor(7), b"!"), Ok(1));
            assert_eq!(
                table.write(STDIN, b"in"),
                Err(KernelError::BadFileDescriptor)
            );
            assert_eq!(table.write(STDIN, b""), Ok(0));
            assert_eq!(
                table.write(FileDescriptor(MAX_FD), b"x"),
                Err(KernelError::BadFileDescriptor)
            );
            assert_eq!(
                table.read(STDOUT, &mut buf),
                Err(KernelError::BadFileDescriptor)
            );
        });
        assert_eq!(output, "out!");
    }

    #[test]
    fn dup2_shares_the_open_file() {
        let fs = MemFs::new().with_file("a", b"0123456789");
        let disk = fs.clone();
        with_fs(fs, move || {
            let mut table = FileStruct::new();
            let a = table.open("a").unwrap();
            let b = FileDescriptor(10);
            assert_eq!(table.dup2(a, b), Ok(b));
            assert!(Arc::ptr_eq(table.get(a).unwrap(), table.get(b).unwrap()));
            assert_eq!(
                disk.open_count("a"),
                Some(1),
                "dup2 must not reopen the file."
            );

            let mut buf = [0; 4];
            table.read(a, &mut buf).unwrap();
            assert_eq!(
                table.tell(b),
                Ok(4),
                "Duplicated descriptors share a position."
            );

            table.close(b);
            assert_eq!(disk.open_count("a"), Some(1));
            assert_eq!(table.filesize(a), Ok(10));
            table.close(a);
            assert_eq!(disk.open_count("a"), Some(0));
        });
    }

    #[test]
    fn dup2_edge_cases() {
        with_fs(MemFs::new().with_file("a", b"").with_file("b", b""), || {
            let mut table = FileStruct::new();
            let a = table.open("a").unwrap();
            let b = table.open("b").unwrap();
            assert_eq!(table.dup2(a, a), Ok(a));
            assert_eq!(table.descriptors(), [a, b]);

            assert_eq!(
                table.dup2(a, FileDescriptor(MAX_FD)),
                Err(KernelError::BadFileDescriptor)
            );
            assert_eq!(
                table.dup2(FileDescriptor(-3), b),
                Err(KernelError::BadFileDescriptor)
            );

            let empty = FileDescriptor(20);
            assert_eq!(table.dup2(empty, b), Ok(b));
            assert_eq!(
                table.get(b).map(|_| ()),
                None,
                "Duplicating an empty slot empties the target."
            );
            assert_eq!(table.descriptors(), [a]);
        });
    }
}

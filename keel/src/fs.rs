//! Filesystem abstraction.
//!
//! The kernel sees a flat namespace of regular files provided by a
//! [`traits::FileSystem`] registered at boot with
//! [`SystemConfigurationBuilder::filesystem`]. Opening a file yields a
//! [`File`], an open-file object with its own position. Open files are shared
//! with [`Arc`]; the underlying handle is closed when the last reference is
//! dropped.
//!
//! [`SystemConfigurationBuilder::filesystem`]: crate::SystemConfigurationBuilder::filesystem

/// Defines traits for file system operations.
pub mod traits {
    use super::InodeNumber;
    use crate::KernelError;
    use std::sync::Arc;

    /// Trait representing a filesystem.
    pub trait FileSystem
    where
        Self: Sync + Send,
    {
        /// Creates a file named `name` of `initial_size` zero bytes.
        ///
        /// # Errors
        /// - [`KernelError::FileExist`] if the name is taken.
        /// - [`KernelError::NameTooLong`] if the name is too long.
        /// - [`KernelError::InvalidArgument`] if the name is empty.
        fn create(&self, name: &str, initial_size: usize) -> Result<(), KernelError>;

        /// Opens the file named `name`.
        ///
        /// Every call returns a new handle; the handle is closed when dropped.
        fn open(&self, name: &str) -> Result<Arc<dyn RegularFile>, KernelError>;

        /// Removes the file named `name`.
        ///
        /// Handles that are already open stay usable.
        fn remove(&self, name: &str) -> Result<(), KernelError>;
    }

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports basic read and write
    /// operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the inode number of the file.
        fn ino(&self) -> InodeNumber;

        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads up to `buf.len()` bytes starting at `position`.
        ///
        /// Returns the number of bytes read, which is short at end of file.
        fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError>;

        /// Writes `buf` starting at `position`, growing the file if needed.
        ///
        /// Returns the number of bytes written.
        fn write(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError>;
    }
}

use crate::{KernelError, boot, sync::SpinLock};
use core::num::NonZeroU32;
use std::sync::Arc;

/// Inode number.
///
/// An inode number uniquely identifies a file within a filesystem.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct InodeNumber(NonZeroU32);

impl InodeNumber {
    /// Creates a [`InodeNumber`] if the given value is not zero.
    pub const fn new(n: u32) -> Option<Self> {
        if let Some(v) = NonZeroU32::new(n) {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Returns the contained value as a u32.
    #[inline]
    pub fn into_u32(&self) -> u32 {
        self.0.get()
    }
}

/// The global file system of the running kernel.
///
/// # Example
/// ```no_run
/// use keel::fs::FileSystem;
///
/// if let Ok(file) = FileSystem::open("example.txt") {
///     keel::println!("Opened file: {}", file.name());
/// }
/// ```
pub struct FileSystem {
    _p: (),
}

impl FileSystem {
    fn get() -> Result<Arc<dyn traits::FileSystem>, KernelError> {
        boot::kernel()
            .filesystem
            .clone()
            .ok_or(KernelError::NoSuchEntry)
    }

    /// Returns true if a filesystem was registered at boot.
    pub fn is_available() -> bool {
        boot::kernel().filesystem.is_some()
    }

    /// Creates a file named `name` of `initial_size` zero bytes.
    pub fn create(name: &str, initial_size: usize) -> Result<(), KernelError> {
        Self::get()?.create(name, initial_size)
    }

    /// Opens the file named `name` with its position at the beginning.
    pub fn open(name: &str) -> Result<File, KernelError> {
        let inner = Self::get()?.open(name)?;
        log::debug!("Open {name} (ino={}).", inner.ino().into_u32());
        Ok(File::new(name, inner))
    }

    /// Removes the file named `name`.
    pub fn remove(name: &str) -> Result<(), KernelError> {
        Self::get()?.remove(name)
    }
}

/// An open file.
///
/// Each open file carries its own position. Descriptors duplicated from one
/// another share the same [`File`] through an [`Arc`] and therefore share the
/// position.
pub struct File {
    name: String,
    inner: Arc<dyn traits::RegularFile>,
    position: SpinLock<usize>,
}

impl File {
    /// Wraps an open handle of the underlying filesystem.
    pub fn new(name: &str, inner: Arc<dyn traits::RegularFile>) -> Self {
        Self {
            name: name.to_string(),
            inner,
            position: SpinLock::new(0),
        }
    }

    /// The name the file was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inode number of the file.
    pub fn ino(&self) -> InodeNumber {
        self.inner.ino()
    }

    /// Size of the file in bytes.
    pub fn length(&self) -> usize {
        self.inner.size()
    }

    /// Reads from the current position and advances it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let position = self.tell();
        let read = self.inner.read(position, buf)?;
        self.seek(position + read);
        Ok(read)
    }

    /// Writes at the current position and advances it.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let position = self.tell();
        let written = self.inner.write(position, buf)?;
        self.seek(position + written);
        Ok(written)
    }

    /// Moves the position to `position` bytes from the beginning.
    ///
    /// Seeking past the end is allowed; reads there return 0 bytes.
    pub fn seek(&self, position: usize) {
        let mut guard = self.position.lock();
        *guard = position;
        guard.unlock();
    }

    /// The current position.
    pub fn tell(&self) -> usize {
        let guard = self.position.lock();
        let position = *guard;
        guard.unlock();
        position
    }
}

impl Drop for File {
    fn drop(&mut self) {
        log::debug!("Close {} (ino={}).", self.name, self.inner.ino().into_u32());
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("ino", &self.ino())
            .field("position", &self.tell())
            .finish()
    }
}

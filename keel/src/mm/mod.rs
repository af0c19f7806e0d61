//! Memory Management.
//!
//! The core abstraction is the [`Page`], which represents a single memory
//! page. A page is allocated by creating an instance of the [`Page`] struct.
//! Once every clone of a [`Page`] is dropped, the page is freed.
//!
//! User memory is reached through a [`MappedRegion`]: the result of
//! translating one user virtual address with [`page_table::PageTable::translate`]
//! (or [`Task::translate`]), naming the backing page, the offset inside it and
//! whether it may be written.
//!
//! [`Task::translate`]: crate::task::Task::translate
pub mod page_table;

use crate::{KernelError, addressing::PAGE_SIZE, sync::SpinLock};
use std::sync::Arc;

/// A representation of a memory page.
///
/// This page internally holds the reference counts. This counter increases on a
/// calling of [`Page::clone`], and decreases when the page instance is dropped.
/// Use [`Page::duplicate`] for a private copy.
#[derive(Clone)]
pub struct Page {
    inner: Arc<SpinLock<Box<[u8; PAGE_SIZE]>>>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// Allocates a zero-filled page.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SpinLock::new(Box::new([0; PAGE_SIZE]))),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Panics
    /// If the range runs past the end of the page.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        buf.copy_from_slice(&inner[offset..offset + buf.len()]);
        inner.unlock();
    }

    /// Copies `buf` into the page starting at `offset`.
    ///
    /// # Panics
    /// If the range runs past the end of the page.
    pub fn write_at(&self, offset: usize, buf: &[u8]) {
        let mut inner = self.inner.lock();
        inner[offset..offset + buf.len()].copy_from_slice(buf);
        inner.unlock();
    }

    /// Allocates a new page with the same contents.
    pub fn duplicate(&self) -> Self {
        let inner = self.inner.lock();
        let copy = inner.clone();
        inner.unlock();
        Self {
            inner: Arc::new(SpinLock::new(copy)),
        }
    }

    /// Returns true if `self` and `other` are the same page.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A user page reached through a successful translation.
#[derive(Clone)]
pub struct MappedRegion {
    page: Page,
    offset: usize,
    writable: bool,
}

impl MappedRegion {
    /// Creates a region of `page` starting at `offset`.
    pub fn new(page: Page, offset: usize, writable: bool) -> Self {
        debug_assert!(offset < PAGE_SIZE);
        Self {
            page,
            offset,
            writable,
        }
    }

    /// Bytes from the translated address to the end of its page.
    pub fn remaining(&self) -> usize {
        PAGE_SIZE - self.offset
    }

    /// Whether the region may be written.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The backing page.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Reads `buf.len()` bytes, at most up to the end of the page.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.remaining());
        self.page.read_at(self.offset, &mut buf[..len]);
        len
    }

    /// Reads the byte at the translated address.
    pub fn read_u8(&self) -> u8 {
        let mut b = [0; 1];
        self.page.read_at(self.offset, &mut b);
        b[0]
    }

    /// Writes `buf`, at most up to the end of the page.
    ///
    /// # Errors
    /// [`KernelError::BadAddress`] if the region is read-only.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        if !self.writable {
            return Err(KernelError::BadAddress);
        }
        let len = buf.len().min(self.remaining());
        self.page.write_at(self.offset, &buf[..len]);
        Ok(len)
    }
}

//! The `uaccess` module provides abstractions for interacting with user-space
//! memory in a kernel context.
//!
//! Every access goes through [`Task::translate`], which resolves one user
//! address to the page backing it or fails. Nothing is read or written before
//! the address holding it has been translated.
//!
//! Two families of helpers are provided:
//!
//! - Fallible accessors returning [`KernelError::BadAddress`]: [`UserPtrRO`],
//!   [`UserPtrWO`], [`UserU8SliceRO`], [`UserU8SliceWO`], [`UserCString`],
//!   [`copy_from_user`] and [`copy_to_user`]. Each is a one-time pointer that
//!   takes ownership of itself on use.
//! - Fatal validators, [`check_valid_address`] and [`check_valid_string`],
//!   which terminate the calling thread with exit status `-1` on failure.
use crate::{
    KernelError,
    addressing::Va,
    mm::MappedRegion,
    task::Task,
    thread::{Current, with_current},
};
use std::sync::Arc;

fn current_task() -> Arc<dyn Task> {
    with_current(|th| th.task().cloned())
        .unwrap_or_else(|| panic!("Try to access user memory on a kernel thread."))
}

fn translate(task: &dyn Task, addr: usize, is_write: bool) -> Result<MappedRegion, KernelError> {
    let va = Va::new(addr).ok_or(KernelError::BadAddress)?;
    task.translate(va, is_write)
}

/// Copies `buf.len()` bytes of user memory starting at `addr` into `buf`.
pub fn copy_from_user(addr: usize, buf: &mut [u8]) -> Result<(), KernelError> {
    let task = current_task();
    let mut done = 0;
    while done < buf.len() {
        let at = addr.checked_add(done).ok_or(KernelError::BadAddress)?;
        done += translate(task.as_ref(), at, false)?.read(&mut buf[done..]);
    }
    Ok(())
}

/// Copies `buf` into user memory starting at `addr`.
///
/// The whole range is translated before the first byte is written.
pub fn copy_to_user(addr: usize, buf: &[u8]) -> Result<(), KernelError> {
    let task = current_task();
    let mut regions = Vec::new();
    let mut covered = 0;
    while covered < buf.len() {
        let at = addr.checked_add(covered).ok_or(KernelError::BadAddress)?;
        let region = translate(task.as_ref(), at, true)?;
        covered += region.remaining();
        regions.push(region);
    }
    let mut done = 0;
    for region in regions {
        done += region.write(&buf[done..])?;
    }
    Ok(())
}

/// A one-time, read-only pointer to a user-space object of type `T`.
///
/// `T` must be a plain-old-data type: every bit pattern is a valid value.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserPtrRO<T>
where
    T: Copy,
{
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T> UserPtrRO<T>
where
    T: Copy,
{
    /// Creates a new `UserPtrRO` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        UserPtrRO {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Reads a value of type `T` from the user-space address.
    ///
    /// Takes ownership of `self` to prevent TOCTOU attacks.
    pub fn get(self) -> Result<T, KernelError> {
        let mut bytes = vec![0u8; core::mem::size_of::<T>()];
        copy_from_user(self.addr, &mut bytes)?;
        // Safety: `bytes` holds exactly size_of::<T>() initialized bytes.
        Ok(unsafe { (bytes.as_ptr() as *const T).read_unaligned() })
    }
}

/// A one-time, write-only pointer to a user-space object of type `T`.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserPtrWO<T>
where
    T: Copy,
{
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T> UserPtrWO<T>
where
    T: Copy,
{
    /// Creates a new `UserPtrWO` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        UserPtrWO {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Writes a value of type `T` to the user-space address.
    ///
    /// Returns the number of bytes written.
    pub fn put(self, other: T) -> Result<usize, KernelError> {
        let size = core::mem::size_of::<T>();
        // Safety: `other` lives for the whole call and is `size` bytes long.
        let bytes = unsafe { core::slice::from_raw_parts(&other as *const T as *const u8, size) };
        copy_to_user(self.addr, bytes)?;
        Ok(size)
    }
}

/// A one-time, read-only pointer to a slice of `u8` in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceRO {
    addr: usize,
    len: usize,
}

impl UserU8SliceRO {
    /// Creates a new `UserU8SliceRO` instance with the given user-space address
    /// and length.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceRO { addr, len }
    }

    /// Reads data from the user-space buffer into a `Vec<u8>`.
    pub fn get(self) -> Result<Vec<u8>, KernelError> {
        let mut result = vec![0; self.len];
        copy_from_user(self.addr, &mut result)?;
        Ok(result)
    }
}

/// A one-time, write-only pointer to a slice of `u8` in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceWO {
    addr: usize,
    len: usize,
}

impl UserU8SliceWO {
    /// Creates a new `UserU8SliceWO` instance with the given user-space address
    /// and length.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceWO { addr, len }
    }

    /// Writes data from a slice to the user-space buffer.
    ///
    /// At most `len` bytes are written. Returns the number of bytes written.
    pub fn put(self, other: &[u8]) -> Result<usize, KernelError> {
        let size = self.len.min(other.len());
        copy_to_user(self.addr, &other[..size])?;
        Ok(size)
    }
}

/// A pointer to a null-terminated C-style string in user-space.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Creates a new `UserCString` instance with the given user-space address.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads a null-terminated string from the user-space address.
    ///
    /// Each byte is translated before it is read, so a string running into an
    /// unmapped page fails without touching anything past the boundary.
    ///
    /// # Errors
    /// [`KernelError::BadAddress`] on an invalid address,
    /// [`KernelError::InvalidArgument`] if the bytes are not UTF-8.
    pub fn read(self) -> Result<String, KernelError> {
        let task = current_task();
        let mut ptr = self.addr;
        let mut result = Vec::new();
        loop {
            match translate(task.as_ref(), ptr, false)?.read_u8() {
                0 => {
                    return String::from_utf8(result)
                        .map_err(|_| KernelError::InvalidArgument);
                }
                v => {
                    result.push(v);
                    ptr = ptr.checked_add(1).ok_or(KernelError::BadAddress)?;
                }
            }
        }
    }
}

/// Validates a single user address.
///
/// Terminates the calling thread with `-1` if `addr` is null, lies in the
/// kernel half, or is not mapped. A byte range must be checked at both ends.
pub fn check_valid_address(addr: usize) -> Va {
    let task = current_task();
    match translate(task.as_ref(), addr, false) {
        Ok(_) => Va::new(addr).unwrap_or_else(|| Current::exit(-1)),
        Err(_) => Current::exit(-1),
    }
}

/// Validates and reads a null-terminated user string.
///
/// Every byte is validated like [`check_valid_address`] before it is read, so
/// the calling thread is terminated with `-1` as soon as the string runs
/// into an invalid page. Invalid UTF-8 is replaced, not rejected.
pub fn check_valid_string(addr: usize) -> String {
    let task = current_task();
    let mut bytes = Vec::new();
    let mut ptr = addr;
    loop {
        let region = match translate(task.as_ref(), ptr, false) {
            Ok(region) => region,
            Err(_) => Current::exit(-1),
        };
        match region.read_u8() {
            0 => break,
            b => bytes.push(b),
        }
        ptr = ptr.checked_add(1).unwrap_or_else(|| Current::exit(-1));
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

//! Virtual addressing scheme of the machine.
//!
//! A user process sees a flat virtual address space split in two halves:
//! addresses below [`KERNEL_BASE`] belong to the user, everything above is
//! reserved for the kernel. A [`Va`] is a plain wrapper around `usize` that
//! knows how to align itself to page boundaries and how to tell which half of
//! the address space it lies in.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x40_1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x40_1000);
//! assert_eq!(va.offset(), 0x234);
//! assert!((va + PAGE_SIZE).is_user());
//! ```

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Start of the kernel's reserved half of every address space.
///
/// User pointers must lie strictly below this address.
pub const KERNEL_BASE: usize = 0x80_0400_0000;

/// Represents a virtual address.
///
/// This abstraction provides utility methods for validation, alignment, and
/// address manipulation, ensuring safe and consistent handling of virtual
/// addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Example
    /// ```
    /// use abyss::addressing::Va;
    ///
    /// assert!(Va::new(0xFFFF_8000_1234_5678).is_some());
    /// assert!(Va::new(0xFFFF_7000_1234_5678).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns true if the address lies in the user half and is not null.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 != 0 && self.0 < KERNEL_BASE
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, other: usize) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::ops::AddAssign<usize> for Va {
    fn add_assign(&mut self, other: usize) {
        self.0 += other
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Self;

    fn sub(self, other: usize) -> Self::Output {
        Self(self.0 - other)
    }
}

impl core::ops::Sub<Self> for Va {
    type Output = usize;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

//! Page table of a user address space.
//!
//! A [`PageTable`] maps page-aligned user virtual addresses to [`Page`]s with
//! permission bits ([`PteFlags`]). Only the user half of the address space
//! (below [`KERNEL_BASE`]) can be mapped.
//!
//! [`PageTable::translate`] is the single entry point through which the
//! kernel turns an untrusted user address into memory it may touch.

use super::{MappedRegion, Page};
use crate::{
    KernelError,
    addressing::{KERNEL_BASE, PAGE_SIZE, Va},
};
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags for a page table entry.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed.
        const US = 1 << 2;
    }
}

/// Page table entry.
#[derive(Clone)]
pub struct Pte {
    page: Page,
    flags: PteFlags,
}

impl Pte {
    /// The mapped page.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Permission bits of this entry.
    pub fn flags(&self) -> PteFlags {
        self.flags
    }
}

/// Error while manipulating a [`PageTable`].
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// The address is not page-aligned.
    Unaligned,
    /// No mapping exists at the address.
    NotExist,
    /// A mapping already exists at the address.
    Duplicated,
    /// The address lies outside the user half.
    KernelAddress,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned | PageTableMappingError::KernelAddress => {
                KernelError::InvalidArgument
            }
            PageTableMappingError::NotExist => KernelError::BadAddress,
            PageTableMappingError::Duplicated => KernelError::FileExist,
        }
    }
}

/// The page table of a user address space.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Maps `page` at `va` with `flags`.
    ///
    /// [`PteFlags::P`] and [`PteFlags::US`] are always added.
    pub fn map(
        &mut self,
        va: Va,
        page: Page,
        flags: PteFlags,
    ) -> Result<(), PageTableMappingError> {
        if va.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        if va.into_usize() >= KERNEL_BASE {
            return Err(PageTableMappingError::KernelAddress);
        }
        if self.entries.contains_key(&va) {
            return Err(PageTableMappingError::Duplicated);
        }
        self.entries.insert(
            va,
            Pte {
                page,
                flags: flags | PteFlags::P | PteFlags::US,
            },
        );
        Ok(())
    }

    /// Maps fresh zero-filled pages covering `[va, va + len)`.
    pub fn map_zeroed(
        &mut self,
        va: Va,
        len: usize,
        flags: PteFlags,
    ) -> Result<(), PageTableMappingError> {
        let start = va.page_down();
        let end = (va + len).page_up();
        let mut page = start;
        while page < end {
            if !self.entries.contains_key(&page) {
                self.map(page, Page::new(), flags)?;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Removes the mapping at `va` and returns its page.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        if va.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        self.entries
            .remove(&va)
            .map(|pte| pte.page)
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Looks up the entry of the page containing `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        self.entries
            .get(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Returns true if the page containing `va` is mapped.
    pub fn is_mapped(&self, va: Va) -> bool {
        self.walk(va).is_ok()
    }

    /// Translates a user address.
    ///
    /// # Errors
    /// [`KernelError::BadAddress`] if `va` is null, a kernel address, not
    /// mapped, not user-accessible, or read-only while `is_write` is set.
    pub fn translate(&self, va: Va, is_write: bool) -> Result<MappedRegion, KernelError> {
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        let pte = self.walk(va).map_err(|_| KernelError::BadAddress)?;
        if !pte.flags.contains(PteFlags::P | PteFlags::US) {
            return Err(KernelError::BadAddress);
        }
        let writable = pte.flags.contains(PteFlags::RW);
        if is_write && !writable {
            return Err(KernelError::BadAddress);
        }
        Ok(MappedRegion::new(pte.page.clone(), va.offset(), writable))
    }

    /// Copies `buf.len()` bytes starting at `va` into `buf`.
    pub fn read(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let region = self.translate(va + done, false)?;
            done += region.read(&mut buf[done..]);
        }
        Ok(())
    }

    /// Copies `buf` into user memory starting at `va`.
    ///
    /// Nothing is written unless the whole range is mapped writable.
    pub fn write(&self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        let mut regions = Vec::new();
        let mut covered = 0;
        while covered < buf.len() {
            let region = self.translate(va + covered, true)?;
            covered += region.remaining();
            regions.push(region);
        }
        let mut done = 0;
        for region in regions {
            done += region.write(&buf[done..])?;
        }
        Ok(())
    }

    /// Creates a copy of this address space backed by new pages.
    pub fn duplicate(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(va, pte)| {
                    (
                        *va,
                        Pte {
                            page: pte.page.duplicate(),
                            flags: pte.flags,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Removes every mapping.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: usize) -> Va {
        Va::new(addr).expect("canonical address")
    }

    #[test]
    fn translate_rejects_null_kernel_and_unmapped() {
        let mut pt = PageTable::new();
        pt.map(va(0), Page::new(), PteFlags::RW).unwrap();
        assert!(pt.translate(va(0), false).is_err());
        assert!(pt.translate(va(0x10), false).is_ok());
        assert!(pt.translate(va(0x1000), false).is_err());
        assert!(pt.translate(va(KERNEL_BASE), false).is_err());
    }

    #[test]
    fn read_only_pages_refuse_writes() {
        let mut pt = PageTable::new();
        pt.map(va(0x4000), Page::new(), PteFlags::empty()).unwrap();
        assert!(pt.translate(va(0x4000), false).is_ok());
        assert_eq!(
            pt.translate(va(0x4000), true).err(),
            Some(KernelError::BadAddress)
        );
    }

    #[test]
    fn cross_page_copy() {
        let mut pt = PageTable::new();
        pt.map_zeroed(va(0x1000), 2 * PAGE_SIZE, PteFlags::RW)
            .unwrap();
        assert_eq!(pt.mapped_pages(), 2);
        pt.write(va(0x1ffe), b"hello").unwrap();
        let mut buf = [0; 5];
        pt.read(va(0x1ffe), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(pt.write(va(0x2ffe), b"hello").is_err());
        let mut untouched = [0; 2];
        pt.read(va(0x2ffe), &mut untouched).unwrap();
        assert_eq!(untouched, [0, 0], "a failed write must not touch memory");
    }

    #[test]
    fn map_errors() {
        let mut pt = PageTable::new();
        assert_eq!(
            pt.map(va(0x1001), Page::new(), PteFlags::RW),
            Err(PageTableMappingError::Unaligned)
        );
        pt.map(va(0x1000), Page::new(), PteFlags::RW).unwrap();
        assert_eq!(
            pt.map(va(0x1000), Page::new(), PteFlags::RW),
            Err(PageTableMappingError::Duplicated)
        );
        assert!(pt.unmap(va(0x1000)).is_ok());
        assert_eq!(
            pt.unmap(va(0x1000)).err(),
            Some(PageTableMappingError::NotExist)
        );
    }

    #[test]
    fn duplicate_copies_contents() {
        let mut pt = PageTable::new();
        pt.map_zeroed(va(0x1000), 1, PteFlags::RW).unwrap();
        pt.write(va(0x1000), b"parent").unwrap();
        let child = pt.duplicate();
        pt.write(va(0x1000), b"PARENT").unwrap();
        let mut buf = [0; 6];
        child.read(va(0x1000), &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }
}

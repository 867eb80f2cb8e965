// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction of the migration handler's x64 page tables.
//!
//! The handler runs on a dedicated 4-level hierarchy, distinct from the
//! guest OS's own tables: an identity map of all physical address space as
//! encrypted, built from 1 GiB leaves, plus a single unencrypted 1 GiB alias
//! of the first gigabyte reachable at
//! [`UNENC_VIRT_ADDR_BASE`](migration_defs::UNENC_VIRT_ADDR_BASE). The whole
//! hierarchy fits in three table pages.

use migration_defs::UNENC_VIRT_ADDR_BASE;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const X64_PTE_PRESENT: u64 = 1;
const X64_PTE_READ_WRITE: u64 = 1 << 1;
const X64_PTE_ACCESSED: u64 = 1 << 5;
const X64_PTE_DIRTY: u64 = 1 << 6;
const X64_PTE_LARGE_PAGE: u64 = 1 << 7;

const PAGE_TABLE_ENTRY_COUNT: usize = 512;

const X64_PAGE_SHIFT: u64 = 12;
const X64_PTE_BITS: u64 = 9;

/// Number of bytes in a page for X64.
pub const X64_PAGE_SIZE: u64 = 4096;

/// Number of bytes in a 1GB page for X64.
pub const X64_1GB_PAGE_SIZE: u64 = 0x40000000;

/// Number of table pages in the migration handler's hierarchy: the PML4 and
/// the two PDPTs.
pub const MIGRATION_PAGE_TABLE_COUNT: u64 = 3;

#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("entry", &self.entry)
            .field("is_present", &self.is_present())
            .field("is_large_page", &self.is_large_page())
            .finish()
    }
}

#[derive(Debug, Copy, Clone)]
pub enum PageTableEntryType {
    Leaf1GbPage(u64),
    Pde(u64),
}

impl PageTableEntry {
    const VALID_BITS: u64 = 0x000f_ffff_ffff_f000;

    pub fn is_present(&self) -> bool {
        self.entry & X64_PTE_PRESENT == X64_PTE_PRESENT
    }

    pub fn is_large_page(&self) -> bool {
        self.entry & X64_PTE_LARGE_PAGE == X64_PTE_LARGE_PAGE
    }

    /// The raw 64-bit entry.
    pub fn raw(&self) -> u64 {
        self.entry
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// Operations on page table entries parameterized by the position of the
/// encryption indicator bit.
pub trait PteOps {
    fn get_addr_mask(&self) -> u64;
    fn get_confidential_mask(&self) -> u64;

    /// Build a PTE for either a 1GB leaf or a link to another table. This
    /// sets the PTE to present, accessed, read write, and for leaves also
    /// large page and dirty.
    fn build_pte(entry_type: PageTableEntryType) -> PageTableEntry {
        let mut entry: u64 = X64_PTE_PRESENT | X64_PTE_ACCESSED | X64_PTE_READ_WRITE;

        match entry_type {
            PageTableEntryType::Leaf1GbPage(address) => {
                // Must be 1GB aligned.
                assert!(address % X64_1GB_PAGE_SIZE == 0);
                entry |= address;
                entry |= X64_PTE_LARGE_PAGE | X64_PTE_DIRTY;
            }
            PageTableEntryType::Pde(address) => {
                // Points to another pagetable.
                assert!(address % X64_PAGE_SIZE == 0);
                entry |= address;
            }
        }

        PageTableEntry { entry }
    }

    fn get_addr_from_pte(&self, pte: &PageTableEntry) -> u64 {
        pte.entry & self.get_addr_mask()
    }

    fn is_pte_confidential(&self, pte: &PageTableEntry) -> bool {
        pte.entry & self.get_confidential_mask() != 0
    }

    fn set_pte_confidentiality(&self, pte: &mut PageTableEntry, confidential: bool) {
        let mask = self.get_confidential_mask();
        if confidential {
            pte.entry |= mask;
        } else {
            pte.entry &= !mask;
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRY_COUNT],
}

impl PageTable {
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Get an AMD64 PTE index based on page table level.
pub fn get_amd64_pte_index(gva: u64, page_map_level: u64) -> u64 {
    let index = gva >> (X64_PAGE_SHIFT + page_map_level * X64_PTE_BITS);
    index & ((1 << X64_PTE_BITS) - 1)
}

/// The migration handler's paging hierarchy, in the order the table pages
/// are laid out in the page-table pool.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MigrationPageTables {
    pml4: PageTable,
    encrypted_pdpt: PageTable,
    unencrypted_pdpt: PageTable,
}

impl MigrationPageTables {
    /// The top-level table.
    pub fn pml4(&self) -> &PageTable {
        &self.pml4
    }

    /// The table of 1GB leaves identity mapping all of physical address
    /// space as encrypted.
    pub fn encrypted_pdpt(&self) -> &PageTable {
        &self.encrypted_pdpt
    }

    /// The table holding the single unencrypted 1GB alias of low memory.
    pub fn unencrypted_pdpt(&self) -> &PageTable {
        &self.unencrypted_pdpt
    }
}

/// Builds the migration handler's page tables for a given table placement.
///
/// `table_base_gpa` is where the three table pages will reside; the PML4 is
/// the first page, followed by the encrypted PDPT and the unencrypted PDPT.
#[derive(Debug, Clone)]
pub struct MigrationPageTableBuilder {
    table_base_gpa: u64,
    encryption_bit: Option<u8>,
}

impl PteOps for MigrationPageTableBuilder {
    fn get_addr_mask(&self) -> u64 {
        PageTableEntry::VALID_BITS & !self.get_confidential_mask()
    }

    fn get_confidential_mask(&self) -> u64 {
        if let Some(encryption_bit) = self.encryption_bit {
            1u64 << encryption_bit
        } else {
            0
        }
    }
}

impl MigrationPageTableBuilder {
    pub fn new(table_base_gpa: u64) -> Self {
        MigrationPageTableBuilder {
            table_base_gpa,
            encryption_bit: None,
        }
    }

    /// Set the position of the encryption indicator bit in physical
    /// addresses. Required before building.
    pub fn with_encryption_bit(mut self, bit_position: u8) -> Self {
        assert!((32..52).contains(&bit_position));
        self.encryption_bit = Some(bit_position);
        self
    }

    /// The value to load as the paging root: the PML4's physical address
    /// with the encryption bit set, since the tables themselves live in
    /// encrypted memory.
    pub fn cr3(&self) -> u64 {
        assert!(self.encryption_bit.is_some(), "encryption bit not set");
        self.table_base_gpa | self.get_confidential_mask()
    }

    /// Build the hierarchy.
    ///
    /// Every guest-physical address is mapped at its identity virtual
    /// address as encrypted, and the first 1 GiB is additionally mapped
    /// unencrypted at `address + UNENC_VIRT_ADDR_BASE`. Entries not
    /// populated here stay zeroed, so nothing else is mapped.
    pub fn build(&self) -> MigrationPageTables {
        if self.encryption_bit.is_none() {
            panic!("encryption bit not set");
        }

        if self.table_base_gpa % X64_PAGE_SIZE != 0 {
            panic!("table base not 4k aligned");
        }

        let mut tables = MigrationPageTables::new_zeroed();
        let encrypted_pdpt_gpa = self.table_base_gpa + X64_PAGE_SIZE;
        let unencrypted_pdpt_gpa = self.table_base_gpa + 2 * X64_PAGE_SIZE;

        // Link the bottom PML4 slot to the encrypted PDPT.
        let mut entry = Self::build_pte(PageTableEntryType::Pde(encrypted_pdpt_gpa));
        self.set_pte_confidentiality(&mut entry, true);
        tables.pml4[0] = entry;

        // Link the unencrypted window's PML4 slot to its PDPT. The table
        // page itself is private memory; only the leaf drops the
        // encryption bit.
        let window_index = get_amd64_pte_index(UNENC_VIRT_ADDR_BASE, 3) as usize;
        let mut entry = Self::build_pte(PageTableEntryType::Pde(unencrypted_pdpt_gpa));
        self.set_pte_confidentiality(&mut entry, true);
        tables.pml4[window_index] = entry;

        // Identity map all 512 GiB of physical address space as encrypted,
        // one 1GB leaf per entry.
        let mut page_addr = 0;
        for entry in tables.encrypted_pdpt.iter_mut() {
            let mut leaf = Self::build_pte(PageTableEntryType::Leaf1GbPage(page_addr));
            self.set_pte_confidentiality(&mut leaf, true);
            *entry = leaf;
            page_addr += X64_1GB_PAGE_SIZE;
        }

        // One unencrypted 1GB leaf of the first gigabyte. The remaining
        // entries stay not-present: the window exposes low memory only.
        tables.unencrypted_pdpt[0] = Self::build_pte(PageTableEntryType::Leaf1GbPage(0));

        tables
    }
}

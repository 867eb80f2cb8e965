// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One-time setup of the migration handler's memory.
//!
//! This runs once during firmware boot, before the guest OS takes over
//! memory management: it allocates the handler's stack and page-table pool,
//! builds the dual-mapped page tables, and deposits the entry trampoline,
//! descriptor table, and entry-addresses block in the reserved entry region.
//! Everything the command loop will later touch is pinned here; after the
//! guest OS boots, no further allocation is possible.

use crate::arch;
use crate::config::MigrationConfig;
use crate::context::MigrationContext;
use crate::logger::log;
use memory_range::MemoryRange;
use migration_defs::EntryAddrs;
use migration_defs::MIGRATION_ENTRY_ADDRS_OFFSET;
use migration_defs::MIGRATION_ENTRY_CODE_MAX;
use migration_defs::MIGRATION_ENTRY_CODE_OFFSET;
use migration_defs::MIGRATION_ENTRY_GDT_MAX;
use migration_defs::MIGRATION_ENTRY_GDT_OFFSET;
use migration_defs::MIGRATION_ENTRY_LONG_MODE_OFFSET;
use migration_defs::MIGRATION_ENTRY_REGION_PAGES;
use migration_defs::MIGRATION_HANDLER_STACK_PAGES;
use migration_defs::MIGRATION_MAILBOX_REGION_PAGES;
use migration_defs::MIGRATION_PAGE_SIZE;
use migration_defs::MIGRATION_PAGE_TABLE_PAGE_INDEX;
use migration_defs::MIGRATION_PAGE_TABLE_POOL_PAGES;
use page_table::x64::MigrationPageTableBuilder;
use page_table::x64::X64_1GB_PAGE_SIZE;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Page allocation during firmware boot.
///
/// Pages handed out here must stay reserved for the life of the VM; the
/// firmware glue backs this with its runtime-memory allocator so the guest
/// OS never reclaims them.
pub trait RuntimePageAllocator {
    /// Allocates `pages` contiguous 4KiB pages, returning the base address,
    /// or `None` if the allocation cannot be satisfied.
    fn allocate_runtime_pages(&mut self, pages: u64) -> Option<u64>;
}

/// Write access to guest-physical memory during setup.
pub trait SetupMemory {
    /// Writes `data` at `gpa`.
    fn write_bytes(&mut self, gpa: u64, data: &[u8]);
}

/// The two trampoline stubs deposited in the entry region.
///
/// The hypervisor enters the protected-mode stub with paging off; it
/// enables long mode, loads the handler's page tables and stack from the
/// entry-addresses block, and jumps to the handler entrypoint.
#[derive(Debug, Copy, Clone)]
pub struct TrampolineCode<'a> {
    /// Entered in 32-bit protected mode at offset 0 of the entry region.
    pub protected_mode: &'a [u8],
    /// The 64-bit continuation the protected-mode stub far-jumps to.
    pub long_mode: &'a [u8],
}

/// An error preparing the migration handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    /// Migration support is not enabled for this VM.
    #[error("migration support is not enabled")]
    Disabled,
    /// The reserved mailbox region has the wrong size.
    #[error("invalid mailbox region {0}")]
    InvalidMailboxRegion(MemoryRange),
    /// The reserved mailbox region is not reachable through the unencrypted
    /// window.
    #[error("mailbox region {0} is beyond the unencrypted window")]
    MailboxOutsideWindow(MemoryRange),
    /// The reserved entry region has the wrong size.
    #[error("invalid entry region {0}")]
    InvalidEntryRegion(MemoryRange),
    /// The mailbox and entry regions overlap.
    #[error("mailbox and entry regions overlap")]
    OverlappingRegions,
    /// The encryption bit position is outside the architectural range.
    #[error("invalid encryption bit position {0}")]
    InvalidEncryptionBit(u8),
    /// A trampoline stub does not fit its slot in the entry region.
    #[error("trampoline code too large")]
    TrampolineTooLarge,
    /// The descriptor table does not fit its slot in the entry region.
    #[error("descriptor table too large")]
    DescriptorTableTooLarge,
    /// A runtime page allocation failed.
    #[error("failed to allocate {0} runtime pages")]
    OutOfMemory(u64),
}

/// Prepares the migration handler and returns the context the command loop
/// runs from.
///
/// On success the handler's stack and page tables are allocated and
/// initialized, and the entry region holds everything the hypervisor-driven
/// trampoline needs to switch a processor into the handler.
pub fn setup_migration_handler(
    config: &MigrationConfig,
    allocator: &mut impl RuntimePageAllocator,
    memory: &mut impl SetupMemory,
    trampoline: TrampolineCode<'_>,
    gdt: &[u8],
    handler_entry: u64,
) -> Result<MigrationContext, SetupError> {
    if !config.enabled {
        return Err(SetupError::Disabled);
    }
    if config.mailbox.len() != MIGRATION_MAILBOX_REGION_PAGES * MIGRATION_PAGE_SIZE {
        return Err(SetupError::InvalidMailboxRegion(config.mailbox));
    }
    // The command loop reaches the mailbox through the unencrypted window,
    // which covers the first 1 GiB only.
    if config.mailbox.end() > X64_1GB_PAGE_SIZE {
        return Err(SetupError::MailboxOutsideWindow(config.mailbox));
    }
    if config.entry_region.len() != MIGRATION_ENTRY_REGION_PAGES * MIGRATION_PAGE_SIZE {
        return Err(SetupError::InvalidEntryRegion(config.entry_region));
    }
    if config.mailbox.overlaps(&config.entry_region) {
        return Err(SetupError::OverlappingRegions);
    }
    if !(32..52).contains(&config.encryption_bit) {
        return Err(SetupError::InvalidEncryptionBit(config.encryption_bit));
    }
    if trampoline.protected_mode.len() as u64 > MIGRATION_ENTRY_CODE_MAX
        || trampoline.long_mode.len() as u64 > MIGRATION_ENTRY_CODE_MAX
    {
        return Err(SetupError::TrampolineTooLarge);
    }
    if gdt.len() as u64 > MIGRATION_ENTRY_GDT_MAX {
        return Err(SetupError::DescriptorTableTooLarge);
    }

    let stack_base = allocator
        .allocate_runtime_pages(MIGRATION_HANDLER_STACK_PAGES)
        .ok_or(SetupError::OutOfMemory(MIGRATION_HANDLER_STACK_PAGES))?;
    let stack = MemoryRange::new(
        stack_base..stack_base + MIGRATION_HANDLER_STACK_PAGES * MIGRATION_PAGE_SIZE,
    );

    let pool_base = allocator
        .allocate_runtime_pages(MIGRATION_PAGE_TABLE_POOL_PAGES)
        .ok_or(SetupError::OutOfMemory(MIGRATION_PAGE_TABLE_POOL_PAGES))?;
    let page_table_pool = MemoryRange::new(
        pool_base..pool_base + MIGRATION_PAGE_TABLE_POOL_PAGES * MIGRATION_PAGE_SIZE,
    );

    // The table pages start one page into the pool; zero the whole pool
    // first so the unused tail never carries stale mappings.
    let zero_page = [0u8; MIGRATION_PAGE_SIZE as usize];
    for page in 0..MIGRATION_PAGE_TABLE_POOL_PAGES {
        memory.write_bytes(pool_base + page * MIGRATION_PAGE_SIZE, &zero_page);
    }

    let table_base = pool_base + MIGRATION_PAGE_TABLE_PAGE_INDEX * MIGRATION_PAGE_SIZE;
    let builder =
        MigrationPageTableBuilder::new(table_base).with_encryption_bit(config.encryption_bit);
    let tables = builder.build();
    memory.write_bytes(table_base, tables.as_bytes());

    let entry = config.entry_region.start();
    memory.write_bytes(
        entry + MIGRATION_ENTRY_CODE_OFFSET,
        trampoline.protected_mode,
    );
    memory.write_bytes(entry + MIGRATION_ENTRY_LONG_MODE_OFFSET, trampoline.long_mode);
    let addrs = EntryAddrs {
        cr3: builder.cr3(),
        stack_base,
        mh_base: handler_entry,
    };
    memory.write_bytes(entry + MIGRATION_ENTRY_ADDRS_OFFSET, addrs.as_bytes());
    memory.write_bytes(entry + MIGRATION_ENTRY_GDT_OFFSET, gdt);

    log!("Migration handler ready, cr3 {:#x}", builder.cr3());

    Ok(MigrationContext {
        cr3: builder.cr3(),
        mailbox: config.mailbox,
        page_table_pool,
        stack,
    })
}

/// Parks a migration target until the hypervisor replaces its state.
///
/// A target VM boots only far enough to stand up the handler; the
/// hypervisor then overwrites memory and CPU state from the source and
/// resumes execution there, so this never returns.
pub fn park_for_migration() -> ! {
    log!("Parking for incoming migration");
    loop {
        arch::cpu_relax();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_defs::UNENC_VIRT_ADDR_BASE;
    use page_table::x64::get_amd64_pte_index;
    use page_table::x64::PageTable;
    use zerocopy::FromBytes;

    const PAGE: u64 = MIGRATION_PAGE_SIZE;

    struct TestAllocator {
        next: u64,
        pages_left: u64,
    }

    impl TestAllocator {
        fn new(base: u64, pages: u64) -> Self {
            Self {
                next: base,
                pages_left: pages,
            }
        }
    }

    impl RuntimePageAllocator for TestAllocator {
        fn allocate_runtime_pages(&mut self, pages: u64) -> Option<u64> {
            if pages > self.pages_left {
                return None;
            }
            let base = self.next;
            self.next += pages * PAGE;
            self.pages_left -= pages;
            Some(base)
        }
    }

    /// Flat memory image starting at physical zero.
    struct TestMemory {
        bytes: Vec<u8>,
    }

    impl TestMemory {
        fn new(size: usize) -> Self {
            Self {
                bytes: vec![0; size],
            }
        }

        fn slice(&self, gpa: u64, len: usize) -> &[u8] {
            &self.bytes[gpa as usize..gpa as usize + len]
        }
    }

    impl SetupMemory for TestMemory {
        fn write_bytes(&mut self, gpa: u64, data: &[u8]) {
            self.bytes[gpa as usize..gpa as usize + data.len()].copy_from_slice(data);
        }
    }

    const MAILBOX: MemoryRange = MemoryRange::new(0x1000..0x3000);
    const ENTRY: MemoryRange = MemoryRange::new(0x3000..0x4000);
    const HEAP_BASE: u64 = 0x10000;

    fn test_config() -> MigrationConfig {
        MigrationConfig {
            enabled: true,
            is_target: false,
            mailbox: MAILBOX,
            entry_region: ENTRY,
            encryption_bit: 47,
        }
    }

    fn run_setup(
        config: &MigrationConfig,
        allocator: &mut TestAllocator,
        memory: &mut TestMemory,
    ) -> Result<MigrationContext, SetupError> {
        setup_migration_handler(
            config,
            allocator,
            memory,
            TrampolineCode {
                protected_mode: &[0x90; 0x40],
                long_mode: &[0xcc; 0x30],
            },
            &[0u8; 24],
            0x8000,
        )
    }

    #[test]
    fn disabled_is_an_error() {
        let mut config = test_config();
        config.enabled = false;
        let err = run_setup(
            &config,
            &mut TestAllocator::new(HEAP_BASE, 64),
            &mut TestMemory::new(0x40000),
        )
        .unwrap_err();
        assert_eq!(err, SetupError::Disabled);
    }

    #[test]
    fn wrong_sized_regions_are_rejected() {
        let mut config = test_config();
        config.mailbox = MemoryRange::new(0x1000..0x2000);
        assert_eq!(
            run_setup(
                &config,
                &mut TestAllocator::new(HEAP_BASE, 64),
                &mut TestMemory::new(0x40000),
            )
            .unwrap_err(),
            SetupError::InvalidMailboxRegion(config.mailbox)
        );

        let mut config = test_config();
        config.entry_region = MemoryRange::new(0x3000..0x5000);
        assert_eq!(
            run_setup(
                &config,
                &mut TestAllocator::new(HEAP_BASE, 64),
                &mut TestMemory::new(0x40000),
            )
            .unwrap_err(),
            SetupError::InvalidEntryRegion(config.entry_region)
        );
    }

    #[test]
    fn mailbox_beyond_unencrypted_window_is_rejected() {
        // A mailbox past 1 GiB passes the size check but can never be
        // reached through the unencrypted window at migration time.
        let mut config = test_config();
        config.mailbox = MemoryRange::new(0x1_0000_0000..0x1_0000_2000);
        assert_eq!(
            run_setup(
                &config,
                &mut TestAllocator::new(HEAP_BASE, 64),
                &mut TestMemory::new(0x40000),
            )
            .unwrap_err(),
            SetupError::MailboxOutsideWindow(config.mailbox)
        );
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut config = test_config();
        config.entry_region = MemoryRange::new(0x2000..0x3000);
        assert_eq!(
            run_setup(
                &config,
                &mut TestAllocator::new(HEAP_BASE, 64),
                &mut TestMemory::new(0x40000),
            )
            .unwrap_err(),
            SetupError::OverlappingRegions
        );
    }

    #[test]
    fn out_of_range_encryption_bit_is_rejected() {
        for bit in [0, 31, 52, 63] {
            let mut config = test_config();
            config.encryption_bit = bit;
            assert_eq!(
                run_setup(
                    &config,
                    &mut TestAllocator::new(HEAP_BASE, 64),
                    &mut TestMemory::new(0x40000),
                )
                .unwrap_err(),
                SetupError::InvalidEncryptionBit(bit)
            );
        }
    }

    #[test]
    fn oversized_blobs_are_rejected() {
        let config = test_config();
        let err = setup_migration_handler(
            &config,
            &mut TestAllocator::new(HEAP_BASE, 64),
            &mut TestMemory::new(0x40000),
            TrampolineCode {
                protected_mode: &[0x90; 0x51],
                long_mode: &[],
            },
            &[],
            0x8000,
        )
        .unwrap_err();
        assert_eq!(err, SetupError::TrampolineTooLarge);

        let err = setup_migration_handler(
            &config,
            &mut TestAllocator::new(HEAP_BASE, 64),
            &mut TestMemory::new(0x40000),
            TrampolineCode {
                protected_mode: &[],
                long_mode: &[],
            },
            &[0u8; 0xa01],
            0x8000,
        )
        .unwrap_err();
        assert_eq!(err, SetupError::DescriptorTableTooLarge);
    }

    #[test]
    fn allocation_failure_is_reported() {
        // Enough for the stack but not the page-table pool.
        let err = run_setup(
            &test_config(),
            &mut TestAllocator::new(HEAP_BASE, MIGRATION_HANDLER_STACK_PAGES + 1),
            &mut TestMemory::new(0x40000),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SetupError::OutOfMemory(MIGRATION_PAGE_TABLE_POOL_PAGES)
        );
    }

    #[test]
    fn successful_setup_lays_out_all_regions() {
        let mut allocator = TestAllocator::new(HEAP_BASE, 64);
        let mut memory = TestMemory::new(0x40000);
        let context = run_setup(&test_config(), &mut allocator, &mut memory).unwrap();

        // Stack first, pool second, both contiguous from the heap base.
        assert_eq!(
            context.stack,
            MemoryRange::new(HEAP_BASE..HEAP_BASE + 4 * PAGE)
        );
        let pool_base = HEAP_BASE + 4 * PAGE;
        assert_eq!(
            context.page_table_pool,
            MemoryRange::new(pool_base..pool_base + 11 * PAGE)
        );
        assert_eq!(context.mailbox, MAILBOX);

        // The paging root points one page into the pool and carries the
        // encryption bit.
        let table_base = pool_base + PAGE;
        assert_eq!(context.cr3, table_base | 1 << 47);

        // The PML4 landed at the table base with both mappings present.
        let pml4 = PageTable::read_from_bytes(memory.slice(table_base, PAGE as usize)).unwrap();
        assert!(pml4[0].is_present());
        assert!(pml4[get_amd64_pte_index(UNENC_VIRT_ADDR_BASE, 3) as usize].is_present());

        // The pool tail beyond the three table pages stays zeroed.
        assert!(memory
            .slice(table_base + 3 * PAGE, (7 * PAGE) as usize)
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn successful_setup_populates_entry_region() {
        let mut allocator = TestAllocator::new(HEAP_BASE, 64);
        let mut memory = TestMemory::new(0x40000);
        let context = run_setup(&test_config(), &mut allocator, &mut memory).unwrap();

        let entry = ENTRY.start();
        assert_eq!(memory.slice(entry, 0x40), &[0x90; 0x40]);
        assert_eq!(
            memory.slice(entry + MIGRATION_ENTRY_LONG_MODE_OFFSET, 0x30),
            &[0xcc; 0x30]
        );
        assert_eq!(
            memory.slice(entry + MIGRATION_ENTRY_GDT_OFFSET, 24),
            &[0u8; 24]
        );

        let addrs = EntryAddrs::read_from_bytes(
            memory.slice(entry + MIGRATION_ENTRY_ADDRS_OFFSET, 24),
        )
        .unwrap();
        assert_eq!(addrs.cr3, context.cr3);
        assert_eq!(addrs.stack_base, context.stack.start());
        assert_eq!(addrs.mh_base, 0x8000);
    }
}

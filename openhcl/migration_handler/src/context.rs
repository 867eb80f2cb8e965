// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The migration context produced by setup and consumed by the command
//! loop.

use memory_range::MemoryRange;
use migration_defs::MIGRATION_PAGE_SIZE;
use migration_defs::MIGRATION_SCRATCH_PAGE_INDEX;

/// Everything the command loop needs to run, computed once at setup time.
///
/// There is exactly one context: setup constructs it, the firmware glue
/// publishes the pieces the trampoline needs, and the command loop consumes
/// it. No global state is involved.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// The paging root for the handler's private page tables, with the
    /// encryption bit set.
    pub cr3: u64,
    /// The mailbox region (mailbox page plus scratch page).
    pub mailbox: MemoryRange,
    /// The runtime-allocated page-table pool.
    pub page_table_pool: MemoryRange,
    /// The handler's private stack.
    pub stack: MemoryRange,
}

impl MigrationContext {
    /// The guest-physical address of the scratch page that stages page
    /// contents in both directions.
    pub fn scratch_page_gpa(&self) -> u64 {
        self.mailbox.start() + MIGRATION_SCRATCH_PAGE_INDEX * MIGRATION_PAGE_SIZE
    }

    /// The ranges an import must never overwrite.
    pub fn guard_regions(&self) -> GuardRegions {
        GuardRegions {
            mailbox: self.mailbox,
            page_tables: self.page_table_pool,
            stack: self.stack,
        }
    }
}

/// The three disjoint ranges that protect the handler's own control
/// structures from the import path. Immutable for the life of the command
/// loop.
#[derive(Debug, Clone)]
pub struct GuardRegions {
    /// The mailbox region, including the scratch page.
    pub mailbox: MemoryRange,
    /// The page-table pool.
    pub page_tables: MemoryRange,
    /// The handler's private stack.
    pub stack: MemoryRange,
}

impl GuardRegions {
    /// Returns whether importing a page at `gpa` would touch any guard
    /// region.
    ///
    /// The whole destination page is checked, not just its first byte: a
    /// page landing just below a region would otherwise overwrite most of
    /// it.
    pub fn denies_import(&self, gpa: u64) -> bool {
        let end = gpa.saturating_add(MIGRATION_PAGE_SIZE);
        [&self.mailbox, &self.page_tables, &self.stack]
            .iter()
            .any(|region| gpa < region.end() && end > region.start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guards() -> GuardRegions {
        GuardRegions {
            mailbox: MemoryRange::new(0x10000..0x12000),
            page_tables: MemoryRange::new(0x20000..0x2b000),
            stack: MemoryRange::new(0x30000..0x34000),
        }
    }

    #[test]
    fn denies_addresses_inside_regions() {
        let guards = guards();
        assert!(guards.denies_import(0x10000));
        assert!(guards.denies_import(0x11000));
        assert!(guards.denies_import(0x20000));
        assert!(guards.denies_import(0x2a000));
        assert!(guards.denies_import(0x30000));
        assert!(guards.denies_import(0x33fff));
    }

    #[test]
    fn denies_pages_overlapping_region_start() {
        // The byte at gpa is outside the region, but the page is not.
        assert!(guards().denies_import(0xf001));
        assert!(guards().denies_import(0xffff));
    }

    #[test]
    fn allows_addresses_outside_regions() {
        let guards = guards();
        assert!(!guards.denies_import(0x0));
        assert!(!guards.denies_import(0xf000));
        assert!(!guards.denies_import(0x12000));
        assert!(!guards.denies_import(0x2b000));
        assert!(!guards.denies_import(0x34000));
        assert!(!guards.denies_import(0x100000));
    }

    #[test]
    fn scratch_page_follows_mailbox_page() {
        let context = MigrationContext {
            cr3: 0,
            mailbox: MemoryRange::new(0x10000..0x12000),
            page_table_pool: MemoryRange::new(0x20000..0x2b000),
            stack: MemoryRange::new(0x30000..0x34000),
        };
        assert_eq!(context.scratch_page_gpa(), 0x11000);
    }
}

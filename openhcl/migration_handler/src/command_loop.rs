// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The mailbox command loop.
//!
//! This runs after the external trampoline has loaded the handler's page
//! tables, stack, and descriptors: one logical thread of control, interrupts
//! masked, no re-entrancy, no locking. The hypervisor is the only other
//! actor, and it communicates purely through the mailbox handshake. The loop
//! never returns; the only way out is an external VM reset.

use crate::arch;
use crate::context::GuardRegions;
use crate::context::MigrationContext;
use crate::logger::log;
use crate::mailbox::Mailbox;
use migration_defs::MhCommand;
use migration_defs::MhResult;
use migration_defs::MIGRATION_PAGE_SIZE;
use migration_defs::UNENC_VIRT_ADDR_BASE;

/// Access to guest-physical memory through the handler's dual mappings.
///
/// On the handler's page tables every guest-physical address is reachable as
/// encrypted at its identity virtual address, and the first 1 GiB is also
/// reachable as unencrypted at a fixed virtual offset. Tests substitute an
/// arena-backed implementation.
pub trait AddressSpace {
    /// A pointer to `gpa` through the encrypted identity mapping.
    fn encrypted(&self, gpa: u64) -> *mut u8;

    /// A pointer to `gpa` through the unencrypted window. Valid for the
    /// first 1 GiB of guest-physical memory only.
    fn shared(&self, gpa: u64) -> *mut u8;
}

/// The dual mapping as seen from the handler's own page tables.
pub struct HardwareAddressSpace;

impl AddressSpace for HardwareAddressSpace {
    fn encrypted(&self, gpa: u64) -> *mut u8 {
        gpa as *mut u8
    }

    fn shared(&self, gpa: u64) -> *mut u8 {
        (gpa + UNENC_VIRT_ADDR_BASE) as *mut u8
    }
}

/// The migration handler's command processor.
pub struct MigrationHandler<T: AddressSpace> {
    mailbox: Mailbox,
    scratch_gpa: u64,
    guards: GuardRegions,
    address_space: T,
}

impl<T: AddressSpace> MigrationHandler<T> {
    /// Creates the handler from the context produced by setup.
    pub fn new(context: &MigrationContext, address_space: T) -> Self {
        // The mailbox is reached through the unencrypted window so that the
        // hypervisor sees the same bytes.
        let mailbox_ptr = address_space.shared(context.mailbox.start()).cast();
        // SAFETY: Setup validated and reserved the mailbox region, and this
        // handler is the only guest code running while its page tables are
        // loaded.
        let mailbox = unsafe { Mailbox::new(mailbox_ptr) };
        MigrationHandler {
            mailbox,
            scratch_gpa: context.scratch_page_gpa(),
            guards: context.guard_regions(),
            address_space,
        }
    }

    /// Runs the command loop. Never returns.
    ///
    /// The spin on `go` is unbounded by design: this context has abandoned
    /// normal guest execution, and a hypervisor that never issues another
    /// command leaves the processor parked here until the VM is reset.
    pub fn run(mut self) -> ! {
        arch::disable_interrupts();
        log!("Migration handler started");

        self.mailbox.clear_go();

        loop {
            while !self.mailbox.go() {
                arch::cpu_relax();
            }
            self.process_command();
        }
    }

    /// Processes the command currently in the mailbox and completes the
    /// handshake.
    fn process_command(&mut self) {
        self.mailbox.clear_done();

        let ret = match self.mailbox.command() {
            MhCommand::INIT => MhResult::SUCCESS,
            MhCommand::SAVE_PAGE => {
                self.save_page(self.mailbox.gpa());
                MhResult::SUCCESS
            }
            MhCommand::RESTORE_PAGE => {
                // Don't import a page that covers the mailbox, page tables,
                // or stack. The copy is skipped but success is still
                // reported; see DESIGN.md for the rationale.
                if !self.guards.denies_import(self.mailbox.gpa()) {
                    self.restore_page(self.mailbox.gpa());
                }
                MhResult::SUCCESS
            }
            MhCommand::RESET => MhResult::SUCCESS,
            _ => MhResult::INVALID_FUNC,
        };

        self.mailbox.complete(ret);
    }

    /// Copies one page from guest memory into the scratch page, where the
    /// hypervisor can read it unencrypted.
    fn save_page(&mut self, gpa: u64) {
        // Exporting the scratch page itself would copy it onto itself
        // through both views; skip the copy, the staged contents already
        // are the page contents.
        if gpa == self.scratch_gpa {
            return;
        }
        let src = self.address_space.encrypted(gpa);
        let dst = self.address_space.shared(self.scratch_gpa);
        // SAFETY: The source address is trusted to be valid guest memory
        // per the protocol, and the check above keeps the source and the
        // scratch page distinct physical pages, so the copy cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst, MIGRATION_PAGE_SIZE as usize);
        }
    }

    /// Copies the scratch page into guest memory at `gpa`.
    fn restore_page(&mut self, gpa: u64) {
        let src = self.address_space.shared(self.scratch_gpa);
        let dst = self.address_space.encrypted(gpa);
        // SAFETY: The guard check has excluded every destination that could
        // overlap the handler's control structures, including the scratch
        // page itself, so the copy cannot alias or corrupt handler state.
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst, MIGRATION_PAGE_SIZE as usize);
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions shared between the in-guest migration handler, the firmware
//! setup glue, and the hypervisor driving a live migration.
//!
//! The mailbox layout and the command and result values here are a wire
//! contract with the hypervisor and must not change. The entry region layout
//! is a contract with the entry trampoline that switches the processor onto
//! the handler's private page tables and stack.

#![no_std]

use core::mem::size_of;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The size of a guest page in bytes. One command moves exactly one page.
pub const MIGRATION_PAGE_SIZE: u64 = 4096;

/// The virtual base of the unencrypted window.
///
/// The handler's page tables alias the first 1 GiB of guest-physical memory
/// at this offset with the encryption bit clear, so that the hypervisor can
/// observe the staged page contents. The value sits in the top PML4 slot
/// (index 511), far outside any address range the guest OS uses.
pub const UNENC_VIRT_ADDR_BASE: u64 = 0xffff_ff80_0000_0000;

/// Number of pages in the mailbox region: the mailbox page itself followed
/// by the scratch page that stages page contents in each direction.
pub const MIGRATION_MAILBOX_REGION_PAGES: u64 = 2;

/// Page index of the scratch page within the mailbox region.
pub const MIGRATION_SCRATCH_PAGE_INDEX: u64 = 1;

/// Number of pages reserved for the handler's page-table pool: one
/// bookkeeping page followed by the table pages.
pub const MIGRATION_PAGE_TABLE_POOL_PAGES: u64 = 11;

/// Page index of the first page-table page within the pool.
pub const MIGRATION_PAGE_TABLE_PAGE_INDEX: u64 = 1;

/// Number of pages in the handler's private stack.
pub const MIGRATION_HANDLER_STACK_PAGES: u64 = 4;

/// Number of pages in the entry region.
pub const MIGRATION_ENTRY_REGION_PAGES: u64 = 1;

// Offsets of the pieces the setup glue deposits in the entry region. The
// trampoline is entered at offset 0 in protected mode, switches to long mode
// via the stub at [`MIGRATION_ENTRY_LONG_MODE_OFFSET`], and reads the
// [`EntryAddrs`] block to find the page-table root, stack, and handler
// entrypoint.
/// Offset of the protected-mode trampoline code.
pub const MIGRATION_ENTRY_CODE_OFFSET: u64 = 0;
/// Offset of the long-mode trampoline code.
pub const MIGRATION_ENTRY_LONG_MODE_OFFSET: u64 = 0x200;
/// Offset of the [`EntryAddrs`] block.
pub const MIGRATION_ENTRY_ADDRS_OFFSET: u64 = 0x400;
/// Offset of the descriptor-table copy.
pub const MIGRATION_ENTRY_GDT_OFFSET: u64 = 0x600;
/// Maximum size in bytes of each trampoline code stub.
pub const MIGRATION_ENTRY_CODE_MAX: u64 = 0x50;
/// Maximum size in bytes of the descriptor-table copy.
pub const MIGRATION_ENTRY_GDT_MAX: u64 =
    MIGRATION_ENTRY_REGION_PAGES * MIGRATION_PAGE_SIZE - MIGRATION_ENTRY_GDT_OFFSET;

/// A command number written by the hypervisor.
///
/// Any `u64` can arrive over the wire, so this is a transparent struct with
/// named values rather than a Rust enum; dispatch must treat unlisted values
/// as invalid.
#[derive(Copy, Clone, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct MhCommand(pub u64);

impl MhCommand {
    /// Liveness probe. No side effect; confirms the handler is responsive.
    pub const INIT: MhCommand = MhCommand(0);
    /// Export one page: copy it from guest memory into the scratch page.
    pub const SAVE_PAGE: MhCommand = MhCommand(1);
    /// Import one page: copy the scratch page into guest memory.
    pub const RESTORE_PAGE: MhCommand = MhCommand(2);
    /// Reserved for hypervisor-side retry signaling. No side effect.
    pub const RESET: MhCommand = MhCommand(3);
}

impl core::fmt::Debug for MhCommand {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match *self {
            Self::INIT => "INIT",
            Self::SAVE_PAGE => "SAVE_PAGE",
            Self::RESTORE_PAGE => "RESTORE_PAGE",
            Self::RESET => "RESET",
            _ => return core::fmt::Debug::fmt(&self.0, fmt),
        };
        fmt.pad(s)
    }
}

/// A result code reported back through the mailbox.
#[derive(Copy, Clone, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct MhResult(pub u32);

impl MhResult {
    /// The command completed.
    pub const SUCCESS: MhResult = MhResult(0);
    /// The command number is not recognized.
    pub const INVALID_FUNC: MhResult = MhResult(-1i32 as u32);
    /// Reserved for authentication failure. Defined by the protocol but not
    /// produced by the current command set.
    pub const AUTH_ERR: MhResult = MhResult(-2i32 as u32);
}

impl core::fmt::Debug for MhResult {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::INVALID_FUNC => "INVALID_FUNC",
            Self::AUTH_ERR => "AUTH_ERR",
            _ => return core::fmt::Debug::fmt(&self.0, fmt),
        };
        fmt.pad(s)
    }
}

/// The mailbox as laid out in the shared page.
///
/// Both sides mutate this structure, with strict alternation enforced by the
/// `go`/`done` flags: the hypervisor sets `go` only when `done` has been
/// observed from the prior command, and the handler touches a new command
/// only after `go` transitions.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MailboxRaw {
    /// The command number ([`MhCommand`]).
    pub nr: u64,
    /// The guest-physical address operand.
    pub gpa: u64,
    /// Prefetch hint. Reserved; no consuming logic in this version.
    pub do_prefetch: u32,
    /// The result code ([`MhResult`]), valid once `done` is set.
    pub ret: u32,
    /// Hypervisor to guest: a request is pending.
    pub go: u32,
    /// Guest to hypervisor: the result is ready.
    pub done: u32,
}

const_assert_eq!(size_of::<MailboxRaw>(), 32);

/// The block the entry trampoline consumes to reach the handler, deposited
/// at [`MIGRATION_ENTRY_ADDRS_OFFSET`] in the entry region.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EntryAddrs {
    /// The page-table root, with the encryption bit set.
    pub cr3: u64,
    /// The base of the handler's private stack.
    pub stack_base: u64,
    /// The physical address of the handler entrypoint.
    pub mh_base: u64,
}

const_assert_eq!(size_of::<EntryAddrs>(), 24);

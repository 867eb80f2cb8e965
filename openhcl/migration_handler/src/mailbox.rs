// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Volatile access to the shared mailbox.
//!
//! The mailbox page is mutably shared with the hypervisor, with no atomic
//! instructions on either side: correctness relies on the strict alternation
//! enforced by the `go`/`done` handshake, so every access is volatile and
//! the completion path orders its writes with compiler fences.

use core::ptr::addr_of;
use core::ptr::addr_of_mut;
use core::sync::atomic::compiler_fence;
use core::sync::atomic::Ordering;
use migration_defs::MailboxRaw;
use migration_defs::MhCommand;
use migration_defs::MhResult;

/// Accessor for the mailbox reached through the handler's unencrypted
/// window.
pub struct Mailbox {
    ptr: *mut MailboxRaw,
}

impl Mailbox {
    /// Creates a mailbox accessor over the given pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to the reserved, page-aligned mailbox page, mapped
    /// for the life of the handler, and no other code in this program may
    /// access that page while the accessor exists.
    pub unsafe fn new(ptr: *mut MailboxRaw) -> Self {
        Self { ptr }
    }

    /// The pending command number.
    pub fn command(&self) -> MhCommand {
        // SAFETY: The mailbox page is valid per `new`'s contract; volatile
        // because the hypervisor writes this field.
        MhCommand(unsafe { addr_of!((*self.ptr).nr).read_volatile() })
    }

    /// The guest-physical address operand of the pending command.
    pub fn gpa(&self) -> u64 {
        // SAFETY: The mailbox page is valid per `new`'s contract; volatile
        // because the hypervisor writes this field.
        unsafe { addr_of!((*self.ptr).gpa).read_volatile() }
    }

    /// Whether the hypervisor has a request pending.
    pub fn go(&self) -> bool {
        // SAFETY: The mailbox page is valid per `new`'s contract; volatile
        // because the hypervisor writes this field.
        unsafe { addr_of!((*self.ptr).go).read_volatile() != 0 }
    }

    /// Clears the request-pending flag. Done once at loop entry to discard
    /// stale state from a previous, interrupted, migration attempt.
    pub fn clear_go(&mut self) {
        // SAFETY: The mailbox page is valid per `new`'s contract.
        unsafe { addr_of_mut!((*self.ptr).go).write_volatile(0) }
    }

    /// Clears the result-ready flag before processing a new command.
    pub fn clear_done(&mut self) {
        // SAFETY: The mailbox page is valid per `new`'s contract.
        unsafe { addr_of_mut!((*self.ptr).done).write_volatile(0) }
    }

    /// The most recently reported result code.
    pub fn result(&self) -> MhResult {
        // SAFETY: The mailbox page is valid per `new`'s contract; volatile
        // because the hypervisor reads and may rewrite this field.
        MhResult(unsafe { addr_of!((*self.ptr).ret).read_volatile() })
    }

    /// Whether a result has been reported for the last command.
    pub fn done(&self) -> bool {
        // SAFETY: The mailbox page is valid per `new`'s contract.
        unsafe { addr_of!((*self.ptr).done).read_volatile() != 0 }
    }

    /// Completes the current command: publishes the result code, clears
    /// `go`, and only then sets `done`.
    ///
    /// The ordering is the handshake contract. The hypervisor must observe
    /// `done` only after the result has been fully written, and must not
    /// reuse `go` until it has observed `done`.
    pub fn complete(&mut self, ret: MhResult) {
        // SAFETY: The mailbox page is valid per `new`'s contract.
        unsafe {
            addr_of_mut!((*self.ptr).ret).write_volatile(ret.0);
            addr_of_mut!((*self.ptr).go).write_volatile(0);
            // The result and go writes must not sink below the done write.
            compiler_fence(Ordering::SeqCst);
            addr_of_mut!((*self.ptr).done).write_volatile(1);
        }
    }
}

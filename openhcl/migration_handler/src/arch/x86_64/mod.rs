// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86_64 architecture-specific implementations.

mod serial;

pub use serial::Serial;

use core::arch::asm;

/// Mask interrupts.
///
/// The handler context has no interrupt handlers and must not be preempted,
/// so interrupts stay masked for the remainder of the VM's execution on this
/// processor.
pub fn disable_interrupts() {
    // SAFETY: Masking interrupts does not touch memory or program state.
    unsafe {
        asm!("cli");
    }
}

/// Yield the CPU pipeline while spinning on the mailbox.
pub fn cpu_relax() {
    core::hint::spin_loop();
}

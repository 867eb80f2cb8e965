// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The configuration surface consumed by setup.

use memory_range::MemoryRange;

/// Platform configuration for the migration handler, resolved once by the
/// firmware glue before setup runs.
///
/// The mailbox and entry regions are fixed physical placements agreed
/// out-of-band with the hypervisor and reserved at early boot, before any
/// other firmware component can claim them.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Whether migration support is enabled for this VM.
    pub enabled: bool,
    /// Whether this VM instance is a migration target. A target parks after
    /// setup, waiting for the hypervisor to overwrite CPU state and resume
    /// execution elsewhere; a source continues booting.
    pub is_target: bool,
    /// The reserved mailbox region: the mailbox page followed by the
    /// scratch page.
    pub mailbox: MemoryRange,
    /// The reserved entry region that receives the trampoline, descriptor
    /// table, and entry-addresses block.
    pub entry_region: MemoryRange,
    /// The position of the encryption indicator bit in physical addresses.
    pub encryption_bit: u8,
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The in-guest migration handler for confidential VMs.
//!
//! The handler lets an untrusted hypervisor export and import individual
//! encrypted pages during live migration without ever reading or writing
//! guest memory itself. It has two halves, run in two different execution
//! contexts:
//!
//! - [`setup`] runs once during normal guest boot: it allocates the
//!   handler's private stack and page-table pool from runtime-persistent
//!   memory, builds the dual-mapped paging hierarchy, and deposits the entry
//!   trampoline, descriptor table, and [`EntryAddrs`] block in the reserved
//!   entry region for the hypervisor-driven entry path to consume.
//! - [`command_loop`] runs at migration time, after the external trampoline
//!   has switched the processor onto the handler's page tables and stack:
//!   it polls the shared mailbox for commands and performs guarded
//!   single-page copies through the dual mapping. It never returns.
//!
//! [`EntryAddrs`]: migration_defs::EntryAddrs

// UNSAFETY: Needed to access guest-physical memory through the handler's
// mappings and to issue privileged instructions from the handler context.
#![expect(unsafe_code)]
#![cfg_attr(not(test), no_std)]

mod arch;
pub mod command_loop;
pub mod config;
pub mod context;
pub mod logger;
pub mod mailbox;
pub mod setup;
mod single_threaded;

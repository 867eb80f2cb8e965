// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Methods to construct the migration handler's page tables.

#![expect(missing_docs)]
#![no_std]

pub mod x64;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Polled serial output over COM1, for debugging.

use core::arch::asm;
use core::fmt;

const COM1: u16 = 0x3f8;
const TX_READY: u8 = 0x20;

/// Write a byte to a port.
///
/// # Safety
///
/// The caller must be sure that the given port is safe to write to, and that
/// the given value is safe for it.
unsafe fn outb(port: u16, data: u8) {
    // SAFETY: The caller has assured us this is safe.
    unsafe {
        asm! {
            "out dx, al",
            in("dx") port,
            in("al") data,
        }
    }
}

/// Read a byte from a port.
///
/// # Safety
///
/// The caller must be sure that the given port is safe to read from.
unsafe fn inb(port: u16) -> u8 {
    let mut data;
    // SAFETY: The caller has assured us this is safe.
    unsafe {
        asm! {
            "in al, dx",
            in("dx") port,
            out("al") data,
        }
    }
    data
}

/// A writer for the COM1 UART.
pub struct Serial;

impl Serial {
    /// Initialize the serial port.
    pub fn init() -> Self {
        // SAFETY: Programming the UART control registers does not touch
        // memory or program state.
        unsafe {
            outb(COM1 + 1, 0x00); // Disable all interrupts
            outb(COM1 + 2, 0xc7); // Enable FIFO, clear them, with 14-byte threshold
            outb(COM1 + 4, 0x0f);
        }
        Serial
    }

    fn write_byte(&mut self, b: u8) {
        // SAFETY: Polling line status and writing the transmit register of
        // an initialized UART is safe.
        unsafe {
            while inb(COM1 + 5) & TX_READY == 0 {}
            outb(COM1, b);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
        Ok(())
    }
}

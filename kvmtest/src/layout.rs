//! Guest physical memory layout.
//!
//! ```text
//! 0x0000_0000  RAM (slot 0), payload at KERNEL_BASE
//!      ...
//! 0xffff_f000  result page (slot 1)
//! 0xffff_fff0  reset code
//! ```

use anyhow::{Result, ensure};
use tracing::warn;

use crate::{memory::align_up, result::RESULT_HEADER_SIZE};

/// Guest physical address the payload is loaded at.
pub const KERNEL_BASE: u64 = 0x1000;
/// Guest physical address the CPU starts executing at after a reset.
pub const RESET_BASE: u64 = 0xffff_fff0;
pub const RESET_CODE_SIZE: usize = 8;
/// Guest physical address of the result channel.
pub const RESULT_BASE: u64 = 0xffff_f000;

/// Memory left to the guest on top of the payload.
pub const MIN_FREE_RAM: usize = 10 * 1024 * 1024;
pub const DEFAULT_RAM_SIZE: usize = 16 * 1024 * 1024;

/// The guest writes console output to this port.
pub const CONSOLE_PORT: u16 = 0x3f8;

/// `ljmp $0x0000, $0x1000` followed by `hlt` padding.
pub const X86_RESET_CODE: [u8; RESET_CODE_SIZE] = [0xea, 0x00, 0x10, 0x00, 0x00, 0xf4, 0xf4, 0xf4];

const RAM_SIZE_GRANULARITY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub kernel_base: u64,
    pub reset_base: u64,
    pub reset_code_size: usize,
    pub result_base: u64,
    pub min_free_ram: usize,
    pub default_ram_size: usize,
    pub console_port: u16,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            kernel_base: KERNEL_BASE,
            reset_base: RESET_BASE,
            reset_code_size: RESET_CODE_SIZE,
            result_base: RESULT_BASE,
            min_free_ram: MIN_FREE_RAM,
            default_ram_size: DEFAULT_RAM_SIZE,
            console_port: CONSOLE_PORT,
        }
    }
}

impl Layout {
    pub fn validate(&self, page_size: usize) -> Result<()> {
        let page_size = page_size as u64;
        ensure!(
            self.result_base.checked_add(RESULT_HEADER_SIZE as u64) <= Some(self.reset_base),
            "reset code overlaps the result header"
        );
        ensure!(
            self.reset_base.checked_add(self.reset_code_size as u64) <= Some(1 << 32),
            "reset code exceeds the 32-bit address space"
        );
        ensure!(
            self.kernel_base < self.result_page(page_size as usize),
            "payload must be loaded below the result page"
        );
        ensure!(page_size.is_power_of_two(), "page size must be a power of two");
        Ok(())
    }

    /// Page-aligned start of the result slot.
    pub fn result_page(&self, page_size: usize) -> u64 {
        self.result_base - self.result_base % page_size as u64
    }

    /// Size of the result slot: whole pages from the result page up to the
    /// end of the reset code.
    pub fn result_slot_size(&self, page_size: usize) -> usize {
        let len = (self.reset_base + self.reset_code_size as u64 - self.result_page(page_size))
            as usize;
        align_up(len, page_size).unwrap_or(len)
    }

    /// Room for the message that follows the result header.
    pub fn message_capacity(&self) -> usize {
        (self.reset_base - self.result_base) as usize - RESULT_HEADER_SIZE
    }

    /// Clamp a requested RAM size so that the payload plus `min_free_ram`
    /// fits and the RAM slot ends below the result page.
    pub fn adjust_ram_size(&self, requested: usize, payload_len: usize, page_size: usize) -> usize {
        let mut ram_size = requested;

        let available = ram_size.saturating_sub(self.kernel_base as usize);
        if payload_len.saturating_add(self.min_free_ram) > available {
            ram_size = payload_len
                .saturating_add(self.min_free_ram)
                .saturating_add(self.kernel_base as usize);
            ram_size = align_up(ram_size, RAM_SIZE_GRANULARITY).unwrap_or(usize::MAX);
            warn!(ram_size, "RAM size increased");
        }

        let max = usize::try_from(self.result_page(page_size)).unwrap_or(usize::MAX);
        if ram_size > max {
            ram_size = max;
            warn!(ram_size, "RAM size truncated");
        }

        ram_size
    }
}

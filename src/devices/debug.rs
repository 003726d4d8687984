//! Debug console CSRs
//!
//! Non-standard CSR numbers the guest uses to print without a driver:
//! 0x136 signed decimal, 0x137 hex, 0x138 NUL-terminated string at a guest
//! pointer, 0x139 one raw byte. 0x140 polls the keyboard.

use log::warn;

use super::keyboard::KeyboardQueue;
use crate::config::RAM_IMAGE_OFFSET;
use crate::error::StorageError;
use crate::memory::Cache;

pub const CSR_PRINT_DEC: u32 = 0x136;
pub const CSR_PRINT_HEX: u32 = 0x137;
pub const CSR_PRINT_STR: u32 = 0x138;
pub const CSR_PUTC: u32 = 0x139;
pub const CSR_GETC: u32 = 0x140;

/// Returned by `CSR_GETC` when nothing is queued
pub const NO_KEY: u32 = 0xFFFF_FFFF;

/// Handle a write to a CSR the core does not implement.
/// Numbers outside the debug channel are ignored.
pub fn csr_write(
    csr: u32,
    value: u32,
    cache: &mut Cache,
    ram_size: u32,
    out: &mut Vec<u8>,
) -> Result<(), StorageError> {
    match csr {
        CSR_PRINT_DEC => out.extend_from_slice((value as i32).to_string().as_bytes()),
        CSR_PRINT_HEX => out.extend_from_slice(format!("{:08x}", value).as_bytes()),
        CSR_PRINT_STR => print_string(value, cache, ram_size, out)?,
        CSR_PUTC => out.push(value as u8),
        _ => {}
    }
    Ok(())
}

/// Handle a read of a CSR the core does not implement
pub fn csr_read(csr: u32, keyboard: &KeyboardQueue) -> u32 {
    match csr {
        CSR_GETC => keyboard.try_pop().map_or(NO_KEY, u32::from),
        _ => 0,
    }
}

/// Stream bytes from guest RAM until a NUL or the end of RAM
fn print_string(
    ptr: u32,
    cache: &mut Cache,
    ram_size: u32,
    out: &mut Vec<u8>,
) -> Result<(), StorageError> {
    let start = ptr.wrapping_sub(RAM_IMAGE_OFFSET);
    if start >= ram_size {
        warn!("debug print passed invalid pointer {:08x}", ptr);
        return Ok(());
    }
    for offset in start..ram_size {
        match cache.read8(offset)? {
            0 => break,
            byte => out.push(byte),
        }
    }
    Ok(())
}

//! System orchestrator
//!
//! Owns the CPU, cache, backing store and devices as one explicit context.
//! Boots a guest image and drives the CPU in fixed-size batches.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::config::{Config, TimingMode, RAM_IMAGE_OFFSET};
use crate::cpu::{Cpu, StepOutcome};
use crate::devices::dtb::DEFAULT_BOOTARGS;
use crate::devices::{
    debug as debug_csr, DeviceTree, KeyboardQueue, KeyboardSender, Uart, UART_BASE,
};
use crate::error::{Error, Result};
use crate::memory::{BackingStore, Bus, BusError, Cache};
use crate::snapshot::{Counters, StateDump};

// Peripheral window; loads of unclaimed addresses read 0, stores are dropped
const MMIO_BASE: u32 = 0x1000_0000;
const MMIO_END: u32 = 0x1200_0000;
const UART_SIZE: u32 = 8;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

const IDLE: Duration = Duration::from_millis(1);

/// How a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineExit {
    Reboot,
    /// Guest poweroff, or a stop requested by the host
    PowerOff,
    Fault,
    Unknown(u32),
}

/// Where the last boot put things
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootInfo {
    /// Decompressed image size in bytes
    pub image_len: u64,
    /// Guest physical address of the device tree (also a1)
    pub dtb_addr: u32,
    /// Value patched into the device tree's RAM-size cell
    pub usable_ram: u32,
}

pub struct System {
    config: Config,
    pub cpu: Cpu,
    cache: Cache,
    uart: Uart,
    keyboard: KeyboardQueue,
    /// Unpatched template; a patched copy is written on every boot
    dtb: DeviceTree,
}

impl System {
    /// Validate the configuration, open the backing units and build the
    /// all-invalid cache. Nothing runs until [`boot`](Self::boot).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let backing = BackingStore::from_config(&config.backing)?;
        info!(
            "backing store: {} unit(s) x {} bytes, RAM {} bytes",
            backing.unit_count(),
            config.backing.unit_capacity,
            config.ram_size
        );
        let cache = Cache::new(&config.cache, backing);

        let dtb = match &config.dtb {
            Some(custom) => DeviceTree::from_file(&custom.path, custom.ram_size_offset)?,
            None => DeviceTree::generate(DEFAULT_BOOTARGS),
        };

        Ok(System {
            cpu: Cpu::new(config.ram_size).with_fault_policy(config.fault_policy),
            cache,
            uart: Uart::new(),
            keyboard: KeyboardQueue::new(config.keyboard_capacity),
            dtb,
            config,
        })
    }

    /// Replace the device tree template used by later boots
    pub fn with_device_tree(mut self, dtb: DeviceTree) -> Self {
        self.dtb = dtb;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load `image` and the device tree straight into the backing store and
    /// reset the CPU to the boot convention. Safe to call again to reboot.
    pub fn boot<R: Read>(&mut self, image: R) -> Result<BootInfo> {
        let ram_size = self.config.ram_size;

        // The bulk load bypasses the cache; nothing resident may shadow it
        self.cache.invalidate();

        let image_len = self.load_image(image)?;
        let dtb_offset = self.dtb.placement(ram_size)?;
        if image_len > dtb_offset as u64 {
            return Err(Error::Image(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} byte image overlaps the device tree at RAM offset 0x{:x}",
                    image_len, dtb_offset
                ),
            )));
        }

        let mut dtb = self.dtb.clone();
        dtb.patch_ram_size(dtb_offset);
        self.cache.backing_mut().write(dtb_offset, &dtb.blob)?;

        let dtb_addr = dtb_offset + RAM_IMAGE_OFFSET;
        self.cpu.boot_reset(dtb_addr);
        self.reset_stats();

        info!(
            "image {} bytes, device tree {} bytes at 0x{:08x}, usable RAM {} bytes",
            image_len,
            dtb.len(),
            dtb_addr,
            dtb_offset
        );
        Ok(BootInfo {
            image_len,
            dtb_addr,
            usable_ram: dtb_offset,
        })
    }

    /// [`boot`](Self::boot) from a host file
    pub fn boot_file(&mut self, path: &Path) -> Result<BootInfo> {
        let file = std::fs::File::open(path).map_err(Error::Image)?;
        self.boot(file)
    }

    /// Stream the image to RAM offset 0, decompressing gzip or zstd
    fn load_image<R: Read>(&mut self, image: R) -> Result<u64> {
        let mut reader = BufReader::new(image);
        let (is_gzip, is_zstd) = {
            let head = reader.fill_buf().map_err(Error::Image)?;
            (head.starts_with(&GZIP_MAGIC), head.starts_with(&ZSTD_MAGIC))
        };
        if is_gzip {
            debug!("image is gzip compressed");
            self.copy_chunks(flate2::bufread::GzDecoder::new(reader))
        } else if is_zstd {
            debug!("image is zstd compressed");
            let decoder = zstd::stream::read::Decoder::with_buffer(reader).map_err(Error::Image)?;
            self.copy_chunks(decoder)
        } else {
            self.copy_chunks(reader)
        }
    }

    fn copy_chunks<S: Read>(&mut self, mut source: S) -> Result<u64> {
        let ram_size = self.config.ram_size as u64;
        let mut chunk = vec![0u8; self.config.image_chunk_size];
        let mut addr = 0u64;
        loop {
            let n = read_chunk(&mut source, &mut chunk).map_err(Error::Image)?;
            if n == 0 {
                return Ok(addr);
            }
            if addr + n as u64 > ram_size {
                return Err(Error::Image(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("image is larger than {} bytes of RAM", ram_size),
                )));
            }
            self.cache.backing_mut().write(addr as u32, &chunk[..n])?;
            addr += n as u64;
        }
    }

    /// Run one batch of at most `max_instructions`
    pub fn step(&mut self, max_instructions: u32, elapsed_us: u64) -> Result<StepOutcome> {
        let mut bus = SystemBus {
            cache: &mut self.cache,
            uart: &mut self.uart,
            keyboard: &self.keyboard,
            ram_size: self.config.ram_size,
        };
        Ok(self.cpu.step(&mut bus, max_instructions, elapsed_us)?)
    }

    /// Drive the CPU until the guest stops it or `stop` is raised.
    ///
    /// `stop` is sampled once per batch. Guest console output is written to
    /// `console` after every batch. On a host stop the state dump is printed
    /// and the session ends as a poweroff.
    pub fn run(&mut self, stop: &AtomicBool, console: &mut dyn Write) -> Result<MachineExit> {
        let batch = self.config.instructions_per_batch;
        let divisor = self.config.time_divisor as u64;
        let timing = self.config.timing;
        let clock = Instant::now();
        let now_us = || clock.elapsed().as_micros() as u64 / divisor;

        let mut last_time = match timing {
            TimingMode::Fixed => 0,
            TimingMode::WallClock => now_us(),
        };

        loop {
            if stop.load(Ordering::Relaxed) {
                let dump = self.dump();
                info!("stopped by host at pc {:08x}", self.cpu.pc);
                writeln!(console, "\r\n{}", dump).map_err(Error::Console)?;
                console.flush().map_err(Error::Console)?;
                return Ok(MachineExit::PowerOff);
            }

            let now = match timing {
                TimingMode::Fixed => self.cpu.csr.cycle / divisor,
                TimingMode::WallClock => now_us(),
            };
            let elapsed = now.saturating_sub(last_time);
            last_time += elapsed;

            let outcome = self.step(batch, elapsed)?;
            self.flush_console(console)?;

            let cycle = self.cpu.csr.cycle;
            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::WaitForInterrupt => {
                    if self.config.idle_on_wait {
                        std::thread::sleep(IDLE);
                    }
                    self.cpu.advance_cycles(batch as u64);
                }
                StepOutcome::Fault => {
                    error!("fault {:?} at pc {:08x}", self.cpu.last_fault, self.cpu.pc);
                    writeln!(console, "\r\nFAULT").map_err(Error::Console)?;
                    return Ok(MachineExit::Fault);
                }
                StepOutcome::Reboot => {
                    writeln!(console, "\r\nREBOOT@0x{:016x}", cycle).map_err(Error::Console)?;
                    return Ok(MachineExit::Reboot);
                }
                StepOutcome::PowerOff => {
                    writeln!(console, "\r\nPOWEROFF@0x{:016x}", cycle).map_err(Error::Console)?;
                    return Ok(MachineExit::PowerOff);
                }
                StepOutcome::Unknown(code) => {
                    error!("unknown step outcome 0x{:x} at pc {:08x}", code, self.cpu.pc);
                    writeln!(console, "\r\nUnknown failure (0x{:x})", code)
                        .map_err(Error::Console)?;
                    return Ok(MachineExit::Unknown(code));
                }
            }
        }
    }

    fn flush_console(&mut self, console: &mut dyn Write) -> Result<()> {
        let out = self.uart.take_output();
        if !out.is_empty() {
            console.write_all(&out).map_err(Error::Console)?;
            console.flush().map_err(Error::Console)?;
        }
        Ok(())
    }

    /// Producer handle for the keyboard queue
    pub fn keyboard_sender(&self) -> KeyboardSender {
        self.keyboard.sender()
    }

    /// Console bytes produced since the last call
    pub fn take_output(&mut self) -> Vec<u8> {
        self.uart.take_output()
    }

    pub fn stats(&self) -> Counters {
        Counters {
            cache: self.cache.stats(),
            storage: self.cache.backing().stats(),
        }
    }

    pub fn reset_stats(&mut self) {
        self.cache.reset_stats();
        self.cache.backing_mut().reset_stats();
    }

    pub fn dump(&self) -> StateDump {
        StateDump::new(&self.cpu, self.stats())
    }

    /// Write every dirty cache line back to the backing store
    pub fn flush(&mut self) -> Result<()> {
        Ok(self.cache.flush()?)
    }

    /// Guest RAM as the CPU sees it, through the cache
    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }
}

/// Fill `buf` unless the source ends first; returns the byte count
fn read_chunk<S: Read>(source: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// System bus implementation: peripherals first, then RAM through the cache
struct SystemBus<'a> {
    cache: &'a mut Cache,
    uart: &'a mut Uart,
    keyboard: &'a KeyboardQueue,
    ram_size: u32,
}

impl<'a> SystemBus<'a> {
    /// RAM offset of an access of `len` bytes, if it lies wholly in RAM
    #[inline(always)]
    fn ram_offset(&self, addr: u32, len: u32) -> std::result::Result<u32, BusError> {
        addr.checked_sub(RAM_IMAGE_OFFSET)
            .filter(|&off| off as u64 + len as u64 <= self.ram_size as u64)
            .ok_or(BusError::Unmapped(addr))
    }

    #[inline(always)]
    fn is_mmio(addr: u32) -> bool {
        (MMIO_BASE..MMIO_END).contains(&addr)
    }

    fn mmio_load(&mut self, addr: u32) -> u32 {
        if (UART_BASE..UART_BASE + UART_SIZE).contains(&addr) {
            self.uart.load(addr - UART_BASE, self.keyboard)
        } else {
            0
        }
    }

    fn mmio_store(&mut self, addr: u32, value: u32) {
        if (UART_BASE..UART_BASE + UART_SIZE).contains(&addr) {
            self.uart.store(addr - UART_BASE, value);
        }
    }
}

impl<'a> Bus for SystemBus<'a> {
    fn read8(&mut self, addr: u32) -> std::result::Result<u8, BusError> {
        if Self::is_mmio(addr) {
            return Ok(self.mmio_load(addr) as u8);
        }
        let off = self.ram_offset(addr, 1)?;
        Ok(self.cache.read8(off)?)
    }

    fn read16(&mut self, addr: u32) -> std::result::Result<u16, BusError> {
        if Self::is_mmio(addr) {
            return Ok(self.mmio_load(addr) as u16);
        }
        let off = self.ram_offset(addr, 2)?;
        Ok(self.cache.read16(off)?)
    }

    fn read32(&mut self, addr: u32) -> std::result::Result<u32, BusError> {
        if Self::is_mmio(addr) {
            return Ok(self.mmio_load(addr));
        }
        let off = self.ram_offset(addr, 4)?;
        Ok(self.cache.read32(off)?)
    }

    fn write8(&mut self, addr: u32, value: u8) -> std::result::Result<(), BusError> {
        if Self::is_mmio(addr) {
            self.mmio_store(addr, value as u32);
            return Ok(());
        }
        let off = self.ram_offset(addr, 1)?;
        Ok(self.cache.write8(off, value)?)
    }

    fn write16(&mut self, addr: u32, value: u16) -> std::result::Result<(), BusError> {
        if Self::is_mmio(addr) {
            self.mmio_store(addr, value as u32);
            return Ok(());
        }
        let off = self.ram_offset(addr, 2)?;
        Ok(self.cache.write16(off, value)?)
    }

    fn write32(&mut self, addr: u32, value: u32) -> std::result::Result<(), BusError> {
        if Self::is_mmio(addr) {
            self.mmio_store(addr, value);
            return Ok(());
        }
        let off = self.ram_offset(addr, 4)?;
        Ok(self.cache.write32(off, value)?)
    }

    fn csr_read(&mut self, csr: u32) -> std::result::Result<u32, BusError> {
        Ok(debug_csr::csr_read(csr, self.keyboard))
    }

    fn csr_write(&mut self, csr: u32, value: u32) -> std::result::Result<(), BusError> {
        debug_csr::csr_write(csr, value, self.cache, self.ram_size, self.uart.output())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackingConfig, BackingKind, FaultPolicy};
    use crate::cpu::PrivilegeLevel;

    const KB: u32 = 1024;

    fn config() -> Config {
        Config {
            ram_size: 64 * KB,
            backing: BackingConfig {
                unit_count: 2,
                unit_capacity: 32 * KB,
                kind: BackingKind::Memory,
            },
            idle_on_wait: false,
            timing: TimingMode::Fixed,
            ..Config::default()
        }
    }

    fn image(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_bad_config_fails_before_boot() {
        let cfg = Config {
            ram_size: 128 * KB,
            ..config()
        };
        assert!(matches!(System::new(cfg), Err(Error::Config(_))));
    }

    #[test]
    fn test_boot_places_and_patches_dtb() {
        let mut sys = System::new(config()).unwrap();
        let info = sys.boot(&image(&[0x0000006f])[..]).unwrap();

        let dtb_len = DeviceTree::generate(DEFAULT_BOOTARGS).len() as u32;
        let expected = (64 * KB - dtb_len) & !7;
        assert_eq!(info.usable_ram, expected);
        assert_eq!(info.dtb_addr, RAM_IMAGE_OFFSET + expected);
        assert_eq!(info.image_len, 4);

        assert_eq!(sys.cpu.pc, RAM_IMAGE_OFFSET);
        assert_eq!(sys.cpu.regs[10], 0);
        assert_eq!(sys.cpu.regs[11], info.dtb_addr);
        assert_eq!(sys.cpu.priv_level, PrivilegeLevel::Machine);
        assert_eq!(sys.stats(), Counters::default());

        // The blob landed in the backing store with its RAM cell patched
        let mut magic = [0u8; 4];
        sys.cache_mut()
            .backing_mut()
            .read(expected, &mut magic)
            .unwrap();
        assert_eq!(magic, [0xd0, 0x0d, 0xfe, 0xed]);
    }

    #[test]
    fn test_uart_store_reaches_console() {
        // lui x1, 0x10000 ; addi x2, x0, 0x41 ; sb x2, 0(x1) ; jal x0, 0
        let mut sys = System::new(config()).unwrap();
        sys.boot(&image(&[0x100000b7, 0x04100113, 0x00208023, 0x0000006f])[..])
            .unwrap();
        assert_eq!(sys.step(16, 0).unwrap(), StepOutcome::Continue);
        assert_eq!(sys.take_output(), vec![0x41]);
    }

    #[test]
    fn test_uart_status_sees_keyboard() {
        // lui x1, 0x10000 ; lbu x2, 5(x1) ; lbu x3, 0(x1)
        let mut sys = System::new(config()).unwrap();
        sys.boot(&image(&[0x100000b7, 0x0050c103, 0x0000c183])[..]).unwrap();
        sys.keyboard_sender().send(b'z');
        sys.step(3, 0).unwrap();
        assert_eq!(sys.cpu.regs[2] & 1, 1);
        assert_eq!(sys.cpu.regs[3], b'z' as u32);
    }

    #[test]
    fn test_unmapped_access_is_guest_fault() {
        // lui x1, 0x20000 ; lw x2, 0(x1)
        let cfg = Config {
            fault_policy: FaultPolicy::FailFast,
            ..config()
        };
        let mut sys = System::new(cfg).unwrap();
        sys.boot(&image(&[0x200000b7, 0x0000a103])[..]).unwrap();
        assert_eq!(sys.step(4, 0).unwrap(), StepOutcome::Fault);
    }

    #[test]
    fn test_oversized_image_rejected() {
        let mut sys = System::new(config()).unwrap();
        let big = vec![0x13u8; 64 * KB as usize];
        assert!(matches!(sys.boot(&big[..]), Err(Error::Image(_))));
    }

    #[test]
    fn test_gzip_image_is_inflated() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let raw = image(&[0x0000006f, 0xDEADBEEF]);
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&raw).unwrap();
        let gz = enc.finish().unwrap();

        let mut sys = System::new(config()).unwrap();
        let info = sys.boot(&gz[..]).unwrap();
        assert_eq!(info.image_len, 8);
        assert_eq!(sys.cache_mut().read32(4).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_zstd_image_is_decompressed() {
        let raw = image(&[0x0000006f, 0xCAFEF00D]);
        let packed = zstd::stream::encode_all(&raw[..], 3).unwrap();

        let mut sys = System::new(config()).unwrap();
        let info = sys.boot(&packed[..]).unwrap();
        assert_eq!(info.image_len, 8);
        assert_eq!(sys.cache_mut().read32(4).unwrap(), 0xCAFEF00D);
    }

    #[test]
    fn test_reboot_reloads_over_dirty_cache() {
        let mut sys = System::new(config()).unwrap();
        sys.boot(&image(&[0x0000006f, 0x11111111])[..]).unwrap();
        sys.cache_mut().write32(4, 0x22222222).unwrap();

        sys.boot(&image(&[0x0000006f, 0x33333333])[..]).unwrap();
        assert_eq!(sys.cache_mut().read32(4).unwrap(), 0x33333333);
    }

    #[test]
    fn test_run_stops_on_host_signal() {
        let mut sys = System::new(config()).unwrap();
        sys.boot(&image(&[0x0000006f])[..]).unwrap();
        let stop = AtomicBool::new(true);
        let mut console = Vec::new();
        assert_eq!(sys.run(&stop, &mut console).unwrap(), MachineExit::PowerOff);
        let text = String::from_utf8(console).unwrap();
        assert!(text.contains("Cache: hit:"));
        assert!(text.contains("PC: 80000000"));
    }
}

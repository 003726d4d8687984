//! Device Tree Blob (DTB)
//!
//! A minimal FDT writer plus the boot-time template: the blob handed to the
//! guest in a1, with one big-endian cell that is patched with the usable RAM
//! size before it is written to the backing store.
//! Structure: Header -> Reserve Map -> Structure Block -> Strings Block

use std::collections::HashMap;
use std::path::Path;

use log::warn;

use crate::error::{Error, Result};

const FDT_MAGIC: u32 = 0xd00dfeed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

const HEADER_SIZE: usize = 40;
/// One terminating (0, 0) reserve entry
const RSVMAP_SIZE: usize = 16;
/// Where the structure block starts in a finished blob
const STRUCT_OFFSET: usize = HEADER_SIZE + RSVMAP_SIZE;

const PHANDLE_CPU: u32 = 1;
const PHANDLE_CPU_INTC: u32 = 2;
const PHANDLE_SYSCON: u32 = 4;

pub const DEFAULT_BOOTARGS: &str = "earlycon=uart8250,mmio,0x10000000,1000000 console=ttyS0";

pub struct DtbBuilder {
    struct_buf: Vec<u8>,
    strings_buf: Vec<u8>,
    string_offsets: HashMap<String, u32>,
}

impl Default for DtbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DtbBuilder {
    pub fn new() -> Self {
        DtbBuilder {
            struct_buf: Vec::new(),
            strings_buf: Vec::new(),
            string_offsets: HashMap::new(),
        }
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.struct_buf.extend_from_slice(name.as_bytes());
        self.struct_buf.push(0);
        self.align(4);
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn property_u32(&mut self, name: &str, value: u32) -> usize {
        self.property(name, &value.to_be_bytes())
    }

    pub fn property_null(&mut self, name: &str) -> usize {
        self.property(name, &[])
    }

    pub fn property_string(&mut self, name: &str, value: &str) -> usize {
        self.property_strings(name, &[value])
    }

    /// A NUL-separated string list, e.g. several `compatible` entries
    pub fn property_strings(&mut self, name: &str, values: &[&str]) -> usize {
        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(v.as_bytes());
            data.push(0);
        }
        self.property(name, &data)
    }

    pub fn property_array_u32(&mut self, name: &str, values: &[u32]) -> usize {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_be_bytes());
        }
        self.property(name, &data)
    }

    /// Append a property. Returns the offset of its value in the finished blob.
    pub fn property(&mut self, name: &str, data: &[u8]) -> usize {
        self.push_u32(FDT_PROP);
        self.push_u32(data.len() as u32);

        let name_off = self.string_offset(name);
        self.push_u32(name_off);

        let value_offset = STRUCT_OFFSET + self.struct_buf.len();
        self.struct_buf.extend_from_slice(data);
        self.align(4);
        value_offset
    }

    fn push_u32(&mut self, v: u32) {
        self.struct_buf.extend_from_slice(&v.to_be_bytes());
    }

    fn align(&mut self, alignment: usize) {
        while self.struct_buf.len() % alignment != 0 {
            self.struct_buf.push(0);
        }
    }

    fn string_offset(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.string_offsets.get(s) {
            return off;
        }

        let off = self.strings_buf.len() as u32;
        self.strings_buf.extend_from_slice(s.as_bytes());
        self.strings_buf.push(0);
        self.string_offsets.insert(s.to_string(), off);
        off
    }

    /// Assemble the blob, padded to a multiple of 4 bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        let off_dt_struct = STRUCT_OFFSET as u32;
        let size_dt_struct = self.struct_buf.len() as u32;
        let off_dt_strings = off_dt_struct + size_dt_struct;
        let size_dt_strings = self.strings_buf.len() as u32;
        let totalsize = (off_dt_strings + size_dt_strings + 3) & !3;

        let mut blob = Vec::with_capacity(totalsize as usize);

        // Header
        for word in [
            FDT_MAGIC,
            totalsize,
            off_dt_struct,
            off_dt_strings,
            HEADER_SIZE as u32,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            size_dt_strings,
            size_dt_struct,
        ] {
            blob.extend_from_slice(&word.to_be_bytes());
        }

        // Reserve map, empty
        blob.extend_from_slice(&[0u8; RSVMAP_SIZE]);

        blob.extend_from_slice(&self.struct_buf);
        blob.extend_from_slice(&self.strings_buf);
        blob.resize(totalsize as usize, 0);
        blob
    }
}

/// Device tree template plus the location of its RAM-size cell
#[derive(Clone, Debug)]
pub struct DeviceTree {
    pub blob: Vec<u8>,
    pub ram_size_offset: usize,
}

impl DeviceTree {
    /// The stock machine description: one rv32ima hart without MMU, RAM at
    /// 0x80000000, an 8250 UART, the CLINT and syscon poweroff/reboot.
    /// The memory size cell is left zero until [`patch_ram_size`](Self::patch_ram_size).
    pub fn generate(bootargs: &str) -> Self {
        let mut dtb = DtbBuilder::new();

        dtb.begin_node("");
        dtb.property_u32("#address-cells", 2);
        dtb.property_u32("#size-cells", 2);
        dtb.property_string("compatible", "riscv-minimal-nommu");
        dtb.property_string("model", "riscv-minimal-nommu,qemu");

        dtb.begin_node("chosen");
        dtb.property_string("bootargs", bootargs);
        dtb.end_node();

        dtb.begin_node("memory@80000000");
        dtb.property_string("device_type", "memory");
        let reg = dtb.property_array_u32("reg", &[0, 0x8000_0000, 0, 0]);
        dtb.end_node();

        dtb.begin_node("cpus");
        dtb.property_u32("#address-cells", 1);
        dtb.property_u32("#size-cells", 0);
        dtb.property_u32("timebase-frequency", 1_000_000);

            dtb.begin_node("cpu@0");
            dtb.property_u32("phandle", PHANDLE_CPU);
            dtb.property_string("device_type", "cpu");
            dtb.property_u32("reg", 0);
            dtb.property_string("status", "okay");
            dtb.property_string("compatible", "riscv");
            dtb.property_string("riscv,isa", "rv32ima");
            dtb.property_string("mmu-type", "riscv,none");

                dtb.begin_node("interrupt-controller");
                dtb.property_u32("#interrupt-cells", 1);
                dtb.property_null("interrupt-controller");
                dtb.property_string("compatible", "riscv,cpu-intc");
                dtb.property_u32("phandle", PHANDLE_CPU_INTC);
                dtb.end_node();

            dtb.end_node(); // cpu@0
        dtb.end_node(); // cpus

        dtb.begin_node("soc");
        dtb.property_u32("#address-cells", 2);
        dtb.property_u32("#size-cells", 2);
        dtb.property_string("compatible", "simple-bus");
        dtb.property_null("ranges");

            dtb.begin_node("uart@10000000");
            dtb.property_u32("clock-frequency", 1_000_000);
            dtb.property_array_u32("reg", &[0, 0x1000_0000, 0, 0x100]);
            dtb.property_string("compatible", "ns16550a");
            dtb.end_node();

            dtb.begin_node("poweroff");
            dtb.property_u32("value", crate::cpu::SYSCON_POWEROFF);
            dtb.property_u32("offset", 0);
            dtb.property_u32("regmap", PHANDLE_SYSCON);
            dtb.property_string("compatible", "syscon-poweroff");
            dtb.end_node();

            dtb.begin_node("reboot");
            dtb.property_u32("value", crate::cpu::SYSCON_REBOOT);
            dtb.property_u32("offset", 0);
            dtb.property_u32("regmap", PHANDLE_SYSCON);
            dtb.property_string("compatible", "syscon-reboot");
            dtb.end_node();

            dtb.begin_node("syscon@11100000");
            dtb.property_u32("phandle", PHANDLE_SYSCON);
            dtb.property_array_u32("reg", &[0, 0x1110_0000, 0, 0x1000]);
            dtb.property_string("compatible", "syscon");
            dtb.end_node();

            dtb.begin_node("clint@11000000");
            // M-mode software (3) and timer (7) on the hart's intc
            dtb.property_array_u32(
                "interrupts-extended",
                &[PHANDLE_CPU_INTC, 3, PHANDLE_CPU_INTC, 7],
            );
            dtb.property_array_u32("reg", &[0, 0x1100_0000, 0, 0x10000]);
            dtb.property_strings("compatible", &["sifive,clint0", "riscv,clint0"]);
            dtb.end_node();

        dtb.end_node(); // soc
        dtb.end_node(); // root

        DeviceTree {
            blob: dtb.finish(),
            // Low cell of the 64-bit size in reg
            ram_size_offset: reg + 12,
        }
    }

    /// Load a prebuilt blob whose RAM-size cell sits at `ram_size_offset`
    pub fn from_file(path: &Path, ram_size_offset: usize) -> Result<Self> {
        let blob = std::fs::read(path).map_err(|e| {
            Error::DeviceTree(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_blob(blob, ram_size_offset)
    }

    pub fn from_blob(blob: Vec<u8>, ram_size_offset: usize) -> Result<Self> {
        if ram_size_offset % 4 != 0 || ram_size_offset + 4 > blob.len() {
            return Err(Error::DeviceTree(format!(
                "RAM size offset 0x{:x} outside a {} byte blob",
                ram_size_offset,
                blob.len()
            )));
        }
        if blob.len() < 4 || blob[..4] != FDT_MAGIC.to_be_bytes() {
            warn!("device tree blob does not start with the FDT magic");
        }
        Ok(DeviceTree {
            blob,
            ram_size_offset,
        })
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    /// RAM offset of the blob: as high as it fits, 8-byte aligned.
    ///
    /// Blobs are padded to 4 bytes, so the alignment can leave a 4 byte gap
    /// above the blob. The usable RAM patched into the tree is then 4 bytes
    /// smaller than with the blob placed flush against the end of RAM.
    pub fn placement(&self, ram_size: u32) -> Result<u32> {
        let len = u32::try_from(self.blob.len())
            .ok()
            .filter(|&len| len <= ram_size)
            .ok_or_else(|| {
                Error::DeviceTree(format!(
                    "{} byte blob does not fit in {} bytes of RAM",
                    self.blob.len(),
                    ram_size
                ))
            })?;
        Ok((ram_size - len) & !7)
    }

    /// Overwrite the RAM-size cell, big-endian
    pub fn patch_ram_size(&mut self, value: u32) {
        let at = self.ram_size_offset;
        self.blob[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn ram_size_field(&self) -> u32 {
        let at = self.ram_size_offset;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.blob[at..at + 4]);
        u32::from_be_bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be32(blob: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]])
    }

    #[test]
    fn test_header_is_consistent() {
        let dt = DeviceTree::generate(DEFAULT_BOOTARGS);
        let blob = &dt.blob;
        assert_eq!(be32(blob, 0), FDT_MAGIC);
        assert_eq!(be32(blob, 4) as usize, blob.len());
        assert_eq!(blob.len() % 4, 0);
        assert_eq!(be32(blob, 8) as usize, STRUCT_OFFSET);
        let strings = be32(blob, 12) as usize;
        let strings_len = be32(blob, 32) as usize;
        assert!(strings + strings_len <= blob.len());
        assert_eq!(be32(blob, STRUCT_OFFSET), FDT_BEGIN_NODE);
    }

    #[test]
    fn test_ram_size_cell_located_in_memory_reg() {
        let mut dt = DeviceTree::generate(DEFAULT_BOOTARGS);
        let at = dt.ram_size_offset;
        // reg = <0 0x80000000 0 size>
        assert_eq!(be32(&dt.blob, at - 8), 0x8000_0000);
        assert_eq!(dt.ram_size_field(), 0);

        dt.patch_ram_size(0x00FF_F000);
        assert_eq!(&dt.blob[at..at + 4], &[0x00, 0xFF, 0xF0, 0x00]);
        assert_eq!(dt.ram_size_field(), 0x00FF_F000);
    }

    #[test]
    fn test_placement_rounds_down() {
        let dt = DeviceTree::from_blob(vec![0u8; 1500], 0x13c).unwrap();
        // 1500 is not a multiple of 8: four bytes stay unused above the blob
        assert_eq!(dt.placement(0x10000).unwrap(), 0x10000 - 1504);
        let dt = DeviceTree::from_blob(vec![0u8; 1504], 0x13c).unwrap();
        assert_eq!(dt.placement(0x10000).unwrap(), 0x10000 - 1504);
        assert!(dt.placement(1000).is_err());
    }

    #[test]
    fn test_custom_blob_offset_checked() {
        assert!(DeviceTree::from_blob(vec![0u8; 0x100], 0x13c).is_err());
        assert!(DeviceTree::from_blob(vec![0u8; 0x200], 0x13e).is_err());
        assert!(DeviceTree::from_blob(vec![0u8; 0x200], 0x13c).is_ok());
    }

    #[test]
    fn test_string_table_deduplicates() {
        let mut b = DtbBuilder::new();
        b.begin_node("");
        b.property_u32("phandle", 1);
        b.property_u32("phandle", 2);
        b.end_node();
        let blob = b.finish();
        assert_eq!(be32(&blob, 32), "phandle\0".len() as u32);
    }
}

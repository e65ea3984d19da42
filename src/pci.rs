//! PCI config-space access and two chipset quirks worth carrying as
//! in-scope data (everything else about PCI probing is an external
//! collaborator): read/write goes through `Platform` instead of raw
//! `0xCF8/0xCFC` port I/O so the same code runs against a test double.

use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub addr: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

pub fn read_u32(p: &dyn Platform, addr: PciAddress, offset: u8) -> u32 {
    p.pci_read32(addr.bus, addr.device, addr.function, offset)
}

pub fn write_u32(p: &dyn Platform, addr: PciAddress, offset: u8, value: u32) {
    p.pci_write32(addr.bus, addr.device, addr.function, offset, value)
}

pub fn read_u16(p: &dyn Platform, addr: PciAddress, offset: u8) -> u16 {
    p.pci_read16(addr.bus, addr.device, addr.function, offset)
}

pub fn write_u16(p: &dyn Platform, addr: PciAddress, offset: u8, value: u16) {
    p.pci_write16(addr.bus, addr.device, addr.function, offset, value)
}

pub fn probe(p: &dyn Platform, addr: PciAddress) -> Option<PciDevice> {
    let vendor_id = read_u16(p, addr, 0x00);
    if vendor_id == 0xFFFF {
        return None;
    }
    let device_id = read_u16(p, addr, 0x02);
    let class_word = read_u32(p, addr, 0x08);
    Some(PciDevice {
        addr,
        vendor_id,
        device_id,
        revision: (class_word & 0xFF) as u8,
        prog_if: ((class_word >> 8) & 0xFF) as u8,
        subclass: ((class_word >> 16) & 0xFF) as u8,
        class_code: ((class_word >> 24) & 0xFF) as u8,
    })
}

/// Decode BAR `index` (0..=5). Returns (physical base, is_64bit).
/// 64-bit MMIO BARs consume `index` and `index + 1`.
pub fn read_bar64(p: &dyn Platform, dev: &PciDevice, index: u8) -> (u64, bool) {
    let offset = 0x10 + index * 4;
    let low = read_u32(p, dev.addr, offset);
    if low & 0x1 == 0x1 {
        return ((low & 0xFFFF_FFFC) as u64, false);
    }
    let is_64 = (low >> 1) & 0x3 == 0x2;
    if is_64 {
        let high = read_u32(p, dev.addr, offset + 4);
        (((high as u64) << 32) | (low & 0xFFFF_FFF0) as u64, true)
    } else {
        ((low & 0xFFFF_FFF0) as u64, false)
    }
}

pub fn enable_bus_mastering(p: &dyn Platform, dev: &PciDevice) {
    let cmd = read_u16(p, dev.addr, 0x04);
    write_u16(p, dev.addr, 0x04, cmd | (1 << 0) | (1 << 1) | (1 << 2));
}

/// AMD/ATI SB600 and early SB700 EHCI controllers drop packets under load
/// unless the periodic-list cache is disabled via a vendor config
/// register (vendor/device `0x1002:0x4385`, revisions `0x3a`/`0x3b`).
pub fn is_amd_periodic_cache_quirk(dev: &PciDevice) -> bool {
    dev.vendor_id == 0x1002
        && dev.device_id == 0x4385
        && (dev.revision == 0x3a || dev.revision == 0x3b)
}

pub fn apply_amd_periodic_cache_quirk(p: &dyn Platform, dev: &PciDevice) {
    const SB_QUIRK_REG: u8 = 0x50;
    const DISABLE_CACHE_BIT: u32 = 1 << 27;
    let value = read_u32(p, dev.addr, SB_QUIRK_REG);
    write_u32(p, dev.addr, SB_QUIRK_REG, value | DISABLE_CACHE_BIT);
}

/// Intel xHCI controllers that also own the companion EHCI ports must be
/// told, via vendor registers, to route those ports to the xHCI side
/// before the EHCI driver for the same ports gives up ownership.
const INTEL_XHCI_DEVICE_IDS: &[u16] = &[
    0x1E31, // Panther Point
    0x8C31, // Lynx Point
    0x9C31, // Lynx Point-LP
    0x9D2F, // BayTrail
    0x9CB1, // Wildcat Point-LP
    0x8CB1, // Wildcat Point
];

pub fn is_intel_port_routing_quirk(dev: &PciDevice) -> bool {
    dev.vendor_id == 0x8086 && INTEL_XHCI_DEVICE_IDS.contains(&dev.device_id)
}

pub fn apply_intel_port_routing_quirk(p: &dyn Platform, dev: &PciDevice) {
    const USB3_PSSEN: u8 = 0xD8;
    const XUSB2PRM: u8 = 0xD4;
    const XUSB2PR: u8 = 0xD0;
    let super_speed_ports = read_u32(p, dev.addr, USB3_PSSEN);
    write_u32(p, dev.addr, USB3_PSSEN, super_speed_ports);
    let can_be_routed = read_u32(p, dev.addr, XUSB2PRM);
    write_u32(p, dev.addr, XUSB2PR, can_be_routed);
}

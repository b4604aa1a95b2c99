//! JEDEC identification and capacity derivation.
//!
//! The identification command returns three bytes: manufacturer,
//! memory type and a capacity code. Capacity encoding is vendor
//! specific, so the derivation below is a table of the families the
//! driver has been used with; an unrecognized combination yields zero,
//! which the backend treats as "device not usable".

/// Device identity read once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashId {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity_code: u8,
}

impl FlashId {
    pub fn new(manufacturer: u8, memory_type: u8, capacity_code: u8) -> Self {
        Self {
            manufacturer,
            memory_type,
            capacity_code,
        }
    }
}

/// Manufacturer name for the known vendor IDs.
pub fn vendor_name(manufacturer: u8) -> Option<&'static str> {
    match manufacturer {
        0x01 => Some("Spansion"),
        0x0E => Some("Fremont"),
        0x1F => Some("Adesto"),
        0x20 => Some("Micron"),
        0x9D => Some("ISSI"),
        0xBF => Some("Microchip"),
        0xC2 => Some("Macronix"),
        0xC8 => Some("GigaDevice"),
        0xEF => Some("Winbond"),
        _ => None,
    }
}

/// Derive the device capacity in KiB from its identity, or 0 when the
/// encoding is not recognized.
pub fn capacity_kib(id: &FlashId) -> u32 {
    if id.manufacturer == 0x1F && id.capacity_code == 0x01 {
        // Adesto: lower 7 bits of the type byte are the capacity in
        // megabit.
        return 4 * (32 * u32::from(id.memory_type & !0x80));
    }
    match id.memory_type {
        0x23 | 0x40 | 0x60 | 0x70 => {
            // Capacity code is log2 of the size in bytes.
            4 << (u32::from(id.capacity_code).saturating_sub(12))
        }
        0x26 => {
            // Microchip SST26 family.
            if id.capacity_code == 0x41 {
                2 * 1024
            } else {
                0
            }
        }
        0xBA => {
            // Micron encodes the megabit exponent in BCD:
            // 0x19 = 256 Mbit, 0x20 = 512 Mbit.
            let code = ((id.capacity_code & 0xF0) >> 4) * 10 + (id.capacity_code & 0x0F);
            1 << (u32::from(code).saturating_sub(4))
        }
        _ => 0,
    }
}

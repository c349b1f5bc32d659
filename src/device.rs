//! Device descriptions and the bootloader address register type.

use core::fmt;

/// Static description of the target microcontroller and its boot section
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceConfig {
    /// Part name, for logging only
    pub name: &'static str,

    /// Three signature bytes reported by the info command
    pub signature: [u8; 3],

    /// Flash page size in bytes
    pub page_size: u16,

    /// Last valid flash byte address
    pub flash_end: u32,

    /// First byte address of the boot section
    pub boot_start: u32,
}

/// ATmega328P with a 4 KiB boot section
pub const ATMEGA328P: DeviceConfig =
    DeviceConfig::new("atmega328p", [0x1E, 0x95, 0x0F], 128, 0x7FFF, 0x7000);

/// ATmega64 with an 8 KiB boot section
pub const ATMEGA64: DeviceConfig =
    DeviceConfig::new("atmega64", [0x1E, 0x96, 0x02], 256, 0xFFFF, 0xE000);

/// ATmega2561 with an 8 KiB boot section
pub const ATMEGA2561: DeviceConfig =
    DeviceConfig::new("atmega2561", [0x1E, 0x98, 0x02], 256, 0x3FFFF, 0x3E000);

/// Reasons a [`DeviceConfig`] cannot be used
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ConfigError {
    /// Page size is zero, odd or not a power of two
    PageSize(u16),
    /// Boot section start is not on a page boundary
    BootAlignment(u32),
    /// Boot section start is zero or beyond the end of flash
    BootRange(u32),
}

/// Address rejected by the address register
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum AddressError {
    /// Page containing the address overlaps the boot section
    BootSection { address: u32, boot_start: u32 },
}

impl DeviceConfig {
    pub const fn new(
        name: &'static str,
        signature: [u8; 3],
        page_size: u16,
        flash_end: u32,
        boot_start: u32,
    ) -> Self {
        Self {
            name,
            signature,
            page_size,
            flash_end,
            boot_start,
        }
    }

    /// Check the description is self consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = self.page_size;
        if p < 2 || !p.is_power_of_two() {
            return Err(ConfigError::PageSize(p));
        }
        if self.boot_start & self.page_mask() != 0 {
            return Err(ConfigError::BootAlignment(self.boot_start));
        }
        if self.boot_start == 0 || self.boot_start > self.flash_end {
            return Err(ConfigError::BootRange(self.boot_start));
        }
        Ok(())
    }

    /// Whether flash extends beyond 64 KiB and needs far reads
    pub fn is_far(&self) -> bool {
        self.flash_end > 0xFFFF
    }

    /// Bytes available to the application
    pub fn application_size(&self) -> u32 {
        self.boot_start
    }

    fn page_mask(&self) -> u32 {
        self.page_size as u32 - 1
    }

    /// Clear the in-page offset bits of an address
    pub fn page_align(&self, address: u32) -> u32 {
        address & !self.page_mask()
    }

    /// Page align `raw` and check it lies below the boot section
    pub fn flash_address(&self, raw: u32) -> Result<FlashAddress, AddressError> {
        let address = self.page_align(raw);
        if address >= self.boot_start {
            return Err(AddressError::BootSection {
                address,
                boot_start: self.boot_start,
            });
        }
        Ok(FlashAddress(address))
    }

    /// Reassemble a little endian wire address.
    ///
    /// The top byte only carries meaning on devices with far flash.
    pub fn address_from_wire(&self, bytes: [u8; 3]) -> u32 {
        let low = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        if self.is_far() {
            low | (bytes[2] as u32) << 16
        } else {
            low
        }
    }
}

/// Page aligned flash address below the boot section
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct FlashAddress(u32);

impl FlashAddress {
    /// Start of flash, the reset value of the address register
    pub const ZERO: FlashAddress = FlashAddress(0);

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Little endian wire form, the top byte is zero on small devices
    pub fn to_wire(&self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

impl fmt::Display for FlashAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:05x}", self.0)
    }
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::BootSection {
                address,
                boot_start,
            } => write!(
                f,
                "address 0x{:05x} overlaps boot section at 0x{:05x}",
                address, boot_start
            ),
        }
    }
}

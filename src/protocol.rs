//! Wire constants for the page bootloader protocol.
//!
//! Every command is an ASCII word. The first byte selects the handler, the
//! remaining bytes must follow literally before the handler acts.

/// Line terminator closing every reply
pub const CR: u8 = 0x0D;

/// Reply to the whoami command
pub const WHOAMI_REPLY: &[u8] = b"F4\r";

/// Emitted on any protocol failure
pub const ERROR_REPLY: &[u8] = b"error\r";

/// Reply tag for info
pub const TAG_INFO: u8 = b'I';
/// Reply tag for set-address and get-address
pub const TAG_ADDRESS: u8 = b'A';
/// Reply tag for read-page
pub const TAG_READ: u8 = b'R';
/// Reply tag for write-page
pub const TAG_WRITE: u8 = b'W';
/// Reply tag for exit, sent just before the reset
pub const TAG_EXIT: u8 = b'@';

/// Number of address bytes on the wire, regardless of the device flash size
pub const ADDRESS_BYTES: usize = 3;

/// Window the supervisor polls for a new command before calling the idle hook
pub const IDLE_POLL_MS: u32 = 50;

/// Bounded wait for every byte following an opcode
pub const BYTE_TIMEOUT_MS: u32 = 100;

/// Silence required before the error path stops draining input
pub const DRAIN_QUIET_MS: u32 = 100;

/// Settle time between the end hook and the jump to the application
pub const RESET_DELAY_MS: u32 = 20;

/// Bootloader commands, keyed by their opcode byte
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Device identification, `?`
    WhoAmI = b'?' as isize,

    /// Signature, page size and boot section start, `info`
    Info = b'i' as isize,

    /// Delegates to the user help hook, `help`
    Help = b'h' as isize,

    /// Leave the bootloader and start the application, `exit`
    Exit = b'e' as isize,

    /// Load the address register, `setadr` + 3 address bytes
    SetAddress = b's' as isize,

    /// Report the address register, `adrget`
    GetAddress = b'a' as isize,

    /// Stream the page at the address register, `read`
    ReadPage = b'r' as isize,

    /// Program the page at the address register, `write` + page data
    WritePage = b'w' as isize,
}

impl Command {
    /// Decode an opcode byte
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        let c = match opcode {
            b'?' => Command::WhoAmI,
            b'i' => Command::Info,
            b'h' => Command::Help,
            b'e' => Command::Exit,
            b's' => Command::SetAddress,
            b'a' => Command::GetAddress,
            b'r' => Command::ReadPage,
            b'w' => Command::WritePage,
            _ => return None,
        };
        Some(c)
    }

    /// Opcode byte for this command
    pub fn opcode(&self) -> u8 {
        *self as u8
    }

    /// Literal bytes that must follow the opcode
    pub fn suffix(&self) -> &'static [u8] {
        match self {
            Command::WhoAmI => b"",
            Command::Info => b"nfo",
            Command::Help => b"elp",
            Command::Exit => b"xit",
            Command::SetAddress => b"etadr",
            Command::GetAddress => b"drget",
            Command::ReadPage => b"ead",
            Command::WritePage => b"rite",
        }
    }

    /// Full command word as sent by a host
    pub fn word(&self) -> impl Iterator<Item = u8> {
        core::iter::once(self.opcode()).chain(self.suffix().iter().copied())
    }
}

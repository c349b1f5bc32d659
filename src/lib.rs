//! AVR Serial Page Bootloader.
//!
//! Contains both ends of the link: the device-side [`Bootloader`] engine that
//! runs from the boot section and programs flash one page at a time, and the
//! host-side [`Programmer`] that drives it over a serial port.

#![cfg_attr(not(feature = "std"), no_std)]

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod bootloader;
pub mod device;
pub mod hal;
pub mod page;
pub mod protocol;

#[cfg(feature = "std")]
pub mod sim;

#[cfg(feature = "linux")]
pub mod linux;

pub use bootloader::{Bootloader, ResetCause};
pub use device::{DeviceConfig, FlashAddress};
pub use page::Checksum;

use protocol::{Command, ADDRESS_BYTES, CR, TAG_ADDRESS, TAG_EXIT, TAG_INFO, TAG_READ, TAG_WRITE};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Connected,
    Exited,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum Error<SerialError> {
    #[cfg_attr(feature = "std", error("serial port error: {0:?}"))]
    Serial(SerialError),

    #[cfg_attr(feature = "std", error("no response from bootloader"))]
    ResponseTimeout,

    #[cfg_attr(
        feature = "std",
        error("unexpected response 0x{received:02x} (expected 0x{expected:02x})")
    )]
    InvalidResponse { expected: u8, received: u8 },

    #[cfg_attr(feature = "std", error("bootloader rejected the command"))]
    Rejected,

    #[cfg_attr(
        feature = "std",
        error("checksum mismatch (local 0x{expected:02x}, device 0x{received:02x})")
    )]
    Checksum { expected: u8, received: u8 },

    #[cfg_attr(feature = "std", error("device info not loaded"))]
    NoDeviceInfo,

    #[cfg_attr(
        feature = "std",
        error("device reports unusable page size {page_size} with boot section at 0x{boot_start:05x}")
    )]
    BadDeviceInfo { page_size: u16, boot_start: u32 },

    #[cfg_attr(
        feature = "std",
        error("page buffer is {actual} bytes, device pages are {expected}")
    )]
    PageSize { expected: usize, actual: usize },

    #[cfg_attr(feature = "std", error("address 0x{0:05x} is not page aligned"))]
    Unaligned(u32),

    #[cfg_attr(
        feature = "std",
        error("address 0x{address:05x} overlaps boot section at 0x{boot_start:05x}")
    )]
    BootSection { address: u32, boot_start: u32 },

    #[cfg_attr(
        feature = "std",
        error("device reports address 0x{reported:05x}, requested 0x{requested:05x}")
    )]
    AddressMismatch { requested: u32, reported: u32 },

    #[cfg_attr(feature = "std", error("verification failed at 0x{0:05x}"))]
    Verify(u32),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Whether repeating the command may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ResponseTimeout
                | Error::InvalidResponse { .. }
                | Error::Rejected
                | Error::Checksum { .. }
                | Error::AddressMismatch { .. }
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "300"))]
    pub init_delay_ms: u32,

    /// Attempts per page before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub retries: u32,

    /// Pause before retrying a page, must exceed the bootloader's 100 ms quiet window
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "150"))]
    pub retry_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            poll_delay_ms: 1,
            init_delay_ms: 300,
            retries: 3,
            retry_delay_ms: 150,
        }
    }
}

/// Device description reported by the info command
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceInfo {
    pub signature: [u8; 3],
    pub page_size: u16,
    pub boot_start: u32,
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    device: Option<DeviceInfo>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Init,
            options,
            port,
            delay,
            device: None,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&mut self) -> State {
        self.state
    }

    /// Device info from the last info command
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Connect to the bootloader and load the device info
    pub fn init(&mut self) -> Result<DeviceInfo, Error<E>> {
        // First, reset device
        if !self.options.no_reset {
            debug!("Resetting device");

            self.port.set_dtr(true)?;
            self.port.set_rts(true)?;

            self.delay.delay_ms(100u32);

            self.port.set_dtr(false)?;
            self.port.set_rts(false)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        // Boards may print a banner on start
        let n = self.drain()?;
        if n > 0 {
            debug!("Discarded {} bytes of startup output", n);
        }

        debug!("Awaiting bootloader response");
        self.whoami()?;
        self.state = State::Connected;

        self.info()
    }

    /// Check the bootloader identifies itself
    pub fn whoami(&mut self) -> Result<(), Error<E>> {
        self.command(Command::WhoAmI)?;

        self.expect(b'F')?;
        self.expect(b'4')?;
        self.expect(CR)?;

        debug!("Bootloader identified");
        Ok(())
    }

    /// Load signature, page size and boot section start
    pub fn info(&mut self) -> Result<DeviceInfo, Error<E>> {
        self.command(Command::Info)?;
        self.expect(TAG_INFO)?;

        let mut reply = [0u8; 8];
        self.read_exact(&mut reply)?;
        self.expect(CR)?;

        let info = DeviceInfo {
            signature: [reply[0], reply[1], reply[2]],
            page_size: u16::from_le_bytes([reply[3], reply[4]]),
            boot_start: u32::from_le_bytes([reply[5], reply[6], reply[7], 0]),
        };

        // Page arithmetic below relies on a power of two page size
        let page = info.page_size as u32;
        if page < 2 || !page.is_power_of_two() || info.boot_start % page != 0 {
            warn!("Unusable device info: {:?}", info);
            return Err(Error::BadDeviceInfo {
                page_size: info.page_size,
                boot_start: info.boot_start,
            });
        }

        info!(
            "Device signature {:02x?}, page size {} bytes, boot section at 0x{:05x}",
            info.signature, info.page_size, info.boot_start
        );

        self.device = Some(info);
        Ok(info)
    }

    /// Ask the device to print its help text, collecting it until it goes quiet
    #[cfg(feature = "std")]
    pub fn help(&mut self) -> Result<Vec<u8>, Error<E>> {
        self.command(Command::Help)?;

        let mut text = Vec::new();
        loop {
            match self.read_byte() {
                Ok(v) => text.push(v),
                Err(Error::ResponseTimeout) => return Ok(text),
                Err(e) => return Err(e),
            }
        }
    }

    /// Leave the bootloader and start the application
    pub fn exit(&mut self) -> Result<(), Error<E>> {
        self.command(Command::Exit)?;
        self.expect(TAG_EXIT)?;

        info!("Bootloader exited");
        self.state = State::Exited;
        Ok(())
    }

    /// Load the device address register, returning the page aligned value
    pub fn set_address(&mut self, address: u32) -> Result<u32, Error<E>> {
        let device = self.device.ok_or(Error::NoDeviceInfo)?;
        let aligned = address & !(device.page_size as u32 - 1);

        if aligned >= device.boot_start {
            return Err(Error::BootSection {
                address,
                boot_start: device.boot_start,
            });
        }

        self.command(Command::SetAddress)?;
        let wire = address.to_le_bytes();
        self.send(&wire[..ADDRESS_BYTES])?;

        let reported = self.read_address()?;
        if reported != aligned {
            return Err(Error::AddressMismatch {
                requested: aligned,
                reported,
            });
        }

        trace!("Address set to 0x{:05x}", reported);
        Ok(reported)
    }

    /// Read back the device address register
    pub fn get_address(&mut self) -> Result<u32, Error<E>> {
        self.command(Command::GetAddress)?;
        self.read_address()
    }

    /// Program one page at the device address register
    pub fn write_page(&mut self, data: &[u8]) -> Result<u8, Error<E>> {
        self.check_page(data.len())?;

        self.command(Command::WritePage)?;
        self.send(data)?;

        self.expect(TAG_WRITE)?;
        let received = self.read_byte()?;
        self.expect(CR)?;

        let expected = Checksum::of(data).value();
        if received != expected {
            return Err(Error::Checksum { expected, received });
        }
        Ok(received)
    }

    /// Read one page at the device address register
    pub fn read_page(&mut self, data: &mut [u8]) -> Result<u8, Error<E>> {
        self.check_page(data.len())?;

        self.command(Command::ReadPage)?;
        self.expect(TAG_READ)?;
        self.read_exact(data)?;

        let received = self.read_byte()?;
        self.expect(CR)?;

        let expected = Checksum::of(data).value();
        if received != expected {
            return Err(Error::Checksum { expected, received });
        }
        Ok(received)
    }

    /// Write an image page by page, padding the last page with 0xFF.
    ///
    /// `progress` is called with the number of bytes completed.
    #[cfg(feature = "std")]
    pub fn write_image<F: FnMut(usize)>(
        &mut self,
        base: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<(), Error<E>> {
        let page = self.check_range(base, data.len())?;
        let mut buff = vec![0xFFu8; page];

        for (i, chunk) in data.chunks(page).enumerate() {
            let address = base + (i * page) as u32;

            buff[..chunk.len()].copy_from_slice(chunk);
            buff[chunk.len()..].iter_mut().for_each(|v| *v = 0xFF);

            self.retry(|p| {
                p.set_address(address)?;
                p.write_page(&buff)
            })?;

            debug!("Wrote page 0x{:05x}", address);
            progress(i * page + chunk.len());
        }

        Ok(())
    }

    /// Read `len` bytes of flash starting at a page boundary
    #[cfg(feature = "std")]
    pub fn read_image<F: FnMut(usize)>(
        &mut self,
        base: u32,
        len: usize,
        mut progress: F,
    ) -> Result<Vec<u8>, Error<E>> {
        let page = self.check_range(base, len)?;
        let mut buff = vec![0u8; page];
        let mut data = Vec::with_capacity(len);

        while data.len() < len {
            let address = base + data.len() as u32;

            self.retry(|p| {
                p.set_address(address)?;
                p.read_page(&mut buff)
            })?;

            let n = (len - data.len()).min(page);
            data.extend_from_slice(&buff[..n]);
            progress(data.len());
        }

        Ok(data)
    }

    /// Compare flash against an image
    #[cfg(feature = "std")]
    pub fn verify_image<F: FnMut(usize)>(
        &mut self,
        base: u32,
        data: &[u8],
        progress: F,
    ) -> Result<(), Error<E>> {
        let read = self.read_image(base, data.len(), progress)?;

        match read.iter().zip(data.iter()).position(|(a, b)| a != b) {
            Some(i) => Err(Error::Verify(base + i as u32)),
            None => Ok(()),
        }
    }

    /// Run `f`, repeating it after transient failures
    #[cfg(feature = "std")]
    fn retry<R, F>(&mut self, mut f: F) -> Result<R, Error<E>>
    where
        F: FnMut(&mut Self) -> Result<R, Error<E>>,
    {
        let mut attempt = 1;

        loop {
            match f(self) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.options.retries => {
                    warn!("Attempt {} failed: {:?}, retrying", attempt, e);
                    attempt += 1;

                    // Let the bootloader finish draining before the next try
                    self.delay.delay_ms(self.options.retry_delay_ms);
                    self.drain()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Check an image fits below the boot section, returning the page size
    #[cfg(feature = "std")]
    fn check_range(&self, base: u32, len: usize) -> Result<usize, Error<E>> {
        let device = self.device.ok_or(Error::NoDeviceInfo)?;
        let page = device.page_size as usize;

        if base as usize % page != 0 {
            return Err(Error::Unaligned(base));
        }
        if base as usize + len > device.boot_start as usize {
            return Err(Error::BootSection {
                address: base + len as u32,
                boot_start: device.boot_start,
            });
        }

        Ok(page)
    }

    fn check_page(&self, len: usize) -> Result<(), Error<E>> {
        let device = self.device.ok_or(Error::NoDeviceInfo)?;
        if len != device.page_size as usize {
            return Err(Error::PageSize {
                expected: device.page_size as usize,
                actual: len,
            });
        }
        Ok(())
    }

    fn command(&mut self, command: Command) -> Result<(), Error<E>> {
        trace!("Sending command {:?}", command);

        for c in command.word() {
            block!(self.port.write(c))?;
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for d in data {
            block!(self.port.write(*d))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Discard anything waiting in the receive buffer
    fn drain(&mut self) -> Result<usize, Error<E>> {
        let mut n = 0;
        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => return Ok(n),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
    }

    fn read_address(&mut self) -> Result<u32, Error<E>> {
        self.expect(TAG_ADDRESS)?;

        let mut wire = [0u8; 4];
        self.read_exact(&mut wire[..ADDRESS_BYTES])?;
        self.expect(CR)?;

        Ok(u32::from_le_bytes(wire))
    }

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        for d in data.iter_mut() {
            *d = self.read_byte()?;
        }
        Ok(())
    }

    /// Await a reply tag, mapping the bootloader error reply to `Rejected`
    fn expect(&mut self, tag: u8) -> Result<(), Error<E>> {
        match self.read_byte()? {
            v if v == tag => Ok(()),
            b'e' => {
                for &c in b"rror\r" {
                    let v = self.read_byte()?;
                    if v != c {
                        return Err(Error::InvalidResponse {
                            expected: c,
                            received: v,
                        });
                    }
                }
                debug!("Received bootloader error");
                Err(Error::Rejected)
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse {
                    expected: tag,
                    received: v,
                })
            }
        }
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            if t > self.options.response_timeout_ms {
                debug!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}

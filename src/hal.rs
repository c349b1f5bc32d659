//! Hardware seams used by the device-side bootloader.
//!
//! The bootloader engine never touches registers itself, a board crate
//! provides these traits for its UARTs, its flash controller and its core.

use embedded_hal::serial::{Read, Write};

/// Byte stream the bootloader receives commands on
pub trait Transport {
    /// Number of bytes ready to be read without blocking
    fn available(&mut self) -> usize;

    /// Next received byte, blocks until one arrives
    fn read(&mut self) -> u8;

    /// Queue one byte for transmission
    fn write(&mut self, data: u8);

    fn write_all(&mut self, data: &[u8]) {
        for d in data {
            self.write(*d);
        }
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn available(&mut self) -> usize {
        (**self).available()
    }

    fn read(&mut self) -> u8 {
        (**self).read()
    }

    fn write(&mut self, data: u8) {
        (**self).write(data)
    }
}

/// Self programming flash controller (SPM on AVR)
///
/// Addresses are byte addresses. Operations other than `is_busy` may
/// only be issued while the controller is idle.
pub trait Flash {
    /// Start erasing the page containing `address`
    fn page_erase(&mut self, address: u32);

    /// Stage one little endian word into the temporary page buffer
    fn page_fill(&mut self, address: u32, word: u16);

    /// Start committing the temporary page buffer to the page at `address`
    fn page_write(&mut self, address: u32);

    /// Hardware busy flag of the last erase or write
    fn is_busy(&mut self) -> bool;

    /// Re-enable the read-while-write section after programming
    fn rww_enable(&mut self);

    /// Read a flash byte below 64 KiB
    fn read_near(&mut self, address: u16) -> u8;

    /// Read a flash byte anywhere in flash
    fn read_far(&mut self, address: u32) -> u8;
}

/// Core level control the bootloader needs
pub trait Cpu {
    fn enable_interrupts(&mut self);

    fn disable_interrupts(&mut self);

    /// Move the interrupt vector table into the boot section
    fn boot_vectors(&mut self);

    /// Move the interrupt vector table back to the application
    fn application_vectors(&mut self);

    /// Jump to flash address zero
    fn jump_to_application(&mut self) -> !;
}

/// Interrupts disabled for the lifetime of the guard
pub struct CriticalSection<'a, C: Cpu> {
    cpu: &'a mut C,
}

impl<'a, C: Cpu> CriticalSection<'a, C> {
    pub fn new(cpu: &'a mut C) -> Self {
        cpu.disable_interrupts();
        Self { cpu }
    }
}

impl<'a, C: Cpu> Drop for CriticalSection<'a, C> {
    fn drop(&mut self) {
        self.cpu.enable_interrupts();
    }
}

/// Board specific callbacks, invoked by the bootloader at well defined points.
///
/// The defaults keep the bootloader running and do nothing else.
pub trait Hooks {
    /// Called once at power up, returning false starts the application instead
    fn start(&mut self) -> bool {
        true
    }

    /// Called right before leaving the bootloader, reconfigure hardware here
    fn end(&mut self) {}

    /// Called after every quiet poll window, returning false leaves the bootloader
    fn idle(&mut self) -> bool {
        true
    }

    /// Called for every received opcode
    fn command(&mut self) {}

    /// Called for the help command, may print anything to the transport
    fn help(&mut self, _out: &mut dyn Transport) {}

    /// Called on every protocol error, returning false leaves the bootloader
    fn error(&mut self) -> bool {
        true
    }
}

impl Hooks for () {}

/// Adapts an embedded-hal serial port to a [`Transport`]
///
/// A single byte look-ahead slot answers `available` without losing data.
pub struct SerialTransport<S> {
    serial: S,
    pending: Option<u8>,
}

impl<S, E> SerialTransport<S>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: core::fmt::Debug,
{
    pub fn new(serial: S) -> Self {
        Self {
            serial,
            pending: None,
        }
    }

    /// Release the wrapped port, any look-ahead byte is dropped
    pub fn free(self) -> S {
        self.serial
    }

    fn poll(&mut self) -> Option<u8> {
        if self.pending.is_none() {
            match self.serial.read() {
                Ok(v) => self.pending = Some(v),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => warn!("Serial receive error: {:?}", e),
            }
        }
        self.pending
    }
}

impl<S, E> Transport for SerialTransport<S>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: core::fmt::Debug,
{
    fn available(&mut self) -> usize {
        self.poll().is_some() as usize
    }

    fn read(&mut self) -> u8 {
        loop {
            if let Some(v) = self.poll() {
                self.pending = None;
                return v;
            }
        }
    }

    fn write(&mut self, data: u8) {
        if let Err(e) = block!(self.serial.write(data)) {
            warn!("Serial transmit error: {:?}", e);
        }
    }
}

/// Which links of a [`Multiplex`] are listened and talked on
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Select {
    First,
    Second,
    Both,
}

impl Select {
    fn first(&self) -> bool {
        *self != Select::Second
    }

    fn second(&self) -> bool {
        *self != Select::First
    }
}

/// Runs the bootloader over two links at once, for example a cable UART
/// and a radio module
pub struct Multiplex<A, B> {
    first: A,
    second: B,
    select: Select,
}

impl<A: Transport, B: Transport> Multiplex<A, B> {
    pub fn new(first: A, second: B, select: Select) -> Self {
        Self {
            first,
            second,
            select,
        }
    }

    pub fn select(&self) -> Select {
        self.select
    }

    pub fn set_select(&mut self, select: Select) {
        debug!("Transport select: {:?}", select);
        self.select = select;
    }

    pub fn first(&mut self) -> &mut A {
        &mut self.first
    }

    pub fn second(&mut self) -> &mut B {
        &mut self.second
    }
}

impl<A: Transport, B: Transport> Transport for Multiplex<A, B> {
    fn available(&mut self) -> usize {
        let mut count = 0usize;
        if self.select.first() {
            count += self.first.available();
        }
        if self.select.second() {
            count += self.second.available();
        }
        count.min(255)
    }

    fn read(&mut self) -> u8 {
        loop {
            if self.select.first() && self.first.available() > 0 {
                return self.first.read();
            }
            if self.select.second() && self.second.available() > 0 {
                return self.second.read();
            }
        }
    }

    fn write(&mut self, data: u8) {
        if self.select.first() {
            self.first.write(data);
        }
        if self.select.second() {
            self.second.write(data);
        }
    }
}

//! Device-side bootloader: command interpreter, address register and the
//! idle / reset supervisor.
//!
//! The engine runs from the boot section and owns every peripheral it
//! touches. It only leaves through the reset sequence, which hands control
//! back to the application at flash address zero.

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{ConfigError, DeviceConfig, FlashAddress};
use crate::hal::{Cpu, Flash, Hooks, Transport};
use crate::protocol::*;

/// Supervisor state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Waiting for an opcode
    Idle,
    /// Executing a command
    Active,
}

/// Why the bootloader handed control to the application
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ResetCause {
    /// Host sent the exit command
    Exit,
    /// Idle hook asked to stop
    Idle,
    /// Error hook asked to stop
    Error,
    /// Start hook declined to run the bootloader
    NotRequested,
}

/// A command that ended early
#[derive(Copy, Clone, PartialEq, Debug)]
pub(crate) enum Abort {
    /// Error path ran, ready for the next opcode
    Recovered,
    /// Leave the bootloader
    Reset(ResetCause),
}

pub(crate) type Step = Result<(), Abort>;

pub struct Bootloader<T, F, C, D, H> {
    pub(crate) config: DeviceConfig,
    pub(crate) transport: T,
    pub(crate) flash: F,
    pub(crate) cpu: C,
    pub(crate) delay: D,
    pub(crate) hooks: H,
    pub(crate) address: FlashAddress,
    state: State,
}

impl<T, F, C, D, H> Bootloader<T, F, C, D, H>
where
    T: Transport,
    F: Flash,
    C: Cpu,
    D: DelayMs<u32>,
    H: Hooks,
{
    /// Create a new bootloader instance
    pub fn new(
        config: DeviceConfig,
        transport: T,
        flash: F,
        cpu: C,
        delay: D,
        hooks: H,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            transport,
            flash,
            cpu,
            delay,
            hooks,
            address: FlashAddress::ZERO,
            state: State::Idle,
        })
    }

    /// Fetch the supervisor state
    pub fn state(&self) -> State {
        self.state
    }

    /// Current address register value
    pub fn address(&self) -> FlashAddress {
        self.address
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run the bootloader and jump to the application once it is done
    pub fn start(mut self) -> ! {
        self.run();
        self.cpu.jump_to_application()
    }

    /// Run the bootloader until the supervisor resets.
    ///
    /// Performs the whole reset sequence except for the final jump.
    pub fn run(&mut self) -> ResetCause {
        self.cpu.disable_interrupts();
        self.cpu.boot_vectors();

        if !self.hooks.start() {
            return self.reset(ResetCause::NotRequested);
        }
        self.cpu.enable_interrupts();

        info!(
            "Bootloader running on {} (page {} bytes, boot section at 0x{:05x})",
            self.config.name, self.config.page_size, self.config.boot_start
        );

        loop {
            match self.step() {
                Ok(()) | Err(Abort::Recovered) => (),
                Err(Abort::Reset(cause)) => return self.reset(cause),
            }
        }
    }

    /// Await and execute a single command
    fn step(&mut self) -> Step {
        self.await_command()?;

        self.state = State::Active;
        let opcode = self.transport.read();
        self.hooks.command();
        let r = self.dispatch(opcode);
        self.state = State::Idle;

        r
    }

    fn dispatch(&mut self, opcode: u8) -> Step {
        let command = match Command::from_opcode(opcode) {
            Some(c) => c,
            None => {
                debug!("Unknown opcode 0x{:02x}", opcode);
                return Err(self.error());
            }
        };

        self.expect_bytes(command.suffix())?;
        debug!("Command: {:?}", command);

        match command {
            Command::WhoAmI => self.transport.write_all(WHOAMI_REPLY),
            Command::Info => self.send_info(),
            Command::Help => self.hooks.help(&mut self.transport),
            Command::Exit => {
                self.transport.write(TAG_EXIT);
                return Err(Abort::Reset(ResetCause::Exit));
            }
            Command::SetAddress => return self.set_address(),
            Command::GetAddress => self.send_address(),
            Command::ReadPage => self.read_page(),
            Command::WritePage => return self.write_page(),
        }

        Ok(())
    }

    /// Idle state, returns once a byte is waiting
    fn await_command(&mut self) -> Step {
        loop {
            if self.poll(IDLE_POLL_MS) {
                return Ok(());
            }

            if !self.hooks.idle() {
                debug!("Idle hook requested exit");
                return Err(Abort::Reset(ResetCause::Idle));
            }
        }
    }

    /// Poll the transport for up to `ms` milliseconds
    fn poll(&mut self, ms: u32) -> bool {
        for _ in 0..ms {
            if self.transport.available() > 0 {
                return true;
            }
            self.delay.delay_ms(1);
        }
        false
    }

    /// Bounded wait for the next byte of a command
    pub(crate) fn wait(&mut self) -> Step {
        if self.poll(BYTE_TIMEOUT_MS) {
            return Ok(());
        }

        debug!("Receive timeout");
        Err(self.error())
    }

    /// Next byte of a command, any value accepted
    pub(crate) fn next_byte(&mut self) -> Result<u8, Abort> {
        self.wait()?;
        Ok(self.transport.read())
    }

    /// Consume `literal` byte by byte, aborting on the first mismatch
    pub(crate) fn expect_bytes(&mut self, literal: &[u8]) -> Step {
        for &expected in literal {
            let v = self.next_byte()?;
            if v != expected {
                debug!("Expected 0x{:02x}, received 0x{:02x}", expected, v);
                return Err(self.error());
            }
        }
        Ok(())
    }

    /// Report a protocol error and discard input until the line is quiet
    pub(crate) fn error(&mut self) -> Abort {
        warn!("Protocol error, dropping command");

        // A write may have been cut short
        spm_wait(&mut self.flash);
        self.flash.rww_enable();

        self.transport.write_all(ERROR_REPLY);

        if !self.hooks.error() {
            debug!("Error hook requested exit");
            return Abort::Reset(ResetCause::Error);
        }

        let mut quiet = 0;
        let mut dropped = 0usize;
        while quiet < DRAIN_QUIET_MS {
            if self.transport.available() > 0 {
                while self.transport.available() > 0 {
                    self.transport.read();
                    dropped += 1;
                }
                quiet = 0;
            } else {
                quiet += 1;
            }
            self.delay.delay_ms(1);
        }
        trace!("Dropped {} bytes", dropped);

        Abort::Recovered
    }

    /// Hand the device back to the application, except for the jump itself
    fn reset(&mut self, cause: ResetCause) -> ResetCause {
        info!("Leaving bootloader: {:?}", cause);

        self.cpu.enable_interrupts();
        self.hooks.end();
        self.cpu.disable_interrupts();

        self.cpu.application_vectors();

        spm_wait(&mut self.flash);
        self.flash.rww_enable();

        self.delay.delay_ms(RESET_DELAY_MS);
        cause
    }

    fn send_info(&mut self) {
        let c = &self.config;
        let page = c.page_size.to_le_bytes();
        let boot = c.boot_start.to_le_bytes();

        let reply = [
            TAG_INFO,
            c.signature[0],
            c.signature[1],
            c.signature[2],
            page[0],
            page[1],
            boot[0],
            boot[1],
            boot[2],
            CR,
        ];
        self.transport.write_all(&reply);
    }

    fn set_address(&mut self) -> Step {
        let mut wire = [0u8; ADDRESS_BYTES];
        for b in wire.iter_mut() {
            *b = self.next_byte()?;
        }

        let raw = self.config.address_from_wire(wire);
        match self.config.flash_address(raw) {
            Ok(a) => {
                debug!("Address set to {}", a);
                self.address = a;
                self.send_address();
                Ok(())
            }
            Err(e) => {
                warn!("Rejected address: {}", e);
                Err(self.error())
            }
        }
    }

    fn send_address(&mut self) {
        self.transport.write(TAG_ADDRESS);
        self.transport.write_all(&self.address.to_wire());
        self.transport.write(CR);
    }
}

/// Spin until the flash controller is idle
pub(crate) fn spm_wait<F: Flash>(flash: &mut F) {
    while flash.is_busy() {}
}

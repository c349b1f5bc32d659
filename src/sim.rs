//! In-memory device model for exercising the bootloader without hardware.
//!
//! [`SimFlash`] behaves like the AVR self programming unit closely enough
//! to catch misuse: operations issued while busy, page fills with
//! interrupts enabled and reads from a disabled read-while-write section
//! are all counted.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial;

use crate::bootloader::Bootloader;
use crate::device::DeviceConfig;
use crate::hal::{Cpu, Flash, Hooks, Transport};
use crate::SerialPort;

/// Polls reported busy after each erase or write
const BUSY_POLLS: u32 = 3;

/// Shared byte queue, one direction of a simulated link
#[derive(Clone, Default, Debug)]
pub struct Pipe(Arc<Mutex<VecDeque<u8>>>);

impl Pipe {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<u8>> {
        // A poisoned queue still holds valid bytes
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, data: &[u8]) {
        self.lock().extend(data.iter().copied());
    }

    pub fn pop(&self) -> Option<u8> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything queued
    pub fn drain(&self) -> Vec<u8> {
        self.lock().drain(..).collect()
    }
}

/// Device end of a simulated link
#[derive(Clone, Debug)]
pub struct SimTransport {
    rx: Pipe,
    tx: Pipe,
}

impl SimTransport {
    pub fn new(rx: Pipe, tx: Pipe) -> Self {
        Self { rx, tx }
    }
}

impl Transport for SimTransport {
    fn available(&mut self) -> usize {
        self.rx.len()
    }

    fn read(&mut self) -> u8 {
        loop {
            if let Some(v) = self.rx.pop() {
                return v;
            }
            std::thread::yield_now();
        }
    }

    fn write(&mut self, data: u8) {
        self.tx.push(&[data]);
    }
}

/// Host end of a simulated link
#[derive(Clone, Debug)]
pub struct SimSerial {
    rx: Pipe,
    tx: Pipe,
    rts: bool,
    dtr: bool,
}

impl SimSerial {
    pub fn rts(&self) -> bool {
        self.rts
    }

    pub fn dtr(&self) -> bool {
        self.dtr
    }
}

impl serial::Read<u8> for SimSerial {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop().ok_or(nb::Error::WouldBlock)
    }
}

impl serial::Write<u8> for SimSerial {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.tx.push(&[word]);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl SerialPort<Infallible> for SimSerial {
    fn set_rts(&mut self, level: bool) -> Result<(), Infallible> {
        self.rts = level;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Infallible> {
        self.dtr = level;
        Ok(())
    }
}

/// Connected device and host ends
pub fn link() -> (SimTransport, SimSerial) {
    let (down, up) = (Pipe::default(), Pipe::default());
    let device = SimTransport::new(down.clone(), up.clone());
    let host = SimSerial {
        rx: up,
        tx: down,
        rts: false,
        dtr: false,
    };
    (device, host)
}

/// Flash memory and self programming unit
#[derive(Debug)]
pub struct SimFlash {
    config: DeviceConfig,
    memory: Vec<u8>,
    buffer: Vec<u16>,
    busy: u32,
    rww: bool,
    interrupts: Option<Arc<AtomicBool>>,

    /// Page addresses erased, in order
    pub erases: Vec<u32>,
    /// Page addresses written, in order
    pub writes: Vec<u32>,
    /// Operations started while the unit was still busy
    pub busy_violations: usize,
    /// Page fills issued with interrupts enabled
    pub unguarded_fills: usize,
    /// Reads from application flash while read-while-write was disabled
    pub rww_violations: usize,
    /// Read-while-write enables
    pub rww_enables: usize,
    /// Busy polls answered true with interrupts disabled
    pub masked_busy_polls: usize,
}

impl SimFlash {
    /// Blank (all 0xFF) flash for `config`
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            memory: vec![0xFF; config.flash_end as usize + 1],
            buffer: vec![0xFFFF; config.page_size as usize / 2],
            busy: 0,
            rww: true,
            interrupts: None,
            erases: Vec::new(),
            writes: Vec::new(),
            busy_violations: 0,
            unguarded_fills: 0,
            rww_violations: 0,
            rww_enables: 0,
            masked_busy_polls: 0,
        }
    }

    /// Track the interrupt flag of `cpu` to catch unguarded page fills
    pub fn watch_interrupts(&mut self, cpu: &SimCpu) {
        self.interrupts = Some(cpu.interrupts.clone());
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Preload flash content, bypassing the programming unit
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
    }

    /// Content of the page starting at `address`
    pub fn page(&self, address: u32) -> &[u8] {
        let start = address as usize;
        &self.memory[start..start + self.config.page_size as usize]
    }

    fn page_range(&self, address: u32) -> std::ops::Range<usize> {
        let start = self.config.page_align(address) as usize;
        start..start + self.config.page_size as usize
    }

    fn start_operation(&mut self) {
        if self.busy > 0 {
            self.busy_violations += 1;
        }
        self.busy = BUSY_POLLS;
        self.rww = false;
    }

    fn interrupts_masked(&self) -> bool {
        match &self.interrupts {
            Some(i) => !i.load(Ordering::SeqCst),
            None => false,
        }
    }

    fn check_rww(&mut self, address: u32) {
        if !self.rww && address < self.config.boot_start {
            self.rww_violations += 1;
        }
    }
}

impl Flash for SimFlash {
    fn page_erase(&mut self, address: u32) {
        self.start_operation();
        let range = self.page_range(address);
        self.memory[range].iter_mut().for_each(|b| *b = 0xFF);
        self.erases.push(self.config.page_align(address));
    }

    fn page_fill(&mut self, address: u32, word: u16) {
        if self.busy > 0 {
            self.busy_violations += 1;
        }
        if self.interrupts.is_some() && !self.interrupts_masked() {
            self.unguarded_fills += 1;
        }
        let offset = (address % self.config.page_size as u32) as usize / 2;
        self.buffer[offset] = word;
    }

    fn page_write(&mut self, address: u32) {
        self.start_operation();
        let range = self.page_range(address);
        for (dst, w) in self.memory[range].chunks_mut(2).zip(self.buffer.iter()) {
            dst.copy_from_slice(&w.to_le_bytes());
        }
        self.buffer.iter_mut().for_each(|w| *w = 0xFFFF);
        self.writes.push(self.config.page_align(address));
    }

    fn is_busy(&mut self) -> bool {
        if self.busy > 0 {
            if self.interrupts_masked() {
                self.masked_busy_polls += 1;
            }
            self.busy -= 1;
            true
        } else {
            false
        }
    }

    fn rww_enable(&mut self) {
        if self.busy > 0 {
            self.busy_violations += 1;
        }
        self.rww = true;
        self.rww_enables += 1;
    }

    fn read_near(&mut self, address: u16) -> u8 {
        self.check_rww(address as u32);
        self.memory[address as usize]
    }

    fn read_far(&mut self, address: u32) -> u8 {
        self.check_rww(address);
        self.memory[address as usize]
    }
}

/// Interrupt vector table location
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Vectors {
    Application,
    Boot,
}

/// Interrupt flag and vector select of a simulated core
#[derive(Clone, Debug)]
pub struct SimCpu {
    interrupts: Arc<AtomicBool>,
    critical_sections: usize,
    vectors: Vectors,
}

impl Default for SimCpu {
    fn default() -> Self {
        Self {
            interrupts: Arc::new(AtomicBool::new(false)),
            critical_sections: 0,
            vectors: Vectors::Application,
        }
    }
}

impl SimCpu {
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Number of times interrupts were disabled
    pub fn critical_sections(&self) -> usize {
        self.critical_sections
    }

    pub fn vectors(&self) -> Vectors {
        self.vectors
    }
}

impl Cpu for SimCpu {
    fn enable_interrupts(&mut self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&mut self) {
        self.critical_sections += 1;
        self.interrupts.store(false, Ordering::SeqCst);
    }

    fn boot_vectors(&mut self) {
        self.vectors = Vectors::Boot;
    }

    fn application_vectors(&mut self) {
        self.vectors = Vectors::Application;
    }

    fn jump_to_application(&mut self) -> ! {
        panic!("simulated core cannot run the application, use Bootloader::run");
    }
}

/// Configurable hooks recording how often they were called
#[derive(Clone, Debug)]
pub struct SimHooks {
    /// Value returned by the start hook
    pub start: bool,
    /// Stop after this many quiet poll windows
    pub idle_limit: Option<usize>,
    /// Value returned by the error hook
    pub continue_on_error: bool,
    /// Written by the help hook
    pub help_text: Vec<u8>,

    pub idles: usize,
    pub errors: usize,
    pub commands: usize,
    pub ended: bool,
}

impl Default for SimHooks {
    fn default() -> Self {
        Self {
            start: true,
            idle_limit: None,
            continue_on_error: true,
            help_text: Vec::new(),
            idles: 0,
            errors: 0,
            commands: 0,
            ended: false,
        }
    }
}

impl Hooks for SimHooks {
    fn start(&mut self) -> bool {
        self.start
    }

    fn end(&mut self) {
        self.ended = true;
    }

    fn idle(&mut self) -> bool {
        self.idles += 1;
        match self.idle_limit {
            Some(limit) => self.idles < limit,
            None => true,
        }
    }

    fn command(&mut self) {
        self.commands += 1;
    }

    fn help(&mut self, out: &mut dyn Transport) {
        out.write_all(&self.help_text);
    }

    fn error(&mut self) -> bool {
        self.errors += 1;
        self.continue_on_error
    }
}

/// Delay that returns immediately, for single threaded scripted runs
#[derive(Copy, Clone, Debug, Default)]
pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Delay backed by `std::thread::sleep`
#[derive(Copy, Clone, Debug, Default)]
pub struct StdDelay;

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Delay advancing a simulated millisecond clock.
///
/// Input scheduled with [`CountingDelay::at`] is delivered to the receive
/// pipe by the first delay call that reaches its time.
#[derive(Clone, Debug, Default)]
pub struct CountingDelay {
    rx: Pipe,
    schedule: Vec<(u32, Vec<u8>)>,

    /// Milliseconds elapsed
    pub now: u32,
    /// Argument of every delay call, in order
    pub calls: Vec<u32>,
}

impl CountingDelay {
    pub fn new(rx: Pipe) -> Self {
        Self {
            rx,
            ..Self::default()
        }
    }

    /// Deliver `data` once the clock reaches `at`
    pub fn at(mut self, at: u32, data: &[u8]) -> Self {
        self.schedule.push((at, data.to_vec()));
        self
    }
}

impl DelayMs<u32> for CountingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.now += ms;
        self.calls.push(ms);

        let (now, rx) = (self.now, &self.rx);
        self.schedule.retain(|(at, data)| {
            if *at <= now {
                rx.push(data);
                false
            } else {
                true
            }
        });
    }
}

/// Bootloader over a fully simulated device
pub type SimBootloader<D = NoDelay> = Bootloader<SimTransport, SimFlash, SimCpu, D, SimHooks>;

/// Bootloader fed from a prepared input script.
///
/// The first quiet poll window after the script is consumed ends the run.
/// Returns the bootloader, its input pipe and its output pipe.
pub fn scripted(config: DeviceConfig, input: &[u8]) -> (SimBootloader, Pipe, Pipe) {
    with_script(config, input, Pipe::default(), NoDelay)
}

/// Like [`scripted`], with a simulated clock delivering `later` input
/// at the given millisecond offsets
pub fn timed(
    config: DeviceConfig,
    input: &[u8],
    later: &[(u32, &[u8])],
) -> (SimBootloader<CountingDelay>, Pipe, Pipe) {
    let rx = Pipe::default();
    let delay = later
        .iter()
        .fold(CountingDelay::new(rx.clone()), |d, (at, data)| d.at(*at, data));

    with_script(config, input, rx, delay)
}

fn with_script<D: DelayMs<u32>>(
    config: DeviceConfig,
    input: &[u8],
    rx: Pipe,
    delay: D,
) -> (SimBootloader<D>, Pipe, Pipe) {
    let tx = Pipe::default();
    rx.push(input);

    let hooks = SimHooks {
        idle_limit: Some(1),
        ..SimHooks::default()
    };

    let b = simulated(config, SimTransport::new(rx.clone(), tx.clone()), delay, hooks);
    (b, rx, tx)
}

/// Bootloader over simulated flash and core with the given link end
pub fn simulated<D: DelayMs<u32>>(
    config: DeviceConfig,
    transport: SimTransport,
    delay: D,
    hooks: SimHooks,
) -> SimBootloader<D> {
    let cpu = SimCpu::default();
    let mut flash = SimFlash::new(config);
    flash.watch_interrupts(&cpu);

    match Bootloader::new(config, transport, flash, cpu, delay, hooks) {
        Ok(b) => b,
        Err(e) => panic!("invalid simulated device {}: {:?}", config.name, e),
    }
}

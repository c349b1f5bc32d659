//! Host programmer against a simulated device running on its own thread.

use std::convert::Infallible;
use std::thread::{self, JoinHandle};

use embedded_hal::serial;

use avr_uart_loader::device::{ATMEGA2561, ATMEGA328P};
use avr_uart_loader::sim::{self, SimHooks, SimSerial, StdDelay};
use avr_uart_loader::{DeviceConfig, Error, Options, Programmer, ResetCause, SerialPort, State};

struct Device {
    handle: JoinHandle<(ResetCause, Vec<u8>, SimHooks)>,
}

impl Device {
    fn spawn(config: DeviceConfig, hooks: SimHooks) -> (Self, SimSerial) {
        let (transport, host) = sim::link();

        let handle = thread::spawn(move || {
            let mut b = sim::simulated(config, transport, StdDelay, hooks);
            let cause = b.run();
            (cause, b.flash().memory().to_vec(), b.hooks().clone())
        });

        (Self { handle }, host)
    }

    fn join(self) -> (ResetCause, Vec<u8>, SimHooks) {
        self.handle.join().expect("device thread panicked")
    }
}

fn hooks() -> SimHooks {
    // Give up after ten seconds of silence so a broken test cannot hang
    SimHooks {
        idle_limit: Some(200),
        ..SimHooks::default()
    }
}

fn options() -> Options {
    Options {
        no_reset: true,
        response_timeout_ms: 1000,
        ..Options::default()
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 256) as u8).collect()
}

#[test]
fn image_round_trip() {
    let (device, serial) = Device::spawn(ATMEGA328P, hooks());
    let mut p = Programmer::new(serial, StdDelay, options());

    let info = p.init().unwrap();
    assert_eq!(info.page_size, 128);
    assert_eq!(info.boot_start, 0x7000);
    assert_eq!(p.state(), State::Connected);

    // Three full pages and a partial one
    let data = image(3 * 128 + 50);
    let mut done = 0;
    p.write_image(0x0400, &data, |n| done = n).unwrap();
    assert_eq!(done, data.len());

    p.verify_image(0x0400, &data, |_| ()).unwrap();
    assert_eq!(p.read_image(0x0400, data.len(), |_| ()).unwrap(), data);

    p.set_address(0x0480).unwrap();
    assert_eq!(p.get_address().unwrap(), 0x0480);

    p.exit().unwrap();
    assert_eq!(p.state(), State::Exited);

    let (cause, memory, hooks) = device.join();
    assert_eq!(cause, ResetCause::Exit);
    assert!(hooks.ended);
    assert_eq!(hooks.errors, 0);
    assert_eq!(&memory[0x0400..0x0400 + data.len()], &data[..]);
    // Padding of the last page
    assert!(memory[0x0400 + data.len()..0x0600].iter().all(|v| *v == 0xFF));
    assert!(memory[..0x0400].iter().all(|v| *v == 0xFF));
}

#[test]
fn far_pages_round_trip() {
    let (device, serial) = Device::spawn(ATMEGA2561, hooks());
    let mut p = Programmer::new(serial, StdDelay, options());
    p.init().unwrap();

    let data = image(2 * 256);
    p.write_image(0x2_0000, &data, |_| ()).unwrap();
    p.verify_image(0x2_0000, &data, |_| ()).unwrap();
    p.exit().unwrap();

    let (_, memory, _) = device.join();
    assert_eq!(&memory[0x2_0000..0x2_0200], &data[..]);
}

#[test]
fn verify_reports_first_difference() {
    let (device, serial) = Device::spawn(ATMEGA328P, hooks());
    let mut p = Programmer::new(serial, StdDelay, options());
    p.init().unwrap();

    let data = image(128);
    p.write_image(0, &data, |_| ()).unwrap();

    let mut other = data.clone();
    other[77] ^= 0xFF;
    assert_eq!(p.verify_image(0, &other, |_| ()), Err(Error::Verify(77)));

    p.exit().unwrap();
    device.join();
}

#[test]
fn help_text_comes_from_hook() {
    let hooks = SimHooks {
        help_text: b"robot board v2\r".to_vec(),
        ..hooks()
    };
    let (device, serial) = Device::spawn(ATMEGA328P, hooks);
    let mut p = Programmer::new(
        serial,
        StdDelay,
        Options {
            response_timeout_ms: 200,
            ..options()
        },
    );
    p.init().unwrap();

    assert_eq!(p.help().unwrap(), b"robot board v2\r");

    p.exit().unwrap();
    device.join();
}

/// Serial port losing one transmitted byte
struct Lossy {
    inner: SimSerial,
    drop_at: usize,
    written: usize,
}

impl serial::Read<u8> for Lossy {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Infallible> {
        serial::Read::read(&mut self.inner)
    }
}

impl serial::Write<u8> for Lossy {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Infallible> {
        self.written += 1;
        if self.written == self.drop_at {
            return Ok(());
        }
        serial::Write::write(&mut self.inner, word)
    }

    fn flush(&mut self) -> nb::Result<(), Infallible> {
        serial::Write::flush(&mut self.inner)
    }
}

impl SerialPort<Infallible> for Lossy {
    fn set_rts(&mut self, level: bool) -> Result<(), Infallible> {
        self.inner.set_rts(level)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Infallible> {
        self.inner.set_dtr(level)
    }
}

#[test]
fn lost_byte_is_retried() {
    let (device, serial) = Device::spawn(ATMEGA328P, hooks());

    // "?" + "info" + "setadr" + 3 + "write" puts the 20th byte inside the page data
    let lossy = Lossy {
        inner: serial,
        drop_at: 20,
        written: 0,
    };
    let mut p = Programmer::new(lossy, StdDelay, options());
    p.init().unwrap();

    let data = image(128);
    p.write_image(0x1000, &data, |_| ()).unwrap();
    p.verify_image(0x1000, &data, |_| ()).unwrap();
    p.exit().unwrap();

    let (_, memory, hooks) = device.join();
    assert_eq!(hooks.errors, 1);
    assert_eq!(&memory[0x1000..0x1080], &data[..]);
}

//! Page programmer: erase / fill / write of one flash page and the
//! page read back, both guarded by an additive checksum.

use embedded_hal::blocking::delay::DelayMs;

use crate::bootloader::{spm_wait, Bootloader, Step};
use crate::hal::{CriticalSection, Cpu, Flash, Hooks, Transport};
use crate::protocol::{CR, TAG_READ, TAG_WRITE};

/// 8 bit wrapping sum over transferred page bytes
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Checksum(u8);

impl Checksum {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn update(&mut self, data: u8) {
        self.0 = self.0.wrapping_add(data);
    }

    pub fn update_slice(&mut self, data: &[u8]) {
        for d in data {
            self.update(*d);
        }
    }

    /// Checksum of a complete buffer
    pub fn of(data: &[u8]) -> Self {
        let mut c = Self::new();
        c.update_slice(data);
        c
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl<T, F, C, D, H> Bootloader<T, F, C, D, H>
where
    T: Transport,
    F: Flash,
    C: Cpu,
    D: DelayMs<u32>,
    H: Hooks,
{
    /// Receive one page and program it at the address register.
    ///
    /// The page is erased before any data arrives. A timeout while
    /// receiving leaves it erased, no partial page is ever written.
    pub(crate) fn write_page(&mut self) -> Step {
        let page = self.address.get();
        debug!("Programming page {}", self.address);

        spm_wait(&mut self.flash);
        self.flash.page_erase(page);
        spm_wait(&mut self.flash);

        let mut sum = Checksum::new();
        let mut address = page;

        for _ in 0..self.config.page_size / 2 {
            let low = self.next_byte()?;
            let high = self.next_byte()?;
            sum.update(low);
            sum.update(high);

            // The fill sequence must not be interrupted, receive keeps
            // running in between words
            let _cs = CriticalSection::new(&mut self.cpu);
            spm_wait(&mut self.flash);
            self.flash.page_fill(address, u16::from_le_bytes([low, high]));

            address += 2;
        }

        {
            let _cs = CriticalSection::new(&mut self.cpu);
            self.flash.page_write(page);
        }
        spm_wait(&mut self.flash);

        self.flash.rww_enable();

        trace!("Page {} checksum 0x{:02x}", self.address, sum.value());
        self.transport.write_all(&[TAG_WRITE, sum.value(), CR]);

        Ok(())
    }

    /// Stream the page at the address register back to the host
    pub(crate) fn read_page(&mut self) {
        let page = self.address.get();
        debug!("Reading page {}", self.address);

        self.transport.write(TAG_READ);

        spm_wait(&mut self.flash);
        self.flash.rww_enable();

        let far = self.config.is_far();
        let mut sum = Checksum::new();

        for address in page..page + self.config.page_size as u32 {
            let data = if far {
                self.flash.read_far(address)
            } else {
                self.flash.read_near(address as u16)
            };

            sum.update(data);
            self.transport.write(data);
        }

        self.transport.write_all(&[sum.value(), CR]);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::device::{ATMEGA2561, ATMEGA328P, ATMEGA64};
    use crate::sim;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn write_cmd(address: [u8; 3], data: &[u8]) -> Vec<u8> {
        let mut cmd = b"setadr".to_vec();
        cmd.extend_from_slice(&address);
        cmd.extend_from_slice(b"write");
        cmd.extend_from_slice(data);
        cmd
    }

    #[test]
    fn checksum_wraps() {
        assert_eq!(Checksum::of(&[0xFF, 0x02]).value(), 0x01);
        assert_eq!(Checksum::of(&[]).value(), 0x00);
        assert_eq!(Checksum::of(&[0x80; 4]).value(), 0x00);
    }

    #[test]
    fn write_page_programs_flash() {
        let data = pattern(256, 3);
        let (mut b, _rx, tx) = sim::scripted(ATMEGA64, &write_cmd([0x00, 0x04, 0x00], &data));
        b.run();

        let sum = Checksum::of(&data).value();
        let mut expected = b"A\x00\x04\x00\r".to_vec();
        expected.extend_from_slice(&[b'W', sum, 0x0D]);
        assert_eq!(tx.drain(), expected);

        let f = b.flash();
        assert_eq!(f.page(0x0400), &data[..]);
        assert_eq!(f.erases, vec![0x0400]);
        assert_eq!(f.writes, vec![0x0400]);
        assert_eq!(f.busy_violations, 0);
        assert_eq!(f.unguarded_fills, 0);
        // Neighbouring pages untouched
        assert!(f.page(0x0300).iter().all(|v| *v == 0xFF));
        assert!(f.page(0x0500).iter().all(|v| *v == 0xFF));
    }

    #[test]
    fn interrupts_return_after_each_fill() {
        let data = pattern(128, 9);
        let (mut b, _rx, _tx) = sim::scripted(ATMEGA328P, &write_cmd([0, 0, 0], &data));
        b.run();

        // One per word, one for the page write and one for the reset sequence,
        // plus the startup disable
        assert_eq!(b.cpu().critical_sections(), 64 + 1 + 1 + 1);
        assert_eq!(b.flash().unguarded_fills, 0);
        // The page write busy wait runs with interrupts enabled
        assert_eq!(b.flash().masked_busy_polls, 0);
    }

    #[test]
    fn read_page_streams_flash() {
        let data = pattern(128, 42);
        let (mut b, _rx, tx) = sim::scripted(ATMEGA328P, b"setadr\x00\x01\x00read");
        b.flash.load(0x0100, &data);
        b.run();

        let out = tx.drain();
        assert_eq!(&out[..5], b"A\x00\x01\x00\r");
        assert_eq!(out[5], b'R');
        assert_eq!(&out[6..6 + 128], &data[..]);
        assert_eq!(out[6 + 128], Checksum::of(&data).value());
        assert_eq!(out[6 + 129], 0x0D);
        assert_eq!(out.len(), 6 + 130);
        assert_eq!(b.flash().rww_violations, 0);
    }

    #[test]
    fn read_page_reaches_far_flash() {
        let data = pattern(256, 1);
        let (mut b, _rx, tx) = sim::scripted(ATMEGA2561, b"setadr\x00\x00\x03read");
        b.flash.load(0x30000, &data);
        b.run();

        let out = tx.drain();
        assert_eq!(&out[6..6 + 256], &data[..]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let data = pattern(256, 77);
        let mut script = write_cmd([0x00, 0x20, 0x00], &data);
        script.extend_from_slice(b"read");
        let (mut b, _rx, tx) = sim::scripted(ATMEGA64, &script);
        b.run();

        let out = tx.drain();
        let sum = Checksum::of(&data).value();
        // A reply, W reply, then R + page + sum + CR
        assert_eq!(&out[5..8], &[b'W', sum, 0x0D]);
        assert_eq!(out[8], b'R');
        assert_eq!(&out[9..9 + 256], &data[..]);
        assert_eq!(out[9 + 256], sum);
    }

    #[test]
    fn timeout_mid_page_leaves_page_erased() {
        let (mut b, _rx, tx) = sim::scripted(ATMEGA64, &write_cmd([0, 0x01, 0], &[0x55; 100]));
        b.flash.load(0x0100, &[0x00; 256]);
        b.run();

        let mut expected = b"A\x00\x01\x00\r".to_vec();
        expected.extend_from_slice(b"error\r");
        assert_eq!(tx.drain(), expected);

        let f = b.flash();
        assert_eq!(f.erases, vec![0x0100]);
        assert!(f.writes.is_empty());
        assert!(f.page(0x0100).iter().all(|v| *v == 0xFF));
    }

    #[test]
    fn garbled_write_word_leaves_flash_alone() {
        let (mut b, _rx, tx) = sim::scripted(ATMEGA64, b"wrote\x01\x02");
        b.flash.load(0, &[0x12; 256]);
        b.run();

        assert_eq!(tx.drain(), b"error\r");
        assert_eq!(b.address().get(), 0);
        assert!(b.flash().erases.is_empty());
        assert!(b.flash().page(0).iter().all(|v| *v == 0x12));
    }
}

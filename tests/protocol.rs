//! Wire level behaviour of the device-side bootloader, driven by scripts.

use avr_uart_loader::device::{ATMEGA2561, ATMEGA328P, ATMEGA64};
use avr_uart_loader::sim::{self, Vectors};
use avr_uart_loader::{Checksum, DeviceConfig, ResetCause};

fn set_address(address: u32) -> Vec<u8> {
    let mut cmd = b"setadr".to_vec();
    cmd.extend_from_slice(&address.to_le_bytes()[..3]);
    cmd
}

fn address_reply(address: u32) -> Vec<u8> {
    let mut r = vec![b'A'];
    r.extend_from_slice(&address.to_le_bytes()[..3]);
    r.push(0x0D);
    r
}

fn page_data(config: &DeviceConfig, seed: u8) -> Vec<u8> {
    (0..config.page_size as usize)
        .map(|i| (i as u8) ^ seed.rotate_left(i as u32 % 8))
        .collect()
}

#[test]
fn set_then_get_address_returns_page_aligned_value() {
    for config in [ATMEGA328P, ATMEGA64, ATMEGA2561].iter() {
        let step = config.boot_start / 37 + 1;

        for address in (0..config.boot_start).step_by(step as usize) {
            let mut script = set_address(address);
            script.extend_from_slice(b"adrget");

            let (mut b, _rx, tx) = sim::scripted(*config, &script);
            b.run();

            let aligned = config.page_align(address);
            let mut expected = address_reply(aligned);
            expected.extend_from_slice(&address_reply(aligned));

            assert_eq!(tx.drain(), expected, "{} at 0x{:05x}", config.name, address);
            assert_eq!(b.address().get(), aligned);
        }
    }
}

#[test]
fn boot_section_addresses_are_refused() {
    for config in [ATMEGA328P, ATMEGA64, ATMEGA2561].iter() {
        let valid = config.boot_start - config.page_size as u32;
        let wire_max = if config.is_far() { 0xFF_FFFF } else { 0xFFFF };

        for address in [config.boot_start, config.boot_start + 1, config.flash_end, wire_max].iter() {
            let mut script = set_address(valid);
            script.extend_from_slice(&set_address(*address));

            let (mut b, _rx, tx) = sim::scripted(*config, &script);
            b.run();

            let mut expected = address_reply(valid);
            expected.extend_from_slice(b"error\r");
            assert_eq!(tx.drain(), expected, "{} at 0x{:05x}", config.name, address);
            assert_eq!(b.address().get(), valid);
        }
    }
}

#[test]
fn written_page_reads_back_identically() {
    for config in [ATMEGA328P, ATMEGA2561].iter() {
        let address = config.boot_start / 2;
        let data = page_data(config, 0xA5);
        let sum = Checksum::of(&data).value();

        // Write the same page twice, then read it
        let mut script = set_address(address);
        for _ in 0..2 {
            script.extend_from_slice(b"write");
            script.extend_from_slice(&data);
        }
        script.extend_from_slice(b"read");

        let (mut b, _rx, tx) = sim::scripted(*config, &script);
        assert_eq!(b.run(), ResetCause::Idle);

        let mut expected = address_reply(config.page_align(address));
        expected.extend_from_slice(&[b'W', sum, 0x0D, b'W', sum, 0x0D, b'R']);
        expected.extend_from_slice(&data);
        expected.extend_from_slice(&[sum, 0x0D]);
        assert_eq!(tx.drain(), expected);

        let f = b.flash();
        assert_eq!(f.page(config.page_align(address)), &data[..]);
        assert_eq!(f.busy_violations, 0);
        assert_eq!(f.unguarded_fills, 0);
        assert_eq!(f.rww_violations, 0);
    }
}

#[test]
fn checksum_ignores_word_byte_order() {
    let data = page_data(&ATMEGA64, 0x3C);
    let swapped: Vec<u8> = data.chunks(2).flat_map(|w| vec![w[1], w[0]]).collect();

    assert_eq!(Checksum::of(&data), Checksum::of(&swapped));
    assert_eq!(
        Checksum::of(&data).value(),
        data.iter().map(|v| *v as u32).sum::<u32>() as u8
    );
}

#[test]
fn misspelt_write_changes_nothing() {
    let mut script = set_address(0x0200);
    script.extend_from_slice(b"wro");
    script.extend_from_slice(&[0x00; 64]);

    let (mut b, _rx, tx) = sim::scripted(ATMEGA64, &script);
    b.flash_mut().load(0x0200, &[0x42; 256]);
    b.run();

    let mut expected = address_reply(0x0200);
    expected.extend_from_slice(b"error\r");
    assert_eq!(tx.drain(), expected);

    assert_eq!(b.address().get(), 0x0200);
    assert!(b.flash().erases.is_empty());
    assert!(b.flash().page(0x0200).iter().all(|v| *v == 0x42));
}

#[test]
fn quiet_link_with_refusing_idle_hook_leaves_bootloader() {
    let (mut b, _rx, tx) = sim::scripted(ATMEGA64, b"");

    assert_eq!(b.run(), ResetCause::Idle);
    assert!(tx.is_empty());
    assert_eq!(b.cpu().vectors(), Vectors::Application);
    assert!(b.hooks().ended);
}

#[test]
fn whoami_is_exactly_three_bytes() {
    let (mut b, _rx, tx) = sim::scripted(ATMEGA2561, b"?");
    b.run();

    assert_eq!(tx.drain(), vec![b'F', b'4', 0x0D]);
}

use super::{Gu956, LcdLines, LcdPort};
use crate::bus::Bus;
use std::cell::RefCell;
use std::rc::Rc;

const BYTE: u32 = 0xFF;

#[derive(Clone, Default)]
struct CaptureLcd(Rc<RefCell<Vec<LcdLines>>>);

impl LcdPort for CaptureLcd {
    fn control(&mut self, lines: LcdLines) {
        self.0.borrow_mut().push(lines);
    }
}

#[test]
fn network_registers_should_be_stored_and_echoed() {

    // Unimplemented semantics: the network controller's registers are only
    // stored; nothing is sent on the network.
    let mut board = Gu956::new();

    board.write(0, 0x12, BYTE);
    board.write(1, 0xAB, BYTE);
    board.write(0, 0x34, BYTE);
    board.write(1, 0xCD, BYTE);

    assert_eq!(board.read(0, BYTE), 0x34);
    assert_eq!(board.read(1, BYTE), 0xCD);
    board.write(0, 0x12, BYTE);
    assert_eq!(board.read(1, BYTE), 0xAB);
    assert_eq!(board.network_register(0x34), 0xCD);
    assert_eq!(board.read(2, BYTE), 0xFF);
}

#[test]
fn reset_should_clear_network_registers_but_keep_switches() {

    let mut board = Gu956::new();
    board.set_dip_switches(0xEF);
    board.write(0, 0x05, BYTE);
    board.write(1, 0x77, BYTE);

    board.reset();

    assert_eq!(board.network_register(0x05), 0);
    assert_eq!(board.read(0, BYTE), 0);
    assert_eq!(board.port_read(7), 0xEF);
}

#[test]
fn status_ports_should_read_all_ones_and_others_zero() {

    let mut board = Gu956::new();

    assert_eq!(board.port_read(4), 0xFF);
    assert_eq!(board.port_read(9), 0xFF);
    assert_eq!(board.port_read(11), 0xFF);
    assert_eq!(board.port_read(7), 0xFF);
    assert_eq!(board.port_read(6), 0);
    assert_eq!(board.port_read(8), 0);
}

#[test]
fn port_10_should_drive_the_lcd_control_lines() {

    let mut board = Gu956::new();
    let lcd = CaptureLcd::default();
    board.attach_lcd(Box::new(lcd.clone()));

    board.port_write(10, 0xF5);
    board.port_write(6, 0x03);

    assert_eq!(board.lcd_lines(), LcdLines::RS | LcdLines::E);
    assert_eq!(*lcd.0.borrow(), vec![LcdLines::RS | LcdLines::E]);
    assert_eq!(board.port_latch(10), Some(0xF5));
    assert_eq!(board.port_latch(6), Some(0x03));
}

#[test]
fn writes_to_missing_ports_should_be_ignored() {

    let mut board = Gu956::new();

    board.port_write(12, 0x01);

    assert_eq!(board.port_latch(12), None);
}

use super::psx_sio0::{PsxSio0, Sio0Control, Sio0Status};
use super::psx_sio1::{PsxSio1, Sio1Control, Sio1Status};
use super::{prescaler, SerialPort, SyncPeripheral};
use crate::bus::Bus;
use crate::sinks::capture::CaptureLine;
use crate::timer::scheduler::Scheduler;
use crate::timer::{Time, Timed};
use std::cell::RefCell;
use std::rc::Rc;

const DATA: u32 = 0;
const STATUS: u32 = 1;
const MODE_CONTROL: u32 = 2;
const BAUD: u32 = 3;

/// A controller stand-in that answers every byte with a fixed reply.
#[derive(Clone, Default)]
struct EchoPad {
    received: Rc<RefCell<Vec<u8>>>,
    selects: Rc<RefCell<Vec<bool>>>,
    reply: u8,
}

impl SyncPeripheral for EchoPad {
    fn exchange(&mut self, byte: u8) -> u8 {
        self.received.borrow_mut().push(byte);
        self.reply
    }

    fn select(&mut self, selected: bool) {
        self.selects.borrow_mut().push(selected);
    }
}

fn write_mode(bus: &mut dyn Bus, mode: u16) {
    bus.write(MODE_CONTROL, mode as u32, 0x0000FFFF);
}

fn write_control(bus: &mut dyn Bus, control: u16) {
    bus.write(MODE_CONTROL, (control as u32) << 16, 0xFFFF0000);
}

fn write_baud(bus: &mut dyn Bus, baud: u16) {
    bus.write(BAUD, (baud as u32) << 16, 0xFFFF0000);
}

fn sio0_with_pad(reply: u8) -> (Scheduler, PsxSio0, EchoPad) {
    let scheduler = Scheduler::new();
    let mut sio = PsxSio0::new(scheduler.clock());
    let pad = EchoPad { reply, ..EchoPad::default() };
    sio.attach_peripheral(Box::new(pad.clone()));
    write_mode(&mut sio, 1);
    write_baud(&mut sio, 0x88);
    (scheduler, sio, pad)
}

#[test]
fn prescaler_should_stop_the_clock_for_mode_zero() {

    assert_eq!(prescaler(0), 0);
    assert_eq!(prescaler(1), 1);
    assert_eq!(prescaler(2), 16);
    assert_eq!(prescaler(0x4F), 64);
}

#[test]
fn sio0_transfer_should_shift_in_the_peripheral_reply() {

    // Given a port with a pad that answers 0x41.
    let (mut scheduler, mut sio, pad) = sio0_with_pad(0x41);
    write_control(&mut sio, (Sio0Control::TX_ENA | Sio0Control::RX_IENA | Sio0Control::DTR).bits());

    sio.write(DATA, 0x01, 0xFF);
    assert!(!sio.status().contains(Sio0Status::TX_EMPTY));
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    assert_eq!(*pad.received.borrow(), vec![0x01]);
    assert!(sio.status().contains(Sio0Status::RX_RDY | Sio0Status::TX_EMPTY));
    assert!(sio.irq());
    assert_eq!(sio.read(DATA, 0xFF), 0x41);
    assert!(!sio.status().contains(Sio0Status::RX_RDY));

    // The last bit of 0x01 is a zero.
    assert!(!sio.txd());
    assert_eq!(sio.next_deadline(), None);
}

#[test]
fn sio0_transfer_should_read_ones_without_a_peripheral() {

    let mut scheduler = Scheduler::new();
    let mut sio = PsxSio0::new(scheduler.clock());
    write_mode(&mut sio, 1);
    write_baud(&mut sio, 0x88);
    write_control(&mut sio, Sio0Control::TX_ENA.bits());

    sio.write(DATA, 0x55, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    assert_eq!(sio.read(DATA, 0xFF), 0xFF);
    assert!(!sio.irq());
}

#[test]
fn sio0_with_prescaler_zero_should_not_arm_the_clock() {

    let (_scheduler, mut sio, _pad) = sio0_with_pad(0x00);
    write_mode(&mut sio, 0);
    write_control(&mut sio, Sio0Control::TX_ENA.bits());

    sio.write(DATA, 0x01, 0xFF);

    assert_eq!(sio.next_deadline(), None);
}

#[test]
fn sio0_second_byte_without_read_should_overrun() {

    // Given a completed transfer that nobody has read.
    let (mut scheduler, mut sio, _pad) = sio0_with_pad(0x12);
    write_control(&mut sio, Sio0Control::TX_ENA.bits());
    sio.write(DATA, 0x01, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    sio.write(DATA, 0x02, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    assert!(sio.status().contains(Sio0Status::OVERRUN));
    assert_eq!(sio.read(DATA, 0xFF), 0x12);
}

#[test]
fn sio0_interrupt_acknowledge_should_clear_irq() {

    let (mut scheduler, mut sio, _pad) = sio0_with_pad(0x00);
    write_control(&mut sio, (Sio0Control::TX_ENA | Sio0Control::RX_IENA).bits());
    sio.write(DATA, 0x01, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);
    assert!(sio.irq());

    write_control(&mut sio, (Sio0Control::TX_ENA | Sio0Control::IACK).bits());

    assert!(!sio.irq());
    assert!(!sio.status().contains(Sio0Status::IRQ));
    assert_eq!(sio.read(MODE_CONTROL, 0xFFFF0000) >> 16, Sio0Control::TX_ENA.bits() as u32);
}

#[test]
fn sio0_reset_should_pulse_dtr_and_restore_status() {

    let (_scheduler, mut sio, pad) = sio0_with_pad(0x00);

    write_control(&mut sio, Sio0Control::RESET.bits());

    assert_eq!(*pad.selects.borrow(), vec![true, false, false]);
    assert_eq!(sio.read(STATUS, 0xFFFFFFFF), (Sio0Status::TX_EMPTY | Sio0Status::TX_RDY).bits());
    assert!(sio.txd());
}

#[test]
fn sio0_dsr_should_interrupt_on_rising_edge_only() {

    let (_scheduler, mut sio, _pad) = sio0_with_pad(0x00);
    write_control(&mut sio, Sio0Control::DSR_IENA.bits());

    sio.set_dsr(true);
    assert!(sio.irq());
    assert!(sio.status().contains(Sio0Status::DSR));

    write_control(&mut sio, (Sio0Control::DSR_IENA | Sio0Control::IACK).bits());
    sio.set_dsr(true);
    assert!(!sio.irq());

    sio.set_dsr(false);
    assert!(!sio.status().contains(Sio0Status::DSR));
}

fn sio1_with_line() -> (Scheduler, PsxSio1, CaptureLine) {
    let scheduler = Scheduler::new();
    let mut sio = PsxSio1::new(scheduler.clock());
    let line = CaptureLine::default();
    sio.attach_line(Box::new(line.clone()));

    // x1 divider, 8 data bits, no parity, one stop bit.
    write_mode(&mut sio, 0x4D);
    write_baud(&mut sio, 0x10);
    (scheduler, sio, line)
}

#[test]
fn sio1_transmitted_byte_should_reach_the_line() {

    let (mut scheduler, mut sio, line) = sio1_with_line();
    write_control(&mut sio, Sio1Control::TX_ENA.bits());

    sio.write(DATA, 0x5A, 0xFF);
    assert!(!sio.status().contains(Sio1Status::TX_RDY));
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    assert_eq!(line.bytes(), vec![0x5A]);
    assert!(sio.status().contains(Sio1Status::TX_RDY | Sio1Status::TX_EMPTY));
}

#[test]
fn sio1_transmit_empty_should_interrupt_when_enabled() {

    let (mut scheduler, mut sio, line) = sio1_with_line();
    write_control(&mut sio, (Sio1Control::TX_ENA | Sio1Control::TX_IENA).bits());

    sio.write(DATA, 0x01, 0xFF);
    sio.write(DATA, 0x02, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    // The second write replaced the first before the shifter loaded it.
    assert_eq!(line.bytes(), vec![0x02]);
    assert!(sio.irq());
}

#[test]
fn sio1_should_not_transmit_without_cts() {

    let (mut scheduler, mut sio, line) = sio1_with_line();
    write_control(&mut sio, Sio1Control::TX_ENA.bits());
    sio.set_cts(false);

    sio.write(DATA, 0x5A, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    assert!(line.bytes().is_empty());
    assert!(sio.status().contains(Sio1Status::TX_RDY));
}

#[test]
fn sio1_should_not_transmit_without_tx_enable() {

    let (mut scheduler, mut sio, line) = sio1_with_line();

    sio.write(DATA, 0x5A, 0xFF);
    scheduler.run_for(Time::from_micros(100), &mut [&mut sio]);

    assert!(line.bytes().is_empty());
}

#[test]
fn sio1_receive_should_interrupt_at_fifo_threshold() {

    // Given an interrupt after two bytes.
    let (_scheduler, mut sio, _line) = sio1_with_line();
    write_control(&mut sio, (Sio1Control::RX_ENA | Sio1Control::RX_IENA).bits() | 0x100);

    sio.receive_byte(0x11);
    assert!(!sio.irq());
    sio.receive_byte(0x22);
    assert!(sio.irq());

    assert_eq!(sio.read(DATA, 0xFF), 0x11);
    assert!(sio.status().contains(Sio1Status::RX_RDY));
    assert_eq!(sio.read(DATA, 0xFF), 0x22);
    assert!(!sio.status().contains(Sio1Status::RX_RDY));
}

#[test]
fn sio1_receive_should_ignore_bytes_when_disabled() {

    let (_scheduler, mut sio, _line) = sio1_with_line();

    sio.receive_byte(0x11);

    assert!(!sio.status().contains(Sio1Status::RX_RDY));
    assert_eq!(sio.read(DATA, 0xFF), 0);
}

#[test]
fn sio1_full_fifo_should_overrun_and_replace_newest_byte() {

    let (_scheduler, mut sio, _line) = sio1_with_line();
    write_control(&mut sio, Sio1Control::RX_ENA.bits());

    for byte in 0..9 {
        sio.receive_byte(byte);
    }

    assert!(sio.status().contains(Sio1Status::OVERRUN));
    let drained: Vec<u32> = (0..8).map(|_| sio.read(DATA, 0xFF)).collect();
    assert_eq!(drained, vec![0, 1, 2, 3, 4, 5, 6, 8]);
}

#[test]
fn sio1_interrupt_acknowledge_should_clear_error_bits() {

    let (_scheduler, mut sio, _line) = sio1_with_line();
    write_control(&mut sio, (Sio1Control::RX_ENA | Sio1Control::RX_IENA).bits());
    for byte in 0..9 {
        sio.receive_byte(byte);
    }
    assert!(sio.irq());

    write_control(&mut sio, (Sio1Control::RX_ENA | Sio1Control::IACK).bits());

    assert!(!sio.irq());
    assert!(!sio.status().intersects(Sio1Status::OVERRUN | Sio1Status::IRQ));
    assert!(sio.status().contains(Sio1Status::RX_RDY));
}

#[test]
fn sio1_disabling_receive_should_flush_the_fifo() {

    let (_scheduler, mut sio, _line) = sio1_with_line();
    write_control(&mut sio, Sio1Control::RX_ENA.bits());
    sio.receive_byte(0x11);
    sio.receive_byte(0x22);

    write_control(&mut sio, 0);

    assert!(!sio.status().contains(Sio1Status::RX_RDY));
    write_control(&mut sio, Sio1Control::RX_ENA.bits());
    assert_eq!(sio.read(DATA, 0xFF), 0);
}

#[test]
fn sio1_reset_should_keep_only_modem_inputs() {

    let (_scheduler, mut sio, _line) = sio1_with_line();
    write_control(&mut sio, (Sio1Control::RX_ENA | Sio1Control::RTS | Sio1Control::DTR).bits());
    assert!(sio.rts());
    assert!(sio.dtr());
    sio.receive_byte(0x11);

    write_control(&mut sio, Sio1Control::RESET.bits());

    assert_eq!(sio.status(), Sio1Status::CTS | Sio1Status::DSR);
    assert_eq!(sio.read(MODE_CONTROL, 0xFFFFFFFF), 0);
    assert_eq!(sio.read(BAUD, 0xFFFF0000), 0);
    assert!(!sio.rts());
    assert_eq!(sio.next_deadline(), None);
}

#[test]
fn sio1_dsr_should_interrupt_when_enabled() {

    let (_scheduler, mut sio, _line) = sio1_with_line();
    write_control(&mut sio, Sio1Control::DSR_IENA.bits());

    sio.set_dsr(false);
    assert!(!sio.irq());
    sio.set_dsr(true);
    assert!(sio.irq());
}

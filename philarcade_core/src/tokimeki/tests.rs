use super::TokimekiDevice;
use crate::sinks::capture::CaptureLine;
use crate::timer::scheduler::Scheduler;
use crate::timer::Time;

fn device() -> (Scheduler, TokimekiDevice, CaptureLine) {
    let scheduler = Scheduler::new();
    let mut device = TokimekiDevice::new(scheduler.clock());
    let line = CaptureLine::default();
    device.attach_line(Box::new(line.clone()));
    (scheduler, device, line)
}

fn send(device: &mut TokimekiDevice, text: &[u8]) {
    for byte in text {
        device.receive_byte(*byte);
    }
}

#[test]
fn startup_command_should_answer_en() {

    let (mut scheduler, mut device, line) = device();

    send(&mut device, b"S\n");
    scheduler.run_for(Time::from_micros(100_000), &mut [&mut device]);

    assert_eq!(line.bytes(), b"EN\n".to_vec());
}

#[test]
fn twelve_character_command_should_be_echoed() {

    let (mut scheduler, mut device, line) = device();

    send(&mut device, b"ABCDEFGHIJKL\n");
    scheduler.run_for(Time::from_micros(100_000), &mut [&mut device]);

    assert_eq!(line.bytes(), b"ABCDEFGHIJKL\n".to_vec());
}

#[test]
fn other_commands_should_be_ignored() {

    let (mut scheduler, mut device, line) = device();

    send(&mut device, b"HELLO\n");
    scheduler.run_for(Time::from_micros(100_000), &mut [&mut device]);

    assert!(line.bytes().is_empty());
}

#[test]
fn nul_byte_should_discard_partial_line() {

    let (mut scheduler, mut device, line) = device();

    send(&mut device, b"XX\0S\n");
    scheduler.run_for(Time::from_micros(100_000), &mut [&mut device]);

    assert_eq!(line.bytes(), b"EN\n".to_vec());
}

#[test]
fn overlong_line_should_be_capped_and_ignored() {

    let (mut scheduler, mut device, line) = device();

    // Given a line far longer than any command.
    send(&mut device, &[b'A'; 100_000]);
    assert!(device.message.len() <= super::MAX_MESSAGE_LENGTH);
    send(&mut device, b"\n");
    scheduler.run_for(Time::from_micros(100_000), &mut [&mut device]);
    assert!(line.bytes().is_empty());

    send(&mut device, b"S\n");
    scheduler.run_for(Time::from_micros(100_000), &mut [&mut device]);
    assert_eq!(line.bytes(), b"EN\n".to_vec());
}

#[test]
fn response_should_not_arrive_before_one_bit_time() {

    let (mut scheduler, mut device, line) = device();

    send(&mut device, b"S\n");
    scheduler.run_for(Time::from_micros(50), &mut [&mut device]);

    assert!(line.bytes().is_empty());
}

use super::card_unit::{CardSlotState, K573CardUnit, CARD_DATA_BYTES, KEYPAD_CARD_TOGGLE};
use super::k573_acio::{K573AcioHost, SyncState, BAUD_RATE};
use super::{checksum, decode_length, encode_length, AcioNode, GenericNode, NodeInfo};
use crate::sinks::capture::CaptureLine;
use crate::timer::scheduler::Scheduler;
use crate::timer::Time;

const SYNC_1: [u8; 4] = [0xAA, 0xAA, 0xAA, 0x55];
const SYNC_2: [u8; 4] = [0xAA, 0xAA, 0x00, 0x00];

/// Builds a request packet with a correct checksum.
fn packet(command: u8, node_id: u8, subcmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0xAA, command, node_id, subcmd, encode_length(payload.len())];
    if payload.is_empty() {
        bytes[4] = 0;
    }
    bytes.extend_from_slice(payload);
    let sum = checksum(&bytes[1..]);
    bytes.push(sum);
    bytes
}

fn feed(host: &mut K573AcioHost, bytes: &[u8]) {
    for byte in bytes {
        host.receive_byte(*byte);
    }
}

fn drain(scheduler: &mut Scheduler, host: &mut K573AcioHost) {
    scheduler.run_for(Time::from_micros(20_000), &mut [host]);
}

fn synced_host() -> (Scheduler, K573AcioHost, CaptureLine) {
    let mut scheduler = Scheduler::new();
    let mut host = K573AcioHost::new(scheduler.clock());
    let line = CaptureLine::default();
    host.attach_line(Box::new(line.clone()));
    feed(&mut host, &SYNC_1);
    feed(&mut host, &SYNC_2);
    drain(&mut scheduler, &mut host);
    line.0.borrow_mut().clear();
    (scheduler, host, line)
}

#[test]
fn length_code_should_decode_documented_values() {

    assert_eq!(decode_length(0x00), 0);
    assert_eq!(decode_length(0x01), 1);
    assert_eq!(decode_length(0x05), 16);
    assert_eq!(decode_length(0x08), 128);
    assert_eq!(decode_length(0x11), 0x10001);
}

#[test]
fn length_code_should_round_trip_for_one_and_large_powers_of_two() {

    for size in [1, 16, 32, 64, 128, 256, 512, 1024, 2048] {
        assert_eq!(decode_length(encode_length(size)), size, "size {}", size);
    }
}

#[test]
fn length_code_should_keep_hardware_asymmetry_for_other_sizes() {

    // The partial flag lands in the shifted nibble, so these do not round trip.
    assert_eq!(encode_length(7), 0x11);
    assert_eq!(encode_length(22), 0x15);
    assert_eq!(encode_length(129), 0x18);
    assert_ne!(decode_length(encode_length(7)), 7);
}

#[test]
fn oversized_length_code_should_not_overflow() {

    assert_eq!(decode_length(0xFF), usize::MAX / 2);
}

#[test]
fn checksum_should_be_low_byte_of_sum() {

    assert_eq!(checksum(&[0xAA, 0x00, 0x01, 0x00]), 0xAB);
    assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
}

#[test]
fn host_should_echo_sync_sequences_and_become_ready() {

    // Given a fresh host.
    let mut scheduler = Scheduler::new();
    let mut host = K573AcioHost::new(scheduler.clock());
    let line = CaptureLine::default();
    host.attach_line(Box::new(line.clone()));

    feed(&mut host, &SYNC_1);
    drain(&mut scheduler, &mut host);

    assert_eq!(line.bytes(), SYNC_1.to_vec());
    assert_eq!(host.sync_state(), SyncState::Sync1);

    feed(&mut host, &SYNC_2);
    drain(&mut scheduler, &mut host);

    assert_eq!(line.bytes()[4..], SYNC_2);
    assert_eq!(host.sync_state(), SyncState::Ready);
}

#[test]
fn second_sync_should_be_ignored_before_first() {

    let mut scheduler = Scheduler::new();
    let mut host = K573AcioHost::new(scheduler.clock());
    let line = CaptureLine::default();
    host.attach_line(Box::new(line.clone()));

    feed(&mut host, &SYNC_2);
    drain(&mut scheduler, &mut host);

    assert!(line.bytes().is_empty());
    assert_eq!(host.sync_state(), SyncState::Unsynced);
}

#[test]
fn leading_garbage_should_be_discarded() {

    let mut scheduler = Scheduler::new();
    let mut host = K573AcioHost::new(scheduler.clock());
    let line = CaptureLine::default();
    host.attach_line(Box::new(line.clone()));

    feed(&mut host, &[0x12, 0x00, 0x55]);
    feed(&mut host, &SYNC_1);
    drain(&mut scheduler, &mut host);

    assert_eq!(line.bytes(), SYNC_1.to_vec());
}

#[test]
fn node_count_request_should_report_zero_nodes() {

    // Given a synced host with nothing attached.
    let (mut scheduler, mut host, line) = synced_host();

    feed(&mut host, &packet(0xAA, 0x00, 0x01, &[]));
    drain(&mut scheduler, &mut host);

    assert_eq!(line.bytes(), vec![0xAA, 0xAA, 0x00, 0x01, 0x01, 0x00, 0xAC]);
}

#[test]
fn node_count_request_should_count_attached_nodes() {

    let (mut scheduler, mut host, line) = synced_host();
    assert_eq!(host.add_node(Box::new(K573CardUnit::new())), Some(1));
    assert_eq!(host.add_node(Box::new(GenericNode::new(NodeInfo::new(1, 1, 0, "GEN")))), Some(2));

    feed(&mut host, &packet(0xAA, 0x00, 0x01, &[]));
    drain(&mut scheduler, &mut host);

    let bytes = line.bytes();
    assert_eq!(bytes[5], 2);
    assert_eq!(bytes[6], checksum(&bytes[1..6]));
}

#[test]
fn add_node_should_refuse_nodes_past_the_last_id() {

    let (_scheduler, mut host, _line) = synced_host();

    // Given a chain with every node id taken.
    for expected in 1..=255u8 {
        assert_eq!(host.add_node(Box::new(GenericNode::new(NodeInfo::new(1, 1, 0, "GEN")))), Some(expected));
    }

    assert_eq!(host.add_node(Box::new(K573CardUnit::new())), None);
    assert_eq!(host.node_count(), 255);
}

#[test]
fn version_request_should_echo_request_and_describe_node() {

    let (mut scheduler, mut host, line) = synced_host();
    host.add_node(Box::new(K573CardUnit::new()));
    let request = packet(0xAA, 0x01, 0x02, &[]);

    feed(&mut host, &request);
    drain(&mut scheduler, &mut host);

    let bytes = line.bytes();
    assert_eq!(bytes[..4], [0xAA, 0xAA, 0x01, 0x02]);
    assert_eq!(bytes[4], 0x15);
    assert_eq!(bytes[5..11], request[..]);
    assert_eq!(bytes[11..15], [3, 0, 0, 0]);
    assert_eq!(bytes[15..19], [0, 1, 6, 0]);
    assert_eq!(bytes[19..27], *b"ICCA\0\0\0\0");
    assert_eq!(bytes.len(), 28);
    assert_eq!(bytes[27], checksum(&bytes[1..27]));
}

#[test]
fn version_request_for_missing_node_should_return_zeros() {

    let (mut scheduler, mut host, line) = synced_host();

    feed(&mut host, &packet(0xAA, 0x05, 0x02, &[]));
    drain(&mut scheduler, &mut host);

    let bytes = line.bytes();
    assert!(bytes[11..27].iter().all(|byte| *byte == 0));
}

#[test]
fn exec_request_should_return_status_zero() {

    let (mut scheduler, mut host, line) = synced_host();

    feed(&mut host, &packet(0xAA, 0x00, 0x03, &[]));
    drain(&mut scheduler, &mut host);

    let bytes = line.bytes();
    assert_eq!(bytes.len(), 13);
    assert_eq!(bytes[4], 0x11);
    assert_eq!(bytes[11], 0x00);
}

#[test]
fn bad_checksum_should_drop_packet_silently() {

    let (mut scheduler, mut host, line) = synced_host();
    let mut request = packet(0xAA, 0x00, 0x01, &[]);
    request[5] ^= 0xFF;

    feed(&mut host, &request);
    drain(&mut scheduler, &mut host);

    assert!(line.bytes().is_empty());
    assert_eq!(host.sync_state(), SyncState::Ready);

    // The next good packet still gets through.
    feed(&mut host, &packet(0xAA, 0x00, 0x01, &[]));
    drain(&mut scheduler, &mut host);

    assert_eq!(line.bytes().len(), 7);
}

#[test]
fn node_request_should_echo_request_then_frame_node_reply() {

    let (mut scheduler, mut host, line) = synced_host();
    host.add_node(Box::new(K573CardUnit::new()));
    let request = packet(0x00, 0x01, 0x00, &[]);

    feed(&mut host, &request);
    drain(&mut scheduler, &mut host);

    let mut expected = request.clone();
    expected.extend_from_slice(&[0xAA, 0x01, 0x01, 0x00, 0x01, 0x00, 0x03]);
    assert_eq!(line.bytes(), expected);
}

#[test]
fn node_request_for_unknown_node_should_get_no_reply() {

    let (mut scheduler, mut host, line) = synced_host();
    host.add_node(Box::new(K573CardUnit::new()));

    feed(&mut host, &packet(0x00, 0x03, 0x00, &[]));
    drain(&mut scheduler, &mut host);

    assert!(line.bytes().is_empty());
    assert_eq!(host.pending_response_bytes(), 0);
}

#[test]
fn node_reply_should_append_post_response_bytes_after_checksum() {

    struct TrailingNode;

    impl AcioNode for TrailingNode {
        fn node_info(&self) -> NodeInfo {
            NodeInfo::new(9, 1, 0, "TRAIL")
        }

        fn handle_message(&mut self, _message: &[u8], response: &mut Vec<u8>, response_post: &mut Vec<u8>) {
            response.push(0x42);
            response_post.extend_from_slice(&[0xDE, 0xAD]);
        }
    }

    let (mut scheduler, mut host, line) = synced_host();
    host.add_node(Box::new(TrailingNode));

    feed(&mut host, &packet(0x00, 0x01, 0x30, &[]));
    drain(&mut scheduler, &mut host);

    let bytes = line.bytes();
    let tail = &bytes[6..];
    assert_eq!(tail[..6], [0xAA, 0x01, 0x01, 0x30, 0x01, 0x42]);
    assert_eq!(tail[6], checksum(&tail[1..6]));
    assert_eq!(tail[7..], [0xDE, 0xAD]);
}

#[test]
fn responses_should_be_paced_one_byte_per_frame() {

    // Given the first sync sequence received at time zero.
    let mut scheduler = Scheduler::new();
    let mut host = K573AcioHost::new(scheduler.clock());
    let line = CaptureLine::default();
    host.attach_line(Box::new(line.clone()));
    let bit = Time::from_hz(BAUD_RATE as f64);

    feed(&mut host, &SYNC_1);

    scheduler.run_until(bit - Time::from_picos(1), &mut [&mut host]);
    assert!(line.bytes().is_empty());

    scheduler.run_until(bit, &mut [&mut host]);
    assert_eq!(line.bytes().len(), 1);

    scheduler.run_until(bit * 12 - Time::from_picos(1), &mut [&mut host]);
    assert_eq!(line.bytes().len(), 1);

    scheduler.run_until(bit * 12, &mut [&mut host]);
    assert_eq!(line.bytes().len(), 2);
}

#[test]
fn reset_should_drop_pending_output_and_sync() {

    let (mut scheduler, mut host, line) = synced_host();
    feed(&mut host, &packet(0xAA, 0x00, 0x01, &[]));

    host.reset();
    drain(&mut scheduler, &mut host);

    assert!(line.bytes().is_empty());
    assert_eq!(host.sync_state(), SyncState::Unsynced);
}

#[test]
fn card_unit_should_report_card_status() {

    let mut unit = K573CardUnit::new();
    let mut response = Vec::new();
    let mut post = Vec::new();

    unit.handle_message(&packet(0x00, 0x01, 0x12, &[]), &mut response, &mut post);
    assert_eq!(response, vec![0]);

    unit.set_keypad(KEYPAD_CARD_TOGGLE);
    response.clear();
    unit.handle_message(&packet(0x00, 0x01, 0x12, &[]), &mut response, &mut post);
    assert_eq!(response, vec![2 | 64 | 128]);
}

#[test]
fn card_unit_should_refuse_read_without_card() {

    let mut unit = K573CardUnit::new();
    let mut response = Vec::new();
    let mut post = Vec::new();
    unit.set_card_inserted(true);

    unit.handle_message(&packet(0x00, 0x01, 0x18, &[]), &mut response, &mut post);

    assert_eq!(response, vec![0xFF]);
}

#[test]
fn card_unit_should_read_back_written_card_data() {

    // Given a freshly created and inserted card.
    let mut unit = K573CardUnit::new();
    let image = unit.create_card();
    unit.set_card_inserted(true);
    assert_eq!(image[..5], [0x08, 0x1F, 0x7D, 0xF0, 0x56]);

    let data: Vec<u8> = (0..CARD_DATA_BYTES as u8).collect();
    let mut response = Vec::new();
    let mut post = Vec::new();
    unit.handle_message(&packet(0x00, 0x01, 0x16, &data), &mut response, &mut post);
    assert_eq!(response, vec![0]);

    response.clear();
    unit.handle_message(&packet(0x00, 0x01, 0x18, &[]), &mut response, &mut post);

    assert_eq!(response.len(), 1 + CARD_DATA_BYTES);
    assert_eq!(response[0], 0);
    assert_eq!(response[1..], data[..]);
    assert_eq!(unit.unload_card().map(|card| card[5]), Some(5));
}

#[test]
fn card_unit_should_record_slot_state() {

    let mut unit = K573CardUnit::new();
    let mut response = Vec::new();
    let mut post = Vec::new();

    unit.handle_message(&packet(0x00, 0x01, 0x14, &[2]), &mut response, &mut post);

    assert_eq!(response, vec![0]);
    assert_eq!(unit.last_slot_state(), Some(CardSlotState::Eject));
}

#[test]
fn keypad_read_should_report_new_presses_once() {

    // Given keys 1 and 3 held down.
    let mut unit = K573CardUnit::new();
    unit.set_keypad(0b101);
    let mut response = Vec::new();
    let mut post = Vec::new();
    let read = packet(0x00, 0x01, 0x26, &[0x05]);

    unit.handle_message(&read, &mut response, &mut post);
    assert_eq!(response, vec![0x69, 0x7A]);

    response.clear();
    unit.handle_message(&read, &mut response, &mut post);
    assert_eq!(response, vec![0]);

    unit.set_keypad(0b111);
    response.clear();
    unit.handle_message(&read, &mut response, &mut post);
    assert_eq!(response, vec![0x72]);
}

#[test]
fn keypad_read_should_respect_requested_key_count() {

    let mut unit = K573CardUnit::new();
    unit.set_keypad(1 << 9);
    let mut response = Vec::new();
    let mut post = Vec::new();

    // Count code 1 covers only the first key.
    unit.handle_message(&packet(0x00, 0x01, 0x26, &[0x01]), &mut response, &mut post);

    assert_eq!(response, vec![0]);
}

#[test]
fn card_unit_should_ignore_unknown_subcommands() {

    let mut unit = K573CardUnit::new();
    let mut response = Vec::new();
    let mut post = Vec::new();

    unit.handle_message(&packet(0x00, 0x01, 0x77, &[]), &mut response, &mut post);

    assert!(response.is_empty());
}

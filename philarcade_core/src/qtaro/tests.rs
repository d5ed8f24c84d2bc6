use super::king_qtaro::{DmaMemory, KingQtaro, DMA_TIMER_PERIOD, QTARO_COUNT};
use super::vj_sprite::{SpriteEntry, VjSprite, OUTPUT_WIDTH, SPRITE_PAGE_BYTES};
use super::{MpegVideoDecoder, Qtaro, RgbFrame, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};
use crate::bus::Bus;
use crate::timer::scheduler::Scheduler;
use crate::timer::{Time, Timed};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const FULL: u32 = 0xFFFFFFFF;

/// What a decoder has been asked to do.
#[derive(Default)]
struct DecoderLog {
    bytes: Vec<u8>,
    resets: u32,
    ends: u32,
}

/// A decoder that hands out prepared frames at fixed presentation times.
struct ScriptedDecoder {
    log: Rc<RefCell<DecoderLog>>,
    frames: VecDeque<(f64, RgbFrame)>,
}

impl MpegVideoDecoder for ScriptedDecoder {

    fn reset_stream(&mut self) {
        self.log.borrow_mut().resets += 1;
    }

    fn write_byte(&mut self, byte: u8) {
        self.log.borrow_mut().bytes.push(byte);
    }

    fn signal_end(&mut self) {
        self.log.borrow_mut().ends += 1;
    }

    fn time(&self) -> f64 {
        self.frames.front().map_or(f64::INFINITY, |(time, _)| *time)
    }

    fn decode(&mut self) -> Option<RgbFrame> {
        self.frames.pop_front().map(|(_, frame)| frame)
    }
}

fn decoder(frames: Vec<(f64, RgbFrame)>) -> (Box<ScriptedDecoder>, Rc<RefCell<DecoderLog>>) {

    let log = Rc::new(RefCell::new(DecoderLog::default()));
    let decoder = ScriptedDecoder {
        log: log.clone(),
        frames: frames.into(),
    };
    (Box::new(decoder), log)
}

fn solid(width: usize, height: usize, value: u32) -> RgbFrame {
    RgbFrame::from_pixels(width, height, vec![value; width * height])
}

/// Host memory backed by a byte vector, dwords little-endian.
struct HostMemory(Vec<u8>);

impl HostMemory {

    fn put_dword(&mut self, address: usize, value: u32) {
        self.0[address..address + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl DmaMemory for HostMemory {

    fn read_dword(&mut self, address: u32) -> u32 {
        let a = address as usize;
        u32::from_le_bytes([self.0[a], self.0[a + 1], self.0[a + 2], self.0[a + 3]])
    }

    fn read_byte(&mut self, address: u32) -> u8 {
        self.0[address as usize]
    }
}

fn read(card: &mut KingQtaro, address: u32) -> u32 {
    card.read(address / 4, FULL)
}

fn write(card: &mut KingQtaro, address: u32, data: u32) {
    card.write(address / 4, data, FULL);
}

/// A card with a scripted decoder on every board.
fn card() -> (Scheduler, KingQtaro, Vec<Rc<RefCell<DecoderLog>>>) {

    let scheduler = Scheduler::new();
    let mut card = KingQtaro::new(scheduler.clock());
    let mut logs = Vec::new();
    for i in 0..QTARO_COUNT {
        let (decoder, log) = decoder(vec![(0.0, solid(2, 1, 0x10 + i as u32))]);
        card.qtaro_mut(i).attach_decoder(decoder);
        logs.push(log);
    }
    (scheduler, card, logs)
}

#[test]
fn qtaro_should_start_and_end_streams_on_bit_7() {

    let mut qtaro = Qtaro::new();
    let (decoder, log) = decoder(Vec::new());
    qtaro.attach_decoder(decoder);

    qtaro.reg_w(0x80);
    qtaro.reg_w(0x81);
    assert_eq!(log.borrow().resets, 1);
    assert_eq!(qtaro.reg_r(), 0x81);

    qtaro.reg_w(0x01);
    assert_eq!(log.borrow().ends, 1);
    assert_eq!(log.borrow().resets, 1);
}

#[test]
fn qtaro_fixed_registers_should_read_their_idle_values() {

    let mut qtaro = Qtaro::new();

    qtaro.reg3_w(0x40);

    assert_eq!(qtaro.reg2_r(), 0);
    assert_eq!(qtaro.reg3_r(), 0x20);
    assert_eq!(qtaro.frame_size(), (DEFAULT_FRAME_WIDTH, DEFAULT_FRAME_HEIGHT));
}

#[test]
fn qtaro_update_frame_should_keep_the_last_frame_due() {

    let mut qtaro = Qtaro::new();
    let (decoder, _log) = decoder(vec![
        (0.0, solid(4, 2, 1)),
        (0.04, solid(4, 2, 2)),
        (0.08, solid(8, 4, 3)),
    ]);
    qtaro.attach_decoder(decoder);

    // Given decoding is off, time passing decodes nothing.
    qtaro.update_frame(1.0);
    assert!(qtaro.frame().is_none());

    qtaro.set_video_decode_enabled(true);
    qtaro.update_frame(0.05);
    assert_eq!(qtaro.frame().map(|frame| frame.pixel(0, 0)), Some(2));
    assert_eq!(qtaro.frame_size(), (4, 2));

    qtaro.update_frame(0.05);
    assert_eq!(qtaro.frame().map(|frame| frame.pixel(7, 3)), Some(3));
    assert_eq!(qtaro.frame_size(), (8, 4));
}

#[test]
fn qtaro_render_should_follow_the_mix_level() {

    let mut qtaro = Qtaro::new();
    let (decoder, _log) = decoder(vec![(0.0, solid(2, 2, 0x00_64_64_64))]);
    qtaro.attach_decoder(decoder);
    qtaro.set_video_decode_enabled(true);
    qtaro.update_frame(0.0);

    // Level 0 shows the movie only.
    let mut base = solid(2, 2, 0x00_C8_C8_C8);
    qtaro.render_video_frame(&mut base);
    assert_eq!(base.pixel(1, 1), 0x00_64_64_64);

    // Level 15 shows the overlay only.
    qtaro.mix_w(15);
    let mut base = solid(2, 2, 0x00_C8_C8_C8);
    qtaro.render_video_frame(&mut base);
    assert_eq!(base.pixel(1, 1), 0x00_C8_C8_C8);

    // Level 3 takes a fifth of the overlay: 100 * 0.8 + 200 * 0.2 = 120.
    qtaro.mix_w(3);
    let mut base = solid(2, 2, 0x00_C8_C8_C8);
    qtaro.render_video_frame(&mut base);
    let pixel = base.pixel(0, 1);
    assert_eq!(pixel >> 24, 0xFF);
    for lane in 0..3 {
        let value = ((pixel >> (lane * 8)) & 0xFF) as i32;
        assert!((value - 120).abs() <= 1, "lane {} is {}", lane, value);
    }
}

#[test]
fn qtaro_render_should_leave_a_mismatched_overlay_alone() {

    let mut qtaro = Qtaro::new();
    let (decoder, _log) = decoder(vec![(0.0, solid(2, 2, 0x11))]);
    qtaro.attach_decoder(decoder);
    qtaro.set_video_decode_enabled(true);
    qtaro.update_frame(0.0);

    let mut base = solid(3, 2, 0x22);
    qtaro.render_video_frame(&mut base);

    assert_eq!(base, solid(3, 2, 0x22));
}

#[test]
fn king_qtaro_should_answer_firmware_and_board_registers() {

    let (_scheduler, mut card, _logs) = card();

    assert_eq!(read(&mut card, 0x80), 0);
    assert_eq!(read(&mut card, 0x84), 1);
    assert_eq!(read(&mut card, 0x88), 0);
    assert_eq!(read(&mut card, 0x8C), 1);

    for base in [0x10, 0x20, 0x30] {
        assert_eq!(read(&mut card, base), 0);
        write(&mut card, base + 8, 0x40);
        assert_eq!(read(&mut card, base + 8), 0x20);
    }

    assert_eq!(read(&mut card, 0x40), 0xFFFFFFFF);
}

#[test]
fn king_qtaro_board_control_bytes_should_sit_in_the_upper_lanes() {

    let (_scheduler, mut card, logs) = card();

    // Given a write to board 1's lane only.
    card.write(0xB0 / 4, 0x0080_0000, 0x00FF_0000);

    assert_eq!(card.qtaro(1).reg_r(), 0x80);
    assert_eq!(card.qtaro(0).reg_r(), 0);
    assert_eq!(logs[1].borrow().resets, 1);
    assert_eq!(read(&mut card, 0xB0), 0x0080_0000);
}

#[test]
fn king_qtaro_event_io_should_report_ready_boards() {

    let (_scheduler, mut card, _logs) = card();

    write(&mut card, 0x90, 0x44332210);
    card.write(0x94 / 4, 0xAABBCC55, 0x000000FF);

    assert_eq!(read(&mut card, 0x90), 0x44332217);
    assert_eq!(read(&mut card, 0x94), 0x55);
}

#[test]
fn king_qtaro_event_registers_should_be_stored_and_echoed() {

    // Unimplemented semantics: the event, event mask and event byte banks are
    // only stored; nothing raises or consumes events.
    let (_scheduler, mut card, _logs) = card();

    write(&mut card, 0x98, 0x04030201);
    card.write(0x9C / 4, 0x05, 0x000000FF);
    write(&mut card, 0xA0, 0x0D0C0B0A);
    write(&mut card, 0xA8, 0x000E0E00);
    write(&mut card, 0xAC, 0x12345678);
    write(&mut card, 0xB8, 0x9ABCDEF0);

    assert_eq!(read(&mut card, 0x98), 0x04030201);
    assert_eq!(read(&mut card, 0x9C), 0x05);
    assert_eq!(read(&mut card, 0xA0), 0x0D0C0B0A);
    assert_eq!(read(&mut card, 0xA8), 0x000E0E00);
    assert_eq!(read(&mut card, 0xAC), 0x12345678);
    assert_eq!(read(&mut card, 0xB8), 0x9ABCDEF0);
}

#[test]
fn king_qtaro_int_should_report_running_dma_in_bit_4() {

    let (_scheduler, mut card, _logs) = card();

    write(&mut card, 0xB4, 0x0100_0010);
    assert_eq!(read(&mut card, 0xB4), 0x0100_0000);

    write(&mut card, 0x60, 1);
    assert_eq!(read(&mut card, 0xB4), 0x0100_0010);
    assert_eq!(read(&mut card, 0x68), 1);

    // The running register ignores writes.
    write(&mut card, 0x68, 0);
    assert_eq!(read(&mut card, 0x68), 1);
}

#[test]
fn king_qtaro_dma_should_wait_for_all_three_streams() {

    let (scheduler, mut card, _logs) = card();

    write(&mut card, 0x50, 1);
    write(&mut card, 0x60, 1);
    assert_eq!(card.next_deadline(), None);

    // Anything but 1 does not request a stream.
    write(&mut card, 0x70, 2);
    assert_eq!(card.next_deadline(), None);

    write(&mut card, 0x70, 1);
    assert_eq!(card.next_deadline(), Some(scheduler.now() + DMA_TIMER_PERIOD));
}

#[test]
fn king_qtaro_dma_should_walk_descriptor_chains_in_bursts() {

    let (mut scheduler, mut card, logs) = card();

    // Given a 100 byte single-descriptor chain per board.
    let mut memory = HostMemory(vec![0; 0x1000]);
    for i in 0..QTARO_COUNT {
        let descriptor = 0x100 * (i + 1);
        let buffer = 0x800 + 0x100 * i;
        memory.put_dword(descriptor, 0x1);
        memory.put_dword(descriptor + 4, 100);
        memory.put_dword(descriptor + 8, buffer as u32);
        for offset in 0..100 {
            memory.0[buffer + offset] = (i * 100 + offset) as u8;
        }
    }
    card.attach_dma_memory(Box::new(memory));

    for i in 0..QTARO_COUNT as u32 {
        write(&mut card, 0x54 + i * 0x10, 0x100 * (i + 1));
        write(&mut card, 0x50 + i * 0x10, 1);
    }

    scheduler.run_for(Time::from_micros(300), &mut [&mut card]);
    for log in logs.iter() {
        assert_eq!(log.borrow().bytes.len(), 64);
    }
    assert_eq!(read(&mut card, 0xB4) & 0x10, 0x10);

    scheduler.run_for(Time::from_micros(700), &mut [&mut card]);
    for (i, log) in logs.iter().enumerate() {
        let expected: Vec<u8> = (0..100).map(|offset| (i * 100 + offset) as u8).collect();
        assert_eq!(log.borrow().bytes, expected);
        assert!(!card.is_dma_running(i));
        assert_eq!(card.dma_descriptor_addr(i), 1);
    }
    assert_eq!(read(&mut card, 0xB4) & 0x10, 0);
    assert_eq!(card.next_deadline(), None);
}

#[test]
fn king_qtaro_video_control_should_advance_decoders_by_virtual_time() {

    let (mut scheduler, mut card, _logs) = card();

    // The first write has no earlier write to measure from.
    card.video_control_w(0x2A);
    assert!(card.qtaro(0).is_video_decode_enabled());
    assert!(card.qtaro(0).frame().is_none());

    scheduler.run_for(Time::from_micros(10_000), &mut [&mut card]);
    card.video_control_w(0x2A);

    for i in 0..QTARO_COUNT {
        assert_eq!(card.qtaro(i).frame().map(|frame| frame.pixel(1, 0)), Some(0x10 + i as u32));
    }
}

#[test]
fn king_qtaro_video_control_should_tear_down_a_blanked_stream() {

    let (_scheduler, mut card, logs) = card();
    card.video_control_w(0x2A);
    write(&mut card, 0x64, 0x1234);
    write(&mut card, 0x60, 1);

    card.video_control_w(0x2A | 0x04);

    assert!(!card.qtaro(1).is_video_decode_enabled());
    assert!(card.qtaro(0).is_video_decode_enabled());
    assert_eq!(card.dma_descriptor_addr(1), 0);
    assert!(!card.is_dma_running(1));
    assert_eq!(logs[1].borrow().resets, 1);
    assert_eq!(logs[0].borrow().resets, 0);
}

#[test]
fn sprite_entry_should_decode_fields_and_keep_unknown_bits() {

    // Unimplemented semantics: unk1 and unk2 are stored and written back only.
    let words = [0x920C, 0x3020, 0x5123, 0x0F07, 0x03FF, 0x0005];

    let entry = SpriteEntry::decode(&words);

    assert!(!entry.disable);
    assert_eq!(entry.color, 0x12);
    assert_eq!((entry.tx, entry.ty), (0x20, 0x30));
    assert_eq!(entry.code, 0x123);
    assert_eq!((entry.src_width, entry.src_height), (8, 16));
    assert_eq!((entry.sx, entry.sy), (5, -1));
    assert_eq!(entry.unk1, 0x8008);
    assert_eq!(entry.unk2, 0x5000);
    assert_eq!(entry.encode(), words);
}

#[test]
fn sprite_entry_should_be_disabled_without_bit_2() {
    assert!(SpriteEntry::decode(&[0x0000, 0, 0, 0, 0, 0]).disable);
}

fn sprite(tx: u8, ty: u8, width: u16, sx: i32, sy: i32, color: u32) -> SpriteEntry {
    SpriteEntry {
        disable: false,
        code: 0,
        color,
        tx,
        ty,
        src_width: width,
        src_height: 1,
        sx,
        sy,
        unk1: 0,
        unk2: 0,
    }
}

#[test]
fn vj_sprite_should_fetch_pixels_from_8x8_blocks() {

    // Given pen 5 at (9, 10) of page 0.
    let mut gfx = vec![0; SPRITE_PAGE_BYTES];
    gfx[2048 + 2 * 8 + 64 + 1] = 5;
    let renderer = VjSprite::new(gfx);

    assert_eq!(renderer.page_count(), 1);
    assert_eq!(renderer.pixel(0, 9, 10), 5);
    assert_eq!(renderer.pixel(0, 10, 9), 0);
}

#[test]
fn vj_sprite_should_draw_each_pixel_as_a_2x2_pair() {

    let mut gfx = vec![0; SPRITE_PAGE_BYTES];
    gfx[2048 + 2 * 8 + 64 + 1] = 5;
    let renderer = VjSprite::new(gfx);

    // Colour 1 pen 5: only the low byte of each palette word counts.
    let mut palette = vec![0; 0x200 * 4];
    palette[(0x100 + 5) * 4..(0x100 + 5) * 4 + 4].copy_from_slice(&[0xAB11, 0x0022, 0x0033, 0x0044]);
    let mut output = RgbFrame::new(OUTPUT_WIDTH, 480);

    renderer.render(&mut output, &sprite(9, 10, 1, 3, 4, 1), &palette);

    for y in [8, 9] {
        assert_eq!(output.pixel(6, y), 0x332211);
        assert_eq!(output.pixel(7, y), 0x334411);
    }
    assert_eq!(output.pixel(5, 8), 0);
    assert_eq!(output.pixel(8, 8), 0);
    assert_eq!(output.pixel(6, 10), 0);
}

#[test]
fn vj_sprite_should_skip_columns_past_the_page_edge_and_clip_the_screen() {

    let renderer = VjSprite::new(vec![0; SPRITE_PAGE_BYTES]);
    let palette = [1, 2, 3, 4];
    let mut output = RgbFrame::new(OUTPUT_WIDTH, 480);
    output.set_pixel(2, 0, 0xDEAD);

    // Given a window that starts on the last column of the page.
    renderer.render(&mut output, &sprite(255, 0, 2, 0, 0, 0), &palette);
    assert_eq!(output.pixel(0, 0), 0x030201);
    assert_eq!(output.pixel(1, 1), 0x030401);
    assert_eq!(output.pixel(2, 0), 0xDEAD);

    // Given a sprite hanging off the left edge.
    let mut output = RgbFrame::new(OUTPUT_WIDTH, 480);
    renderer.render(&mut output, &sprite(0, 0, 2, -1, 0, 0), &palette);
    assert_eq!(output.pixel(0, 0), 0x030201);
    assert_eq!(output.pixel(2, 0), 0);
}

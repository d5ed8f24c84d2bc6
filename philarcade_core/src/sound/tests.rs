use super::shambros_sound::{ShambrosSound, SAMPLE_RAM_BYTES};
use super::Mixer;
use crate::bus::Bus;
use crate::sinks::capture::CaptureAudio;
use crate::timer::scheduler::Scheduler;
use crate::timer::{Clock, Time};

const FULL: u32 = 0xFFFF;

/// Register word offset for a voice register.
fn reg(voice: u32, register: u32) -> u32 {
    (voice << 4) | register
}

/// Points a voice at integer sample addresses with the given step.
fn setup_voice(sound: &mut ShambrosSound, voice: u32, start: u32, end: u32, looped: bool, step: u16) {
    sound.write(reg(voice, 1), start & 0xFFFF, FULL);
    sound.write(reg(voice, 2), (start >> 16) | if looped { 0x8000 } else { 0 }, FULL);
    sound.write(reg(voice, 6), end & 0xFFFF, FULL);
    sound.write(reg(voice, 7), end >> 16, FULL);
    sound.write(reg(voice, 3), step as u32, FULL);
    sound.write(reg(voice, 0xB), 0xFFFF, FULL);
    sound.write(reg(voice, 0xC), 0xFFFF, FULL);
}

#[test]
fn mix_frame_should_play_one_sample_at_full_volume() {

    // Given voice 0 covering one sample with RAM byte 0 = 100.
    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);
    sound.load_ram(0, &[100]);
    setup_voice(&mut sound, 0, 0, 1, false, 0x1000);
    sound.set_voice_state(1);

    let frame = sound.mix_frame();

    assert_eq!(frame, (25600, 25600));
    let voice = sound.voice(0).copied().unwrap();
    assert_eq!(voice.addr_cur, 0x1000);
    assert!(!voice.enabled);
}

#[test]
fn looped_voice_at_end_should_restart_from_loop_address() {

    // Given a looped voice sitting exactly on its end address, step 0.
    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);
    sound.load_ram(0x10, &[7]);
    setup_voice(&mut sound, 0, 0x20, 0x20, true, 0);
    sound.write(reg(0, 4), 0x10, FULL);
    sound.write(reg(0, 5), 0, FULL);
    sound.set_voice_state(1);

    let (left, _) = sound.mix_frame();

    let voice = sound.voice(0).copied().unwrap();
    assert_eq!(voice.addr_cur, 0x10 << 12);
    assert!(voice.enabled);
    assert_eq!(left, 7 * 256);
}

#[test]
fn unlooped_voice_at_end_should_disable_and_stay_silent() {

    // Given an unlooped voice sitting on its end address.
    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);
    sound.load_ram(0x20, &[50]);
    setup_voice(&mut sound, 0, 0x20, 0x20, false, 0x1000);
    sound.set_voice_state(1);

    assert_eq!(sound.mix_frame(), (0, 0));
    assert_eq!(sound.voice_state(), 0);
    assert_eq!(sound.mix_frame(), (0, 0));
}

#[test]
fn volumes_should_scale_each_channel_independently() {

    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);
    sound.load_ram(0, &[0x80]);
    setup_voice(&mut sound, 0, 0, 4, false, 0x1000);
    sound.write(reg(0, 0xC), 0, FULL);
    sound.set_voice_state(1);

    // Given sample -128 at full left volume and zero right volume.
    assert_eq!(sound.mix_frame(), (-32768, 0));
}

#[test]
fn voices_should_sum_and_clamp() {

    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);
    sound.load_ram(0, &[100, 100]);
    setup_voice(&mut sound, 0, 0, 4, false, 0x1000);
    setup_voice(&mut sound, 1, 1, 4, false, 0x1000);
    sound.set_voice_state(0b11);

    // Given two voices of 25600 each, the sum saturates.
    assert_eq!(sound.mix_frame(), (i16::MAX, i16::MAX));
}

#[test]
fn flash_banks_should_be_read_big_endian() {

    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);
    sound.load_flash(1, &[0x0102]);
    setup_voice(&mut sound, 0, 0x800001, 0x800002, false, 0x1000);
    sound.set_voice_state(1);

    // Given the odd byte of the first bank 1 word.
    assert_eq!(sound.mix_frame().0, 2 * 256);
}

#[test]
fn bus_should_expose_registers_and_big_endian_ram() {

    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);

    sound.write(reg(2, 3), 0x0D59, FULL);
    sound.write(0x80, 0xABCD, FULL);
    sound.write(0x80, 0x0011, 0x00FF);

    assert_eq!(sound.read(reg(2, 3), FULL), 0x0D59);
    assert_eq!(sound.voice(2).unwrap().step, 0x0D59);
    assert_eq!(sound.read(0x80, FULL), 0xAB11);
    assert_eq!(sound.read((SAMPLE_RAM_BYTES / 2) as u32, FULL), 0xFFFF);
}

#[test]
fn unknown_registers_should_be_stored_without_semantics() {

    // Unimplemented semantics: register 0 of each voice is only stored.
    let mut sound = ShambrosSound::new(Clock::new(), 16_934_400);

    sound.write(reg(1, 0), 0x1234, FULL);

    assert_eq!(sound.read(reg(1, 0), FULL), 0x1234);
    assert_eq!(sound.voice(1).copied().unwrap(), Default::default());
}

#[test]
fn timer_should_push_frames_at_output_rate() {

    // Given 384 input clocks per output frame.
    let mut scheduler = Scheduler::new();
    let mut sound = ShambrosSound::new(scheduler.clock(), 38_400);
    let audio = CaptureAudio::default();
    sound.attach_sink(Box::new(audio.clone()));

    scheduler.run_for(Time::from_micros(1_000_000), &mut [&mut sound]);

    assert_eq!(audio.frames().len(), 100);
}

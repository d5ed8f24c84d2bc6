// SPDX-License-Identifier: GPL-3.0
// timer.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::cell::Cell;
use std::ops::{Add, Mul, Sub};
use std::rc::Rc;

/// This module contains the scheduler that steps timed devices through virtual time.
pub mod scheduler;


/// Number of picoseconds in one second.
const PICOS_PER_SECOND: u64 = 1_000_000_000_000;

/// A point in (or span of) virtual time, counted in picoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {

    pub const ZERO: Time = Time(0);

    pub const fn from_picos(picos: u64) -> Self {
        Time(picos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Time(micros * 1_000_000)
    }

    /// Returns the period of one cycle at the given frequency.
    pub fn from_hz(hz: f64) -> Self {
        if hz <= 0.0 {
            return Time(u64::MAX);
        }
        Time((PICOS_PER_SECOND as f64 / hz) as u64)
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Time((seconds.max(0.0) * PICOS_PER_SECOND as f64) as u64)
    }

    pub const fn as_picos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / PICOS_PER_SECOND as f64
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        Time(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<u64> for Time {
    type Output = Time;

    fn mul(self, rhs: u64) -> Time {
        Time(self.0.saturating_mul(rhs))
    }
}

/// This struct is a shared handle onto the current virtual time. The scheduler
/// advances it and devices read it while servicing bus accesses.
#[derive(Debug, Clone, Default)]
pub struct Clock(Rc<Cell<Time>>);

impl Clock {

    pub fn new() -> Self {
        Clock(Rc::new(Cell::new(Time::ZERO)))
    }

    pub fn now(&self) -> Time {
        self.0.get()
    }

    pub fn set(&self, time: Time) {
        self.0.set(time);
    }

    pub fn advance(&self, by: Time) {
        self.0.set(self.0.get() + by);
    }
}

/// The state a device timer can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Once { fire_at: Time },
    Periodic { fire_at: Time, period: Time },
}

/// This struct models one named timer owned by a device. It holds at most one
/// pending fire, and re-arming replaces whatever was pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimer {
    state: TimerState,
}

impl EventTimer {

    /// Creates an idle timer.
    pub fn new() -> Self {
        EventTimer {
            state: TimerState::Idle,
        }
    }

    /// Arms the timer to fire once, `delay` after `now`.
    pub fn adjust(&mut self, now: Time, delay: Time) {

        self.state = TimerState::Once { fire_at: now + delay };
    }

    /// Arms the timer to fire `delay` after `now` and then every `period`. A zero
    /// period would never let time advance, so it degrades to a one-shot fire.
    pub fn adjust_periodic(&mut self, now: Time, delay: Time, period: Time) {

        if period == Time::ZERO {
            log::warn!("periodic timer armed with zero period, firing once");
            self.adjust(now, delay);
            return;
        }
        self.state = TimerState::Periodic { fire_at: now + delay, period };
    }

    /// Cancels any pending fire.
    pub fn reset(&mut self) {

        self.state = TimerState::Idle;
    }

    pub fn is_enabled(&self) -> bool {
        self.state != TimerState::Idle
    }

    /// Returns when the timer will next fire, if it is armed.
    pub fn next_fire(&self) -> Option<Time> {

        match self.state {
            TimerState::Idle => None,
            TimerState::Once { fire_at } => Some(fire_at),
            TimerState::Periodic { fire_at, .. } => Some(fire_at),
        }
    }

    /// Consumes one fire if the timer is due at `now`. One-shot timers go idle,
    /// periodic ones re-arm one period later.
    pub fn take_due(&mut self, now: Time) -> bool {

        match self.state {
            TimerState::Once { fire_at } if fire_at <= now => {
                self.state = TimerState::Idle;
                true
            },
            TimerState::Periodic { fire_at, period } if fire_at <= now => {
                self.state = TimerState::Periodic { fire_at: fire_at + period, period };
                true
            },
            _ => false,
        }
    }
}

/// Returns the earliest of a set of optional deadlines.
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Time>>) -> Option<Time> {
    deadlines.into_iter().flatten().min()
}

/// This trait is implemented by every device that owns timers, so the scheduler
/// can drive them without knowing what they are.
pub trait Timed {

    /// Implementations must return the earliest time any of their timers will fire.
    fn next_deadline(&self) -> Option<Time>;

    /// Implementations must fire every one of their timers that is due at `now`.
    /// Callbacks re-check device state, so a fire whose trigger has gone away is
    /// a no-op.
    fn run_timers(&mut self, now: Time);
}

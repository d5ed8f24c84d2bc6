// SPDX-License-Identifier: GPL-3.0
// scheduler.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::{Clock, Time, Timed};

/// Upper bound on fires dispatched by one `run_until` call.
const MAX_FIRES_PER_RUN: usize = 10_000_000;

/// This struct steps a set of timed devices through virtual time in deadline
/// order. Fires at the same instant are dispatched in device order.
pub struct Scheduler {
    clock: Clock,
}

impl Scheduler {

    /// Creates a scheduler whose clock starts at zero.
    pub fn new() -> Self {
        Scheduler {
            clock: Clock::new(),
        }
    }

    /// Returns a handle onto the scheduler's clock, for handing to devices.
    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Runs every timer due up to and including `target`, then leaves the clock at `target`.
    pub fn run_until(&mut self, target: Time, devices: &mut [&mut dyn Timed]) {

        let mut fires = 0;
        loop {
            let next = devices
                .iter()
                .enumerate()
                .filter_map(|(index, device)| device.next_deadline().map(|time| (time, index)))
                .filter(|(time, _)| *time <= target)
                .min();

            let Some((time, index)) = next else {
                break;
            };

            if fires >= MAX_FIRES_PER_RUN {
                log::error!("scheduler gave up after {} fires before reaching {:?}", fires, target);
                break;
            }
            fires += 1;

            let now = time.max(self.clock.now());
            self.clock.set(now);
            devices[index].run_timers(now);
        }

        if target > self.clock.now() {
            self.clock.set(target);
        }
    }

    /// Runs for `span` beyond the current time.
    pub fn run_for(&mut self, span: Time, devices: &mut [&mut dyn Timed]) {

        let target = self.clock.now() + span;
        self.run_until(target, devices);
    }
}

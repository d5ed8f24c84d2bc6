// SPDX-License-Identifier: GPL-3.0
// lib.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

// Crate-wide lines to disable specific lints:

// Device models keep explicit constructors taking their collaborators, so
// there will be no derived Default implementations unless needed.
#![allow(clippy::new_without_default)]

// We use upper-case acronyms for some types, in order to match the chip
// documentation more closely.
#![allow(clippy::upper_case_acronyms)]

/// This module contains the register file and bus adapter shared by all devices.
pub mod bus;

/// This module contains virtual time, event timers and the scheduler.
pub mod timer;

/// This module contains the output side-channels devices drive.
pub mod sinks;

/// This module contains the byte pacing shared by serial devices.
pub mod uart;

/// This module contains the ACIO serial bus host and its nodes.
pub mod acio;

/// This module contains the Tokimeki Memorial serial peripheral.
pub mod tokimeki;

/// This module contains digital I/O board related functionality.
pub mod dio;

/// This module contains graphics chip related functionality.
pub mod gpu;

/// This module contains the Jaleco VJ Qtaro video mixing boards and their sprite renderer.
pub mod qtaro;

/// This module contains the GU956 income system board's network and port registers.
pub mod gu956;

/// This module contains sound chip related functionality.
pub mod sound;

/// This module contains PlayStation serial port related functionality.
pub mod sio;

/// This module contains the background work queue.
pub mod work_queue;

/// This module contains the network PC card and its filesystem.
pub mod npu;

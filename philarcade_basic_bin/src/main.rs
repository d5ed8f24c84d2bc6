// SPDX-License-Identifier: GPL-3.0
// main.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::cell::RefCell;
use std::ffi::OsString;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;

// This file is the core of the basic client - it exists merely as a CLI-based
// program to check an NPU settings file, list a PythonFS disk image and talk
// to an ACIO card unit over a virtual wire.

use clap::Parser;
use philarcade_core::{
    acio::{card_unit::K573CardUnit, checksum, k573_acio::K573AcioHost},
    npu::{
        config::NpuConfig,
        pythonfs::{PythonFs, FD_MASK_HDD},
        storage::FileStorage,
    },
    sinks::SerialLine,
    timer::{scheduler::Scheduler, Time},
};

#[derive(Parser)]
#[command(
    version,
    about = "A basic barebones front end for the PhilArcade peripheral models",
    long_about = None
)]
struct PhilArcadeArgs {
    #[arg(
        long = "npu-config",
        help = "The NPU network settings file",
        id = "settings file",
        default_value = "k573npu.ini"
    )]
    npu_config: OsString,

    #[arg(
        long = "hdd",
        help = "An optional PythonFS disk image to mount and list",
        id = "disk image"
    )]
    hdd: Option<OsString>,

    #[arg(
        long = "acio-demo",
        help = "Run the ACIO handshake against a card unit"
    )]
    acio_demo: bool,
}

/// Collects bytes the ACIO host puts on the wire.
#[derive(Clone, Default)]
struct WireCapture(Rc<RefCell<Vec<u8>>>);

impl SerialLine for WireCapture {
    fn transmit(&mut self, byte: u8) {
        self.0.borrow_mut().push(byte);
    }
}

impl WireCapture {
    fn take_hex(&self) -> String {
        let bytes = std::mem::take(&mut *self.0.borrow_mut());
        bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
    }
}

/// Builds a request with an empty payload.
fn acio_packet(command: u8, node_id: u8, subcmd: u8) -> Vec<u8> {
    let mut bytes = vec![0xAA, command, node_id, subcmd, 0];
    let sum = checksum(&bytes[1..]);
    bytes.push(sum);
    bytes
}

fn run_acio_demo() {
    let mut scheduler = Scheduler::new();
    let mut host = K573AcioHost::new(scheduler.clock());
    let wire = WireCapture::default();
    host.attach_line(Box::new(wire.clone()));
    let Some(node_id) = host.add_node(Box::new(K573CardUnit::new())) else {
        return;
    };

    let steps: [(&str, Vec<u8>); 4] = [
        ("sync 1", vec![0xAA, 0xAA, 0xAA, 0x55]),
        ("sync 2", vec![0xAA, 0xAA, 0x00, 0x00]),
        ("node count", acio_packet(0xAA, 0x00, 0x01)),
        ("card unit init", acio_packet(0x00, node_id, 0x00)),
    ];

    for (name, request) in steps {
        for byte in request {
            host.receive_byte(byte);
        }
        scheduler.run_for(Time::from_micros(20_000), &mut [&mut host]);
        log::info!("acio {}: {}", name, wire.take_hex());
    }
}

fn list_hdd(image: &Path) -> Result<(), String> {
    let storage = FileStorage::open(image).map_err(|err| format!("can't open {}: {}", image.display(), err))?;
    let mut fs = PythonFs::new(FD_MASK_HDD, Some(Box::new(storage)));
    fs.mount().map_err(|err| format!("can't mount {}: {}", image.display(), err))?;

    for entry in fs.list("/").map_err(|err| err.to_string())? {
        let kind = if entry.is_folder() { "dir " } else { "file" };
        log::info!("{} {:>10} {}", kind, entry.size, entry.name);
    }
    Ok(())
}

fn main() -> ExitCode {
    colog::init();
    let philarcade_args = PhilArcadeArgs::parse();

    let config = NpuConfig::load(Path::new(&philarcade_args.npu_config));
    log::info!(
        "npu {:02x?} at {} (mask {}, gateway {})",
        config.npu_id,
        config.ip_address,
        config.subnet_mask,
        config.default_gateway
    );

    if let Some(image) = &philarcade_args.hdd {
        if let Err(err) = list_hdd(Path::new(image)) {
            log::error!("{}", err);
            return ExitCode::FAILURE;
        }
    }

    if philarcade_args.acio_demo {
        run_acio_demo();
    }

    ExitCode::SUCCESS
}

// SPDX-License-Identifier: GPL-3.0
// k573_npu_card.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::config::NpuConfig;
use super::net::{encode_address, SocketTable};
use super::pythonfs::{FsError, PythonFs, FD_MASK_HDD, FD_MASK_RAM};
use super::storage::{MemoryStorage, Storage, RAM_DISK_BYTES};
use super::{pack_bytes, WordFifo, FIFO_BYTES};
use crate::bus::address_map::AddressMap;
use crate::bus::Bus;
use crate::work_queue::{WorkHandler, WorkQueue};

/// Value of the FPGA running check register.
const FPGA_RUNNING: u32 = 0x5963;

/// Words pushed to the output when the game requests state 2.
const STATE_2_FILL_WORDS: u16 = 0xA00;

/// Status written into every filesystem response that failed.
const FS_FAILED: i32 = -2;

/// Status written into every socket response that failed.
const NET_FAILED: i32 = -1;

/// Sizes of the fixed string fields in filesystem packets.
const SHORT_STRING: usize = 0x40;
const LONG_STRING: usize = 0x100;

/// Size of the sockaddr_in structure reported by recvfrom.
const SOCKADDR_BYTES: u32 = 16;

/// Opcodes.
const OP_NOP: u16 = 0x00;
const OP_PING: u16 = 0x01;
const OP_SOCKET_CLOSE: u16 = 0x22;
const OP_SOCKET_CONNECT: u16 = 0x23;
const OP_SOCKET_RECV: u16 = 0x28;
const OP_SOCKET_RECVFROM: u16 = 0x29;
const OP_SOCKET_SEND: u16 = 0x2A;
const OP_SOCKET_SENDTO: u16 = 0x2B;
const OP_SOCKET_SETSOCKOPT: u16 = 0x2C;
const OP_SOCKET_SOCKET: u16 = 0x2E;
const OP_STATUS: u16 = 0x37;
const OP_STATUS_PAIR: u16 = 0x38;
const OP_NET_SETTINGS: u16 = 0x3A;
const OP_FS_INITIALIZE: u16 = 0x40;
const OP_FS_OPEN: u16 = 0x41;
const OP_FS_CLOSE: u16 = 0x42;
const OP_FS_READ: u16 = 0x43;
const OP_FS_WRITE: u16 = 0x44;
const OP_FS_LSEEK: u16 = 0x45;
const OP_FS_DOPEN: u16 = 0x47;
const OP_FS_DCLOSE: u16 = 0x48;
const OP_FS_DREAD: u16 = 0x49;
const OP_FS_REMOVE: u16 = 0x4A;
const OP_FS_MKDIR: u16 = 0x4B;
const OP_FS_RMDIR: u16 = 0x4C;
const OP_FS_GETSTAT: u16 = 0x4D;
const OP_FS_CHDIR: u16 = 0x50;
const OP_FS_MOUNT: u16 = 0x51;
const OP_FS_UMOUNT: u16 = 0x52;
const OP_FS_DEVCTL: u16 = 0x53;
const OP_FS_FORMAT: u16 = 0x54;
const OP_WRITE_MEMORY: u16 = 0x80;
const OP_READ_MEMORY: u16 = 0x81;
const OP_EXECUTE_MEMORY: u16 = 0x82;

/// Network settings addresses for the settings opcode.
const SETTING_SUBNET_MASK: u32 = 0x01;
const SETTING_DEFAULT_GATEWAY: u32 = 0x03;
const SETTING_DNS_SERVERS: u32 = 0x06;
const SETTING_DOMAIN_NAME: u32 = 0x0F;
const SETTING_NTP_SERVER: u32 = 0x2A;
const SETTING_DHCP_SERVER: u32 = 0x36;
const SETTING_IP_ADDRESS: u32 = 0x101;

/// Work handed to the card's worker thread.
pub enum NpuWork {
    Packet(Vec<u16>),
    Reset,
}

/// State shared between the register interface and the worker.
struct NpuShared {
    output: Mutex<WordFifo>,
    current_state: AtomicU16,
}

impl NpuShared {

    fn output(&self) -> MutexGuard<'_, WordFifo> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads words, and values built from them, from the front of a packet.
/// Reading past the end yields zeros.
struct PacketReader<'a> {
    words: &'a [u16],
    position: usize,
}

impl<'a> PacketReader<'a> {

    fn new(words: &'a [u16]) -> Self {
        PacketReader { words, position: 0 }
    }

    fn u16(&mut self) -> u16 {
        let word = self.words.get(self.position).copied().unwrap_or(0);
        self.position += 1;
        word
    }

    fn u32(&mut self) -> u32 {
        let low = self.u16() as u32;
        low | (self.u16() as u32) << 16
    }

    /// Reads `len` bytes packed two to a word, low byte first. No packet is
    /// longer than the FIFO that carried it.
    fn bytes(&mut self, len: usize) -> Vec<u8> {

        let len = len.min(FIFO_BYTES);
        let mut bytes = Vec::with_capacity(len + 1);
        for _ in 0..len.div_ceil(2) {
            bytes.extend_from_slice(&self.u16().to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    /// Reads a fixed-size string field, which ends at its first NUL.
    fn string(&mut self, len: usize) -> String {

        let bytes = self.bytes(len);
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

/// Builds a response before it is appended to the output FIFO.
#[derive(Default)]
struct Response {
    words: Vec<u16>,
}

impl Response {

    fn header(&mut self, status: u16, packet_id: u16, length: usize) {
        self.words.extend([status, packet_id, length as u16]);
    }

    fn u16(&mut self, value: u16) {
        self.words.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.words.extend([value as u16, (value >> 16) as u16]);
    }

    fn i32(&mut self, value: i32) {
        self.u32(value as u32);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.words.extend(pack_bytes(bytes));
    }
}

/// Returns the path part of a target such as `"atam:/data/file"`.
fn path_after_device(target: &str) -> &str {

    match target.find(':') {
        Some(index) => target[index..].trim_start_matches(':'),
        None => "",
    }
}

fn fs_status(result: Result<u32, FsError>, what: &str) -> i32 {

    match result {
        Ok(value) => value as i32,
        Err(err) => {
            log::debug!("npu: {} failed: {}", what, err);
            FS_FAILED
        },
    }
}

/// This struct lives on the worker thread and carries out each packet:
/// socket calls, filesystem calls and the odd status query.
struct NpuWorker {
    config: NpuConfig,
    hdd: PythonFs,
    ramfs: PythonFs,
    sockets: SocketTable,
    shared: Arc<NpuShared>,
}

impl WorkHandler<NpuWork> for NpuWorker {

    fn handle(&mut self, item: NpuWork) {

        match item {
            NpuWork::Packet(words) => {
                let response = self.process(&words);

                // The whole response lands at once.
                self.shared.output().extend(&response.words);
            },
            NpuWork::Reset => {
                self.hdd.reset();
                self.ramfs.reset();
                self.sockets.reset();
            },
        }
    }
}

impl NpuWorker {

    fn process(&mut self, packet: &[u16]) -> Response {

        let mut input = PacketReader::new(packet);
        let opcode = input.u16() & 0xFF;
        let id = input.u16();
        let length = input.u16();
        log::trace!("npu: opcode {:02x} id {:04x} length {:04x}", opcode, id, length);

        let mut out = Response::default();
        match opcode {
            OP_NOP => {},
            OP_PING | OP_WRITE_MEMORY => out.header(0, id, 0),
            OP_STATUS => {
                out.header(0, id, 4);
                out.u32(1);
            },
            OP_STATUS_PAIR => {
                out.header(0x39, id, 4);
                out.u32(1);
                out.header(0, id, 0);
            },
            OP_READ_MEMORY => self.read_memory(&mut input, id, &mut out),
            OP_EXECUTE_MEMORY => {
                out.header(0, id, 0);
                self.shared.current_state.store(0x0F, Ordering::Release);
            },
            OP_SOCKET_CLOSE..=OP_SOCKET_SOCKET => self.socket_opcode(opcode, &mut input, id, &mut out),
            OP_NET_SETTINGS => self.net_settings(&mut input, id, &mut out),
            OP_FS_INITIALIZE..=OP_FS_FORMAT => self.filesystem_opcode(opcode, &mut input, id, &mut out),
            _ => {
                log::warn!("npu: unhandled opcode {:02x}", opcode);
                out.header(0, id, 0);
            },
        }
        out
    }

    fn read_memory(&mut self, input: &mut PacketReader, id: u16, out: &mut Response) {

        let address = input.u32();
        let requested = input.u16() as usize;
        out.header(0, id, requested);

        let start = out.words.len();
        match address {
            0x80E0_0000 | 0x8080_0000 => out.bytes(&self.config.npu_id),
            0x80E0_0008 | 0x8080_0008 => out.bytes(&self.config.mac_address),
            0x80E0_0010 | 0x8080_0010 => out.u16(1),
            _ => log::debug!("npu: memory read of {:08x}", address),
        }
        while (out.words.len() - start) * 2 < requested {
            out.u16(0);
        }
    }

    fn net_settings(&mut self, input: &mut PacketReader, id: u16, out: &mut Response) {

        let address = input.u32();
        let requested = input.u32();
        out.header(0, id, requested as usize + 4);
        out.u32(requested);
        if requested == 0 {
            return;
        }

        out.u16(0);
        let config = &self.config;
        match address {
            SETTING_IP_ADDRESS => out.bytes(&config.ip_address.octets()),
            SETTING_SUBNET_MASK => out.bytes(&config.subnet_mask.octets()),
            SETTING_DEFAULT_GATEWAY => out.bytes(&config.default_gateway.octets()),
            SETTING_DNS_SERVERS => {
                out.bytes(&config.dns_server1.octets());
                out.bytes(&config.dns_server2.octets());
            },
            SETTING_DOMAIN_NAME => out.bytes(&config.domain_name_bytes()),
            SETTING_DHCP_SERVER => out.bytes(&config.dhcp_server.octets()),
            SETTING_NTP_SERVER => out.bytes(&config.ntp_server.octets()),
            _ => {
                log::error!("npu: unknown network setting {:#x}", address);
                for _ in 0..requested.saturating_sub(2) / 2 {
                    out.u16(0);
                }
            },
        }
    }

    fn socket_opcode(&mut self, opcode: u16, input: &mut PacketReader, id: u16, out: &mut Response) {

        match opcode {
            OP_SOCKET_CLOSE => {
                let handle = input.u32();
                let status = match self.sockets.close(handle) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::debug!("npu: close({}) failed: {}", handle, err);
                        NET_FAILED
                    },
                };
                out.header(0, id, 4);
                out.i32(status);
            },
            OP_SOCKET_CONNECT => {
                let handle = input.u32();
                input.u32();
                let family = input.u16() as u32;
                let port = input.u16() as u32;
                let address = input.u32();
                let status = match self.sockets.connect(handle, family, port, address) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::debug!("npu: connect({}) failed: {}", handle, err);
                        NET_FAILED
                    },
                };
                out.header(0, id, 8);
                out.i32(status);
                out.u32(0);
            },
            OP_SOCKET_RECV => {
                let handle = input.u32();
                let len = input.u32() as usize;
                input.u32();
                match self.sockets.recv(handle, len) {
                    Ok(data) => {
                        out.header(0, id, (4 + data.len() + 1) & !1);
                        out.u32(data.len() as u32);
                        out.bytes(&data);
                    },
                    Err(err) => {
                        log::debug!("npu: recv({}) failed: {}", handle, err);
                        out.header(0, id, 4);
                        out.i32(NET_FAILED);
                    },
                }
            },
            OP_SOCKET_RECVFROM => {
                let handle = input.u32();
                let len = input.u32() as usize;
                input.u32();
                match self.sockets.recvfrom(handle, len) {
                    Ok((data, from)) => {
                        let (port, address) = encode_address(from);
                        out.header(0, id, (8 + data.len() + 20 + 1) & !1);
                        out.u32(data.len() as u32);
                        out.u32(SOCKADDR_BYTES);
                        out.u32(SOCKADDR_BYTES);
                        out.u16(2);
                        out.u16(port as u16);
                        out.u32(address);
                        out.bytes(&[0; 8]);
                        out.bytes(&data);
                    },
                    Err(err) => {
                        log::debug!("npu: recvfrom({}) failed: {}", handle, err);
                        out.header(0, id, 8);
                        out.i32(NET_FAILED);
                        out.u32(SOCKADDR_BYTES);
                    },
                }
            },
            OP_SOCKET_SEND => {
                let handle = input.u32();
                let len = input.u32() as usize;
                input.u32();
                let payload = input.bytes(len);
                let status = match self.sockets.send(handle, &payload) {
                    Ok(sent) => sent as i32,
                    Err(err) => {
                        log::debug!("npu: send({}) failed: {}", handle, err);
                        NET_FAILED
                    },
                };
                out.header(0, id, 4);
                out.i32(status);
            },
            OP_SOCKET_SENDTO => {
                let handle = input.u32();
                let len = input.u32() as usize;
                input.u32();
                input.u32();
                input.u16();
                let port = input.u16() as u32;
                let address = input.u32();
                input.bytes(8);
                let payload = input.bytes(len);
                let status = match self.sockets.sendto(handle, &payload, port, address) {
                    Ok(sent) => sent as i32,
                    Err(err) => {
                        log::debug!("npu: sendto({}) failed: {}", handle, err);
                        NET_FAILED
                    },
                };
                out.header(0, id, 8);
                out.i32(status);
                out.u32(0);
            },
            OP_SOCKET_SETSOCKOPT => {
                let handle = input.u32();
                let level = input.u32();
                let option = input.u32();
                let len = input.u32() as usize;
                let mut value = input.bytes(len);
                value.resize(4, 0);
                let value = u32::from_le_bytes([value[0], value[1], value[2], value[3]]) & 1;
                let status = match self.sockets.setsockopt(handle, level, option, value) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::debug!("npu: setsockopt({}) failed: {}", handle, err);
                        NET_FAILED
                    },
                };
                out.header(0, id, 4);
                out.i32(status);
            },
            OP_SOCKET_SOCKET => {
                let domain = input.u32();
                let kind = input.u32();
                let protocol = input.u32();
                let handle = match self.sockets.socket(domain, kind, protocol) {
                    Ok(handle) => handle as i32,
                    Err(err) => {
                        log::warn!("npu: socket({}, {}, {}) failed: {}", domain, kind, protocol, err);
                        NET_FAILED
                    },
                };
                out.header(0, id, 4);
                out.i32(handle);
            },
            _ => {
                log::warn!("npu: unhandled socket opcode {:02x}", opcode);
                out.header(0, id, 0);
            },
        }
    }

    fn device_for_target(&mut self, target: &str) -> Result<&mut PythonFs, FsError> {

        if target.starts_with("atam") {
            Ok(&mut self.hdd)
        } else if target.starts_with("ram") {
            Ok(&mut self.ramfs)
        } else {
            Err(FsError::NoDevice)
        }
    }

    fn device_for_fd(&mut self, fd: u32) -> Result<&mut PythonFs, FsError> {

        match fd & 0xF000_0000 {
            FD_MASK_HDD => Ok(&mut self.hdd),
            FD_MASK_RAM => Ok(&mut self.ramfs),
            _ => Err(FsError::BadDescriptor(fd)),
        }
    }

    fn filesystem_opcode(&mut self, opcode: u16, input: &mut PacketReader, id: u16, out: &mut Response) {

        let status = match opcode {
            OP_FS_INITIALIZE => {
                input.u32();
                input.u32();
                0
            },
            OP_FS_OPEN => {
                let target = input.string(LONG_STRING);
                let flags = input.u32();
                let mode = input.u32();
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.open(path_after_device(&target), flags, mode));
                fs_status(result, "open")
            },
            OP_FS_CLOSE => {
                let fd = input.u32();
                fs_status(self.device_for_fd(fd).and_then(|fs| fs.close(fd)).map(|_| 0), "close")
            },
            OP_FS_READ => {
                let fd = input.u32();
                let len = input.u32();
                match self.device_for_fd(fd).and_then(|fs| fs.read(fd, len)) {
                    Ok(data) => {
                        out.header(0, id, 4 + data.len());
                        out.u32(data.len() as u32);
                        out.bytes(&data);
                        return;
                    },
                    Err(err) => fs_status(Err(err), "read"),
                }
            },
            OP_FS_WRITE => {
                let fd = input.u32();
                let len = input.u32();
                let data = input.bytes(len as usize);
                fs_status(self.device_for_fd(fd).and_then(|fs| fs.write(fd, &data)).map(|_| len), "write")
            },
            OP_FS_LSEEK => {
                let fd = input.u32();
                let offset = input.u32();
                let whence = input.u32();
                fs_status(self.device_for_fd(fd).and_then(|fs| fs.lseek(fd, offset, whence)), "lseek")
            },
            OP_FS_DOPEN => {
                let target = input.string(LONG_STRING);
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.dopen(path_after_device(&target)));
                fs_status(result, "dopen")
            },
            OP_FS_DCLOSE => {
                let fd = input.u32();
                fs_status(self.device_for_fd(fd).and_then(|fs| fs.dclose(fd)).map(|_| 0), "dclose")
            },
            OP_FS_DREAD => {
                let fd = input.u32();
                match self.device_for_fd(fd).and_then(|fs| fs.dread(fd)) {
                    Ok(record) => {
                        out.header(0, id, 4 + record.len());
                        out.u32(record.len() as u32);
                        out.bytes(&record);
                    },
                    Err(err) => {
                        log::debug!("npu: dread failed: {}", err);
                        out.header(0, id, 4);
                        out.u32(0);
                    },
                }
                return;
            },
            OP_FS_REMOVE => {
                let target = input.string(LONG_STRING);
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.remove(path_after_device(&target)));
                fs_status(result.map(|_| 0), "remove")
            },
            OP_FS_MKDIR => {
                let target = input.string(LONG_STRING);
                let mode = input.u32();
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.mkdir(path_after_device(&target), mode));
                fs_status(result.map(|_| 0), "mkdir")
            },
            OP_FS_RMDIR => {
                let target = input.string(LONG_STRING);
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.rmdir(path_after_device(&target)));
                fs_status(result.map(|_| 0), "rmdir")
            },
            OP_FS_GETSTAT => {
                let target = input.string(LONG_STRING);
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.getstat(path_after_device(&target)));
                match result {
                    Ok(stat) => {
                        out.header(0, id, stat.len() + 4);
                        out.u32(0);
                        out.bytes(&stat);
                        return;
                    },
                    Err(err) => fs_status(Err(err), "getstat"),
                }
            },
            OP_FS_CHDIR => {
                let target = input.string(LONG_STRING);
                let result = self.device_for_target(&target)
                    .and_then(|fs| fs.chdir(path_after_device(&target)));
                fs_status(result.map(|_| 0), "chdir")
            },
            OP_FS_MOUNT => {
                let fs_type = input.string(SHORT_STRING);
                input.u32();
                let target = input.string(SHORT_STRING);
                input.u32();
                log::debug!("npu: mount {} on {}", fs_type, target);
                fs_status(self.device_for_target(&target).and_then(|fs| fs.mount()).map(|_| 0), "mount")
            },
            OP_FS_UMOUNT => {
                let target = input.string(SHORT_STRING);
                fs_status(self.device_for_target(&target).and_then(|fs| fs.umount()).map(|_| 0), "umount")
            },
            OP_FS_DEVCTL => {
                let target = input.string(SHORT_STRING);
                let request = input.u32();
                input.u32();
                let response_len = input.u32() as usize;

                let mut data = vec![0; response_len];
                let result = self.device_for_target(&target).and_then(|fs| fs.devctl(request));
                let status = match result {
                    Ok(words) => {
                        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                        let count = bytes.len().min(response_len);
                        data[..count].copy_from_slice(&bytes[..count]);
                        0
                    },
                    Err(err) => fs_status(Err(err), "devctl"),
                };
                out.header(0, id, response_len + 4);
                out.i32(status);
                out.bytes(&data);
                return;
            },
            OP_FS_FORMAT => {
                let target = input.string(SHORT_STRING);
                input.string(SHORT_STRING);
                input.u32();
                let start_lba = input.u32();
                let partition_count1 = input.u32();
                let partition_count2 = input.u32();
                let node_table_count = input.u32();
                let block_bytes = input.u32();
                let result = self.device_for_target(&target).and_then(|fs| {
                    fs.format(&target, start_lba, partition_count1, partition_count2, node_table_count, block_bytes)
                });
                fs_status(result.map(|_| 0), "format")
            },
            _ => {
                log::error!("npu: unimplemented filesystem opcode {:02x}", opcode);
                out.header(0, id, 0);
                return;
            },
        };

        out.header(0, id, 4);
        out.i32(status);
    }
}

/// This struct models the Konami 573 network PCB unit: a PC card whose
/// registers exchange packets through a pair of word FIFOs, with the packets
/// carried out on a worker thread so that socket and disk calls never block
/// the simulation.
pub struct K573NpuCard {

    // Register map.
    map: AddressMap<K573NpuCard>,

    // Handshake state.
    state_requested: u16,
    init_step: u16,
    scratch: u16,

    // FIFO transfer lengths.
    write_length: u32,
    read_length: u16,

    // FIFOs and worker.
    input: WordFifo,
    shared: Arc<NpuShared>,
    work_queue: WorkQueue<NpuWork>,
}

impl K573NpuCard {

    /// Creates the card, spawning its worker thread. The RAM disk is always
    /// present; the hard disk is optional.
    pub fn new(config: NpuConfig, hdd: Option<Box<dyn Storage>>) -> io::Result<Self> {

        let shared = Arc::new(NpuShared {
            output: Mutex::new(WordFifo::new()),
            current_state: AtomicU16::new(0),
        });

        let ram: Box<dyn Storage> = Box::new(MemoryStorage::new(RAM_DISK_BYTES));
        let worker = NpuWorker {
            config,
            hdd: PythonFs::new(FD_MASK_HDD, hdd),
            ramfs: PythonFs::new(FD_MASK_RAM, Some(ram)),
            sockets: SocketTable::new(),
            shared: shared.clone(),
        };

        Ok(K573NpuCard {
            map: Self::build_map(),
            state_requested: 0,
            init_step: 0,
            scratch: 0,
            write_length: 0,
            read_length: 0,
            input: WordFifo::new(),
            shared,
            work_queue: WorkQueue::new("npu worker", worker)?,
        })
    }

    fn build_map() -> AddressMap<K573NpuCard> {

        let mut map: AddressMap<K573NpuCard> = AddressMap::new(2);

        map.map(0x00, 0x01, Some(K573NpuCard::requested_state_r), Some(K573NpuCard::requested_state_w))
            .map_read(0x02, 0x03, K573NpuCard::current_state_r)
            .map_write(0x04, 0x05, K573NpuCard::init_step_w)
            .map_read(0x06, 0x07, K573NpuCard::constant_r::<5>);

        map.map(0x20, 0x21, Some(K573NpuCard::fifo_r), Some(K573NpuCard::fifo_w))
            .map_read(0x22, 0x23, K573NpuCard::read_length_r)
            .map_read(0x24, 0x25, K573NpuCard::input_space_r)
            .map_read(0x26, 0x27, K573NpuCard::read_length_r)
            .map_read(0x2C, 0x2D, K573NpuCard::input_space_r)
            .map(0x30, 0x31, Some(K573NpuCard::write_pending_r), Some(K573NpuCard::transfer_length_w))
            .map_read(0x32, 0x33, K573NpuCard::constant_r::<0>)
            .map(0x34, 0x35, Some(K573NpuCard::output_tail_r), Some(K573NpuCard::ignore_w))
            .map(0x36, 0x37, Some(K573NpuCard::input_tail_r), Some(K573NpuCard::ignore_w));

        map.map_read(0x3A, 0x3B, K573NpuCard::constant_r::<FPGA_RUNNING>)
            .map(0x3C, 0x3D, Some(K573NpuCard::scratch_r), Some(K573NpuCard::scratch_w));

        map
    }

    /// Returns the card to its power-on state, dropping queued packets and
    /// closing every file and socket.
    pub fn reset(&mut self) {

        self.state_requested = 0;
        self.init_step = 0;
        self.scratch = 0;
        self.write_length = 0;
        self.read_length = 0;
        self.input.clear();
        self.shared.output().clear();
        self.shared.current_state.store(0, Ordering::Release);

        self.work_queue.reset();
        self.work_queue.push(NpuWork::Reset);
    }

    /// Returns the number of words waiting in the output FIFO.
    pub fn output_words(&self) -> usize {
        self.shared.output().len_bytes() / 2
    }

    /// Returns true while packets are queued or being carried out.
    pub fn busy(&self) -> bool {
        self.work_queue.busy()
    }

    fn packet_mode(&self) -> bool {
        self.state_requested == 8 || self.state_requested == 0x0F
    }

    fn constant_r<const VALUE: u32>(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        VALUE
    }

    fn ignore_w(&mut self, _index: u32, _data: u32, _mem_mask: u32) {}

    fn requested_state_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.state_requested as u32
    }

    fn requested_state_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let previous = self.state_requested;
        let data = data as u16;
        self.state_requested = data;

        let mut current = data;
        if self.init_step > 0 {
            current ^= 0x0F;
            self.init_step -= 1;
        }
        self.shared.current_state.store(current, Ordering::Release);

        if data == 2 {
            self.input.drain_all();
            let mut output = self.shared.output();
            output.drain_all();
            for word in 0..STATE_2_FILL_WORDS {
                output.push(word);
            }
        } else if previous == 8 && data == 0x0F {
            // The game waits for this before it believes the card is running.
            let mut output = self.shared.output();
            output.clear();
            output.extend(&[1, 0, 0]);
        }
    }

    fn current_state_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.shared.current_state.load(Ordering::Acquire) as u32
    }

    fn init_step_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.init_step = if data != 0 { 5 } else { 0 };
    }

    fn fifo_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        let mut word = self.shared.output().pop().unwrap_or(0);
        if !self.packet_mode() {
            word ^= 0xFFFF;
        }
        self.read_length = self.read_length.saturating_sub(1);
        word as u32
    }

    fn fifo_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if self.write_length == 0 {
            return;
        }

        self.input.push(data as u16);
        self.write_length -= 1;

        if self.write_length == 0 && self.packet_mode() {
            let length = self.input.at(2).unwrap_or(0) as usize;
            let words = ((length + 1) & !1) / 2 + 3;
            let packet = self.input.take(words);
            self.work_queue.push(NpuWork::Packet(packet));
        }
    }

    fn read_length_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.read_length as u32
    }

    fn input_space_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (0x100 - self.input.len_bytes() % 0x100) as u32
    }

    fn write_pending_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (self.write_length > 0) as u32
    }

    fn transfer_length_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if data & 0x8000 != 0 {
            self.read_length = (data & 0x7FFF) as u16;
        } else {
            self.write_length = self.write_length.wrapping_add(data & 0xFFFF);
        }
    }

    fn output_tail_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.shared.output().tail() as u32 & 0xFFFF
    }

    fn input_tail_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.input.tail() as u32 & 0xFFFF
    }

    fn scratch_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.scratch as u32
    }

    fn scratch_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.scratch = data as u16;
    }
}

impl Bus for K573NpuCard {

    fn read(&mut self, offset: u32, mem_mask: u32) -> u32 {

        let address = self.map.byte_address(offset);
        match self.map.find_read(address) {
            Some((read, index)) => read(self, index, mem_mask) & mem_mask,
            None => {
                log::trace!("npu: unmapped read {:02x}", address);
                0
            },
        }
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let address = self.map.byte_address(offset);
        match self.map.find_write(address) {
            Some((write, index)) => write(self, index, data & mem_mask, mem_mask),
            None => log::warn!("npu: unmapped write {:02x} = {:04x}", address, data),
        }
    }
}

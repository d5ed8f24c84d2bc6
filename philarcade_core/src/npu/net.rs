// SPDX-License-Identifier: GPL-3.0
// net.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream, UdpSocket};
use thiserror::Error;

use super::FIFO_BYTES;

const AF_INET: u32 = 2;
const SOCK_STREAM: u32 = 1;
const SOCK_DGRAM: u32 = 2;
const SOCK_RAW: u32 = 3;
const IPPROTO_ICMP: u32 = 2;
const IPPROTO_UDP: u32 = 3;
const SOL_SOCKET: u32 = 0xFFFF;
const SO_BROADCAST: u32 = 0x20;

/// Socket handles handed to the game start here.
const FIRST_HANDLE: u32 = 3;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("unknown socket handle {0}")]
    UnknownHandle(u32),

    #[error("unsupported socket request (domain {domain}, type {kind}, protocol {protocol})")]
    Unsupported { domain: u32, kind: u32, protocol: u32 },

    #[error("socket {0} is not connected")]
    NotConnected(u32),

    #[error("socket io error: {0}")]
    Io(#[from] io::Error),
}

/// Decodes an address as the game lays it out: the port and address words
/// hold network order bytes read as little endian values.
pub fn decode_address(port: u32, address: u32) -> SocketAddrV4 {

    let port_bytes = (port as u16).to_le_bytes();
    SocketAddrV4::new(Ipv4Addr::from(address.to_le_bytes()), u16::from_be_bytes(port_bytes))
}

/// Encodes an address back into the game's port and address words.
pub fn encode_address(address: SocketAddrV4) -> (u32, u32) {

    let port = u16::from_le_bytes(address.port().to_be_bytes()) as u32;
    (port, u32::from_le_bytes(address.ip().octets()))
}

enum Socket {
    Stream(Option<TcpStream>),
    Datagram(UdpSocket),
}

/// This struct maps the game's socket handles onto host sockets.
pub struct SocketTable {
    sockets: HashMap<u32, Socket>,
    next_handle: u32,
}

impl Default for SocketTable {

    fn default() -> Self {
        SocketTable::new()
    }
}

impl SocketTable {

    pub fn new() -> Self {
        SocketTable {
            sockets: HashMap::new(),
            next_handle: FIRST_HANDLE,
        }
    }

    /// Closes every socket.
    pub fn reset(&mut self) {

        self.sockets.clear();
        self.next_handle = FIRST_HANDLE;
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Creates a socket and returns its handle. Streams are opened on connect.
    pub fn socket(&mut self, domain: u32, kind: u32, protocol: u32) -> Result<u32, NetError> {

        let socket = match (domain, kind, protocol) {
            (AF_INET, SOCK_STREAM, 0 | 1) => Socket::Stream(None),
            (AF_INET, SOCK_DGRAM, IPPROTO_UDP) => {
                Socket::Datagram(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?)
            },
            (AF_INET, SOCK_RAW, IPPROTO_ICMP) => {
                log::warn!("npu: raw ICMP sockets are not supported");
                return Err(NetError::Unsupported { domain, kind, protocol });
            },
            _ => return Err(NetError::Unsupported { domain, kind, protocol }),
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        self.sockets.insert(handle, socket);
        log::debug!("npu: socket {} created (type {}, protocol {})", handle, kind, protocol);
        Ok(handle)
    }

    fn get(&mut self, handle: u32) -> Result<&mut Socket, NetError> {
        self.sockets.get_mut(&handle).ok_or(NetError::UnknownHandle(handle))
    }

    pub fn connect(&mut self, handle: u32, family: u32, port: u32, address: u32) -> Result<(), NetError> {

        if family != AF_INET {
            return Err(NetError::Unsupported { domain: family, kind: 0, protocol: 0 });
        }
        let target = decode_address(port, address);

        match self.get(handle)? {
            Socket::Stream(stream) => {
                *stream = Some(TcpStream::connect(target)?);
            },
            Socket::Datagram(socket) => socket.connect(target)?,
        }
        log::debug!("npu: socket {} connected to {}", handle, target);
        Ok(())
    }

    pub fn send(&mut self, handle: u32, data: &[u8]) -> Result<usize, NetError> {

        match self.get(handle)? {
            Socket::Stream(Some(stream)) => Ok(stream.write(data)?),
            Socket::Stream(None) => Err(NetError::NotConnected(handle)),
            Socket::Datagram(socket) => Ok(socket.send(data)?),
        }
    }

    /// Receives up to `len` bytes, blocking until some arrive. The reply has to
    /// fit in the card's FIFO, so `len` is capped to it.
    pub fn recv(&mut self, handle: u32, len: usize) -> Result<Vec<u8>, NetError> {

        let mut buffer = vec![0; len.min(FIFO_BYTES)];
        let count = match self.get(handle)? {
            Socket::Stream(Some(stream)) => stream.read(&mut buffer)?,
            Socket::Stream(None) => return Err(NetError::NotConnected(handle)),
            Socket::Datagram(socket) => socket.recv(&mut buffer)?,
        };
        buffer.truncate(count);
        Ok(buffer)
    }

    pub fn sendto(&mut self, handle: u32, data: &[u8], port: u32, address: u32) -> Result<usize, NetError> {

        let target = decode_address(port, address);
        match self.get(handle)? {
            Socket::Datagram(socket) => Ok(socket.send_to(data, target)?),
            Socket::Stream(Some(stream)) => Ok(stream.write(data)?),
            Socket::Stream(None) => Err(NetError::NotConnected(handle)),
        }
    }

    /// Receives a datagram and returns it with the sender's address.
    pub fn recvfrom(&mut self, handle: u32, len: usize) -> Result<(Vec<u8>, SocketAddrV4), NetError> {

        let mut buffer = vec![0; len.min(FIFO_BYTES)];
        let (count, from) = match self.get(handle)? {
            Socket::Datagram(socket) => socket.recv_from(&mut buffer)?,
            Socket::Stream(Some(stream)) => (stream.read(&mut buffer)?, stream.peer_addr()?),
            Socket::Stream(None) => return Err(NetError::NotConnected(handle)),
        };
        buffer.truncate(count);

        let from = match from {
            std::net::SocketAddr::V4(v4) => v4,
            std::net::SocketAddr::V6(v6) => SocketAddrV4::new(v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED), v6.port()),
        };
        Ok((buffer, from))
    }

    /// Only broadcast on datagram sockets is applied. Other options are
    /// accepted and ignored.
    pub fn setsockopt(&mut self, handle: u32, level: u32, option: u32, value: u32) -> Result<(), NetError> {

        let socket = self.get(handle)?;
        match (level, option, socket) {
            (SOL_SOCKET, SO_BROADCAST, Socket::Datagram(socket)) => socket.set_broadcast(value != 0)?,
            _ => log::debug!("npu: socket {} option {:#x}/{:#x} ignored", handle, level, option),
        }
        Ok(())
    }

    pub fn close(&mut self, handle: u32) -> Result<(), NetError> {

        self.sockets.remove(&handle).ok_or(NetError::UnknownHandle(handle))?;
        log::debug!("npu: socket {} closed", handle);
        Ok(())
    }
}

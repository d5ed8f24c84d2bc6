// SPDX-License-Identifier: GPL-3.0
// config.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

/// Longest domain name the card reports, in bytes.
pub const DOMAIN_NAME_BYTES: usize = 32;

/// Errors raised while parsing one line of the settings file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NpuConfigError {
    #[error("line has a key but no value: {0:?}")]
    MissingValue(String),

    #[error("unknown key {0:?}")]
    UnknownKey(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// This struct holds the network settings the card hands to the game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpuConfig {
    pub npu_id: [u8; 8],
    pub mac_address: [u8; 6],
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub default_gateway: Ipv4Addr,
    pub dns_server1: Ipv4Addr,
    pub dns_server2: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
    pub ntp_server: Ipv4Addr,
    pub domain_name: String,
}

impl Default for NpuConfig {

    fn default() -> Self {
        NpuConfig {
            npu_id: [0; 8],
            mac_address: [0; 6],
            ip_address: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            default_gateway: Ipv4Addr::UNSPECIFIED,
            dns_server1: Ipv4Addr::UNSPECIFIED,
            dns_server2: Ipv4Addr::UNSPECIFIED,
            dhcp_server: Ipv4Addr::UNSPECIFIED,
            ntp_server: Ipv4Addr::UNSPECIFIED,
            domain_name: String::new(),
        }
    }
}

impl NpuConfig {

    /// Reads settings from a file. A file that cannot be read leaves every
    /// setting zeroed.
    pub fn load(path: &Path) -> Self {

        match fs::read_to_string(path) {
            Ok(text) => NpuConfig::parse(&text),
            Err(err) => {
                log::error!("npu: can't open settings file {}: {}", path.display(), err);
                NpuConfig::default()
            },
        }
    }

    /// Parses settings text. Lines that don't parse are logged and skipped.
    pub fn parse(text: &str) -> Self {

        let mut config = NpuConfig::default();
        for line in text.lines() {
            if let Err(err) = config.apply_line(line) {
                log::warn!("npu: ignoring settings line {:?}: {}", line, err);
            }
        }
        config
    }

    fn apply_line(&mut self, line: &str) -> Result<(), NpuConfigError> {

        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let Some(split) = line.find(char::is_whitespace) else {
            return Err(NpuConfigError::MissingValue(line.to_string()));
        };
        let (key, rest) = line.split_at(split);
        let value = strip_comment(rest.trim_start()).trim();
        log::debug!("npu: config {} {}", key, value);

        self.apply(key, value)
    }

    /// Sets one key. Keys are matched without regard to case.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), NpuConfigError> {

        let invalid = || NpuConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key.to_ascii_lowercase().as_str() {
            "npu_id" => self.npu_id = parse_hex_id(value).ok_or_else(invalid)?,
            "mac_address" => self.mac_address = parse_mac_address(value).ok_or_else(invalid)?,
            "ip_address" => self.ip_address = parse_ip_address(value).ok_or_else(invalid)?,
            "subnet_mask" => self.subnet_mask = parse_ip_address(value).ok_or_else(invalid)?,
            "default_gateway" => self.default_gateway = parse_ip_address(value).ok_or_else(invalid)?,
            "dns_server1" => self.dns_server1 = parse_ip_address(value).ok_or_else(invalid)?,
            "dns_server2" => self.dns_server2 = parse_ip_address(value).ok_or_else(invalid)?,
            "dhcp_server" => self.dhcp_server = parse_ip_address(value).ok_or_else(invalid)?,
            "ntp_server" => self.ntp_server = parse_ip_address(value).ok_or_else(invalid)?,
            "domain_name" => self.domain_name = parse_quoted(value).ok_or_else(invalid)?,
            _ => return Err(NpuConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Returns the domain name zero padded to its fixed field size.
    pub fn domain_name_bytes(&self) -> [u8; DOMAIN_NAME_BYTES] {

        let mut bytes = [0; DOMAIN_NAME_BYTES];
        for (slot, byte) in bytes.iter_mut().zip(self.domain_name.bytes()) {
            *slot = byte;
        }
        bytes
    }
}

/// Cuts a value at the first `#` that is not inside quotes.
fn strip_comment(value: &str) -> &str {

    let mut in_quotes = false;
    for (index, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &value[..index],
            _ => {},
        }
    }
    value
}

/// Parses a hex string of any length, right aligned into the id so short
/// strings fill the low bytes.
fn parse_hex_id(value: &str) -> Option<[u8; 8]> {

    if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let mut id = [0; 8];
    let digits = value.as_bytes();
    for (slot, chunk) in id.iter_mut().rev().zip(digits.rchunks(2)) {
        let text = std::str::from_utf8(chunk).ok()?;
        *slot = u8::from_str_radix(text, 16).ok()?;
    }
    Some(id)
}

/// Parses six colon separated hex groups. Only the last two digits of a
/// group count.
fn parse_mac_address(value: &str) -> Option<[u8; 6]> {

    let mut mac = [0; 6];
    let mut groups = 0;
    for (index, group) in value.split(':').enumerate() {
        if index >= mac.len() || group.is_empty() || !group.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let digits = &group[group.len().saturating_sub(2)..];
        mac[index] = u8::from_str_radix(digits, 16).ok()?;
        groups += 1;
    }
    (groups == mac.len()).then_some(mac)
}

fn parse_ip_address(value: &str) -> Option<Ipv4Addr> {
    value.parse().ok()
}

/// Returns the text between the opening quote and the next quote, cut to the
/// field size.
fn parse_quoted(value: &str) -> Option<String> {

    let inner = value.strip_prefix('"')?;
    let end = inner.find('"')?;
    let mut name = inner[..end].to_string();
    while name.len() > DOMAIN_NAME_BYTES {
        name.pop();
    }
    Some(name)
}

// SPDX-License-Identifier: GPL-3.0
// pythonfs.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::storage::{Sector, Storage, StorageError, SECTOR_SIZE};
use std::collections::HashMap;
use thiserror::Error;

/// Marks the last block of a chain in the block table.
pub const BLOCK_END: u32 = 0x00FF_FFFF;

/// Directory entry offset bit flagging a folder.
pub const ATTRIB_IS_FOLDER: u32 = 1 << 24;

/// Open flags.
pub const OPEN_READ: u32 = 0x01;
pub const OPEN_WRITE: u32 = 0x02;
pub const OPEN_NEW: u32 = 0x200;

/// File descriptor masks for the two devices on the card.
pub const FD_MASK_HDD: u32 = 0x00000000;
pub const FD_MASK_RAM: u32 = 0x40000000;

/// Sizes of the records handed back to the game.
pub const STAT_BYTES: usize = 0x40;
pub const DIRENT_BYTES: usize = 0x144;

const BLOCK_MASK: u32 = 0x00FF_FFFF;
const MAGIC: &[u8; 8] = b"PythonFS";
const ENTRY_BYTES: usize = 32;
const NAME_BYTES: usize = 20;
const DIRENT_NAME_OFFSET: usize = STAT_BYTES;
const NEW_ENTRY_UNK: u32 = 0x01DF_E200;
const ROOT_BLOCK: u32 = 1;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no storage device attached")]
    NoDevice,

    #[error("bad file descriptor {0:#x}")]
    BadDescriptor(u32),

    #[error("no filesystem mounted")]
    NotMounted,

    #[error("{0:?} not found")]
    NotFound(String),

    #[error("{0:?} is not a folder")]
    NotAFolder(String),

    #[error("folder {0:?} is not empty")]
    NotEmpty(String),

    #[error("no free blocks")]
    NoSpace,

    #[error("descriptor {0:#x} is not open for writing")]
    NotWritable(u32),

    #[error("seek to {0} is outside the file")]
    BadSeek(i64),

    #[error("block chain is broken at block {0}")]
    BrokenChain(u32),

    #[error("no PythonFS header at sector {0}")]
    BadHeader(u64),

    #[error("invalid format parameters: {0}")]
    BadGeometry(&'static str),

    #[error("unsupported device control request {0}")]
    Unsupported(u32),

    #[error("end of folder")]
    EndOfFolder,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FsError {

    /// Returns the negative status code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            FsError::NoDevice => -1,
            FsError::BadDescriptor(_) => -2,
            FsError::NotMounted => -3,
            FsError::NotFound(_) => -4,
            FsError::NotAFolder(_) => -5,
            FsError::NotEmpty(_) => -6,
            FsError::NoSpace => -7,
            FsError::NotWritable(_) => -8,
            FsError::BadSeek(_) => -9,
            FsError::BrokenChain(_) => -10,
            FsError::BadHeader(_) => -11,
            FsError::BadGeometry(_) => -12,
            FsError::Unsupported(_) => -13,
            FsError::EndOfFolder => -14,
            FsError::Storage(_) => -15,
        }
    }
}

fn be32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn put_be32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_le32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// The first sector of a partition. Multi-byte fields are big endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionHeader {
    pub partition_count1: u8,
    pub partition_count2: u8,
    pub block_size_mult: u8,
    pub node_table_count: u8,
    pub total_sectors: u32,
    pub node_table_sectors: u32,
    pub data_sector_offset: u32,
    pub unk1: u32,
}

impl PartitionHeader {

    /// Decodes a header, checking both magic strings.
    fn decode(sector: &Sector) -> Option<Self> {

        if &sector[4..12] != MAGIC || sector[12..20].iter().zip(MAGIC).any(|(a, b)| *a != !b) {
            return None;
        }

        let header = PartitionHeader {
            partition_count1: sector[20],
            partition_count2: sector[21],
            block_size_mult: sector[22],
            node_table_count: sector[23],
            total_sectors: be32(sector, 24),
            node_table_sectors: be32(sector, 28),
            data_sector_offset: be32(sector, 32),
            unk1: be32(sector, 36),
        };
        (header.block_size_mult <= 16).then_some(header)
    }

    fn encode(&self) -> Sector {

        let mut sector = [0; SECTOR_SIZE];
        sector[4..12].copy_from_slice(MAGIC);
        for (slot, byte) in sector[12..20].iter_mut().zip(MAGIC) {
            *slot = !byte;
        }
        sector[20] = self.partition_count1;
        sector[21] = self.partition_count2;
        sector[22] = self.block_size_mult;
        sector[23] = self.node_table_count;
        put_be32(&mut sector, 24, self.total_sectors);
        put_be32(&mut sector, 28, self.node_table_sectors);
        put_be32(&mut sector, 32, self.data_sector_offset);
        put_be32(&mut sector, 36, self.unk1);
        sector
    }

    pub fn block_size(&self) -> usize {
        SECTOR_SIZE << self.block_size_mult
    }
}

/// One 32-byte folder entry: a 20-byte name, then big-endian size, an
/// unknown word and the first block tagged with attribute bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u32,
    pub unk: u32,
    pub offset: u32,
}

impl DirEntry {

    pub fn new(name: &str, size: u32, unk: u32, offset: u32) -> Self {
        DirEntry {
            name: name.to_string(),
            size,
            unk,
            offset,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.offset & ATTRIB_IS_FOLDER != 0
    }

    pub fn block(&self) -> u32 {
        self.offset & BLOCK_MASK
    }

    pub fn attributes(&self) -> u32 {
        self.offset >> 24
    }

    /// Decodes an entry. An empty name ends the folder.
    fn decode(bytes: &[u8]) -> Option<Self> {

        let name = &bytes[..NAME_BYTES];
        let length = name.iter().position(|b| *b == 0).unwrap_or(NAME_BYTES);
        if length == 0 {
            return None;
        }

        Some(DirEntry {
            name: String::from_utf8_lossy(&name[..length]).into_owned(),
            size: be32(bytes, 20),
            unk: be32(bytes, 24),
            offset: be32(bytes, 28),
        })
    }

    fn encode(&self, bytes: &mut [u8]) {

        let name = self.name.as_bytes();
        let length = name.len().min(NAME_BYTES - 1);
        bytes[..NAME_BYTES].fill(0);
        bytes[..length].copy_from_slice(&name[..length]);
        put_be32(bytes, 20, self.size);
        put_be32(bytes, 24, self.unk);
        put_be32(bytes, 28, self.offset);
    }
}

fn read_at(storage: &mut dyn Storage, address: u64, buffer: &mut [u8]) -> Result<(), FsError> {

    let mut sector = [0; SECTOR_SIZE];
    let mut done = 0;
    while done < buffer.len() {
        let position = address + done as u64;
        let offset = (position % SECTOR_SIZE as u64) as usize;
        let count = (SECTOR_SIZE - offset).min(buffer.len() - done);

        storage.read_sector(position / SECTOR_SIZE as u64, &mut sector)?;
        buffer[done..done + count].copy_from_slice(&sector[offset..offset + count]);
        done += count;
    }
    Ok(())
}

fn write_at(storage: &mut dyn Storage, address: u64, data: &[u8]) -> Result<(), FsError> {

    let mut sector = [0; SECTOR_SIZE];
    let mut done = 0;
    while done < data.len() {
        let position = address + done as u64;
        let lba = position / SECTOR_SIZE as u64;
        let offset = (position % SECTOR_SIZE as u64) as usize;
        let count = (SECTOR_SIZE - offset).min(data.len() - done);

        // Partial sectors keep the bytes around the write.
        if count < SECTOR_SIZE {
            storage.read_sector(lba, &mut sector)?;
        }
        sector[offset..offset + count].copy_from_slice(&data[done..done + count]);
        storage.write_sector(lba, &sector)?;
        done += count;
    }
    Ok(())
}

/// Joins a path onto the current folder, giving an absolute path with no
/// empty components and no trailing slash.
fn resolve(cwd: &str, path: &str) -> String {

    let base = if path.starts_with('/') { "" } else { cwd };
    let parts: Vec<&str> = base.split('/').chain(path.split('/')).filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Splits an absolute path into its folder and final name.
fn split_parent(path: &str) -> (String, String) {

    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(index) => (path[..index].to_string(), path[index + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn is_chain_end(block: u32) -> bool {
    block == BLOCK_END || block == 0
}

/// The mounted partition: its header and in-memory block table.
struct Partition {
    header: PartitionHeader,
    blocks: Vec<u32>,
    offset: u64,
    cwd: String,
}

impl Partition {

    fn load(storage: &mut dyn Storage, start_sector: u64) -> Result<Self, FsError> {

        let mut sector = [0; SECTOR_SIZE];
        storage.read_sector(start_sector, &mut sector)?;
        let header = PartitionHeader::decode(&sector).ok_or(FsError::BadHeader(start_sector))?;

        let mut blocks = Vec::with_capacity(header.node_table_sectors as usize * SECTOR_SIZE / 4);
        for index in 0..header.node_table_sectors as u64 {
            storage.read_sector(start_sector + 1 + index, &mut sector)?;
            blocks.extend(sector.chunks_exact(4).map(|word| be32(word, 0)));
        }

        let partition = Partition {
            header,
            blocks,
            offset: start_sector * SECTOR_SIZE as u64,
            cwd: "/".to_string(),
        };
        partition.find_folder(storage, "/")?;
        Ok(partition)
    }

    fn block_size(&self) -> usize {
        self.header.block_size()
    }

    fn block_address(&self, block: u32) -> u64 {
        self.offset
            + self.header.data_sector_offset as u64 * SECTOR_SIZE as u64
            + (block as u64).saturating_sub(1) * self.block_size() as u64
    }

    fn next_block(&self, block: u32) -> u32 {
        self.blocks.get(block as usize).copied().unwrap_or(0)
    }

    fn is_valid_block(&self, block: u32) -> bool {
        block != 0 && block != BLOCK_END && (block as usize) < self.blocks.len()
    }

    /// Returns every block of the chain starting at `first`.
    fn chain(&self, first: u32) -> Result<Vec<u32>, FsError> {

        if !self.is_valid_block(first) {
            return Err(FsError::BrokenChain(first));
        }

        let mut chain = vec![first];
        let mut block = self.next_block(first);
        while !is_chain_end(block) {
            if !self.is_valid_block(block) || chain.len() >= self.blocks.len() {
                return Err(FsError::BrokenChain(block));
            }
            chain.push(block);
            block = self.next_block(block);
        }
        Ok(chain)
    }

    /// Returns the `index`th block of a chain, if the chain is that long.
    fn block_at(&self, first: u32, index: usize) -> Result<Option<u32>, FsError> {
        Ok(self.chain(first)?.get(index).copied())
    }

    /// Claims `count` free blocks, contiguous if possible, and links them
    /// into a chain of their own.
    fn allocate(&mut self, count: usize) -> Result<Vec<u32>, FsError> {

        let free: Vec<u32> = (ROOT_BLOCK + 1..self.blocks.len() as u32)
            .filter(|block| self.blocks[*block as usize] == 0)
            .collect();
        if free.len() < count {
            return Err(FsError::NoSpace);
        }

        let contiguous = free.windows(count).find(|run| run[count - 1] - run[0] == count as u32 - 1);
        let list = match contiguous {
            Some(run) => run.to_vec(),
            None => free[..count].to_vec(),
        };

        for pair in list.windows(2) {
            self.blocks[pair[0] as usize] = pair[1];
        }
        if let Some(last) = list.last() {
            self.blocks[*last as usize] = BLOCK_END;
        }
        Ok(list)
    }

    /// Returns the `index`th block of a file, growing its chain as needed.
    fn block_for_write(&mut self, first: u32, index: usize) -> Result<u32, FsError> {

        let mut chain = self.chain(first)?;
        while chain.len() <= index {
            let extra = self.allocate(1)?;
            let last = chain[chain.len() - 1];
            self.blocks[last as usize] = extra[0];
            chain.push(extra[0]);
        }
        Ok(chain[index])
    }

    fn free_chain(&mut self, first: u32) -> Result<(), FsError> {

        for block in self.chain(first)? {
            self.blocks[block as usize] = 0;
        }
        Ok(())
    }

    fn write_table(&self, storage: &mut dyn Storage) -> Result<(), FsError> {

        let first_lba = self.offset / SECTOR_SIZE as u64 + 1;
        for (index, words) in self.blocks.chunks(SECTOR_SIZE / 4).enumerate() {
            let mut sector = [0; SECTOR_SIZE];
            for (slot, word) in sector.chunks_exact_mut(4).zip(words) {
                slot.copy_from_slice(&word.to_be_bytes());
            }
            storage.write_sector(first_lba + index as u64, &sector)?;
        }
        Ok(())
    }

    fn read_folder_at(&self, storage: &mut dyn Storage, first: u32) -> Result<Vec<DirEntry>, FsError> {

        let mut entries = Vec::new();
        let mut buffer = vec![0; self.block_size()];
        for block in self.chain(first)? {
            read_at(storage, self.block_address(block), &mut buffer)?;
            for bytes in buffer.chunks_exact(ENTRY_BYTES) {
                match DirEntry::decode(bytes) {
                    Some(entry) => entries.push(entry),
                    None => break,
                }
            }
        }
        Ok(entries)
    }

    /// Walks an absolute path from the root, returning the folder's first
    /// block and its entries.
    fn find_folder(&self, storage: &mut dyn Storage, path: &str) -> Result<(u32, Vec<DirEntry>), FsError> {

        let mut block = ROOT_BLOCK;
        let mut entries = self.read_folder_at(storage, block)?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let entry = entries
                .iter()
                .find(|e| e.name == part)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if !entry.is_folder() {
                return Err(FsError::NotAFolder(path.to_string()));
            }
            block = entry.block();
            entries = self.read_folder_at(storage, block)?;
        }

        // Every folder holds at least "." and "..".
        if entries.len() < 2 {
            return Err(FsError::BrokenChain(block));
        }
        Ok((block, entries))
    }

    /// Rewrites a folder's blocks with the given entries, resizing its chain.
    fn write_folder(&mut self, storage: &mut dyn Storage, first: u32, entries: &[DirEntry]) -> Result<(), FsError> {

        let per_block = self.block_size() / ENTRY_BYTES;
        let needed = entries.len().div_ceil(per_block).max(1);

        let mut chain = self.chain(first)?;
        if chain.len() < needed {
            let extra = self.allocate(needed - chain.len())?;
            let last = chain[chain.len() - 1];
            self.blocks[last as usize] = extra[0];
            chain.extend(extra);
        } else if chain.len() > needed {
            self.blocks[chain[needed - 1] as usize] = BLOCK_END;
            for block in chain.drain(needed..) {
                self.blocks[block as usize] = 0;
            }
        }

        let mut buffer = vec![0; self.block_size()];
        for (block, group) in chain.iter().zip(entries.chunks(per_block).chain(std::iter::repeat(&[][..]))) {
            buffer.fill(0);
            for (bytes, entry) in buffer.chunks_exact_mut(ENTRY_BYTES).zip(group) {
                entry.encode(bytes);
            }
            write_at(storage, self.block_address(*block), &buffer)?;
        }

        self.write_table(storage)
    }

    /// Adds an entry to a folder, replacing (and freeing) one of the same name.
    fn add_entry(&mut self, storage: &mut dyn Storage, folder: &str, entry: DirEntry) -> Result<(), FsError> {

        let (block, mut entries) = self.find_folder(storage, folder)?;
        match entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => {
                if existing.block() != entry.block() && self.is_valid_block(existing.block()) {
                    self.free_chain(existing.block())?;
                }
                *existing = entry;
            },
            None => entries.push(entry),
        }
        self.write_entries(storage, block, entries)
    }

    fn remove_entry(&mut self, storage: &mut dyn Storage, folder: &str, name: &str) -> Result<(), FsError> {

        let (block, mut entries) = self.find_folder(storage, folder)?;
        let index = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| FsError::NotFound(format!("{}/{}", folder, name)))?;
        entries.remove(index);
        self.write_entries(storage, block, entries)
    }

    /// Updates the "." entry's size to match the folder and writes it out.
    fn write_entries(&mut self, storage: &mut dyn Storage, block: u32, mut entries: Vec<DirEntry>) -> Result<(), FsError> {

        let size = (entries.len() * ENTRY_BYTES) as u32;
        if let Some(this) = entries.iter_mut().find(|e| e.name == ".") {
            this.size = size;
        }
        self.write_folder(storage, block, &entries)
    }
}

struct OpenFile {
    flags: u32,
    folder: String,
    entry: DirEntry,
    position: u32,
}

struct OpenFolder {
    entries: Vec<DirEntry>,
    index: usize,
}

enum Handle {
    File(OpenFile),
    Folder(OpenFolder),
}

fn mounted<'a>(
    storage: &'a mut Option<Box<dyn Storage>>,
    partition: &'a mut Option<Partition>,
) -> Result<(&'a mut dyn Storage, &'a mut Partition), FsError> {

    let storage = storage.as_deref_mut().ok_or(FsError::NoDevice)?;
    let partition = partition.as_mut().ok_or(FsError::NotMounted)?;
    Ok((storage, partition))
}

/// Parses the size suffix of a format target such as `"ram0:,8M"` into
/// sectors.
fn parse_format_size(target: &str) -> u32 {

    let after_comma = target.split_once(',').map(|(_, rest)| rest).unwrap_or("");
    let digits_start = after_comma.find(|c: char| c.is_ascii_digit()).unwrap_or(after_comma.len());
    let rest = &after_comma[digits_start..];
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let size: u32 = rest[..digits_end].parse().unwrap_or(0);

    match rest[digits_end..].chars().next() {
        Some('k') => size << 1,
        Some('M') => size << 11,
        Some('G') => size << 21,
        _ => 0,
    }
}

/// This struct is one PythonFS device on the card: a storage device, the
/// partition mounted from it and the descriptors opened on it.
pub struct PythonFs {
    storage: Option<Box<dyn Storage>>,
    partition: Option<Partition>,
    handles: HashMap<u32, Handle>,
    fd_mask: u32,
    next_fd: u32,
}

impl PythonFs {

    /// Creates a device whose descriptors carry `fd_mask` in their top bits.
    pub fn new(fd_mask: u32, storage: Option<Box<dyn Storage>>) -> Self {
        PythonFs {
            storage,
            partition: None,
            handles: HashMap::new(),
            fd_mask,
            next_fd: fd_mask,
        }
    }

    /// Unmounts and closes everything without writing anything back.
    pub fn reset(&mut self) {

        self.partition = None;
        self.handles.clear();
        self.next_fd = self.fd_mask;
    }

    pub fn has_device(&self) -> bool {
        self.storage.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        self.partition.is_some()
    }

    /// Returns the current folder.
    pub fn cwd(&self) -> Option<&str> {
        self.partition.as_ref().map(|p| p.cwd.as_str())
    }

    fn next_fd(&mut self) -> u32 {

        let mut fd = self.next_fd;
        while self.handles.contains_key(&fd) {
            fd = fd.wrapping_add(1);
        }
        self.next_fd = fd.wrapping_add(1);
        fd
    }

    fn absolute(&self, path: &str) -> String {
        resolve(self.cwd().unwrap_or("/"), path)
    }

    /// Mounts the partition whose header is at sector 8, or else sector 0.
    pub fn mount(&mut self) -> Result<(), FsError> {

        let storage = self.storage.as_deref_mut().ok_or(FsError::NoDevice)?;
        let partition = match Partition::load(storage, 8) {
            Ok(partition) => partition,
            Err(err) => {
                log::debug!("pythonfs: no partition at sector 8 ({}), trying sector 0", err);
                Partition::load(storage, 0)?
            },
        };
        log::debug!("pythonfs: mounted {:?}", partition.header);
        self.partition = Some(partition);
        Ok(())
    }

    /// Games unmount and remount the same disk, so the partition stays loaded.
    pub fn umount(&mut self) -> Result<(), FsError> {

        if !self.has_device() {
            return Err(FsError::NoDevice);
        }
        Ok(())
    }

    /// Writes an empty filesystem and mounts it. `target` carries the drive
    /// size after a comma, such as `"ram0:,8M"`.
    pub fn format(
        &mut self,
        target: &str,
        start_lba: u32,
        partition_count1: u32,
        partition_count2: u32,
        node_table_count: u32,
        block_bytes: u32,
    ) -> Result<(), FsError> {

        let storage = self.storage.as_deref_mut().ok_or(FsError::NoDevice)?;

        let drive_size = parse_format_size(target);
        let partitions = partition_count1
            .checked_add(partition_count2)
            .ok_or(FsError::BadGeometry("too many partitions"))?;
        if partitions == 0 {
            return Err(FsError::BadGeometry("no partitions"));
        }
        if drive_size <= start_lba {
            return Err(FsError::BadGeometry("drive smaller than start sector"));
        }
        if node_table_count == 0 {
            return Err(FsError::BadGeometry("no node table"));
        }

        let mut block_size_mult = 0;
        while (block_bytes >> block_size_mult) > 0x200 {
            block_size_mult += 1;
        }
        block_size_mult &= 0x1F;

        let sectors_per_partition = (drive_size - start_lba) / partitions;
        let node_table_sectors = (sectors_per_partition >> block_size_mult)
            .checked_mul(4)
            .and_then(|bytes| bytes.checked_add(0x1FF))
            .ok_or(FsError::BadGeometry("node table too large"))?
            >> 9;
        let data_sector_offset = node_table_sectors
            .checked_mul(node_table_count)
            .and_then(|sectors| sectors.checked_add(1))
            .ok_or(FsError::BadGeometry("node tables too large"))?;
        if node_table_sectors == 0 || data_sector_offset >= sectors_per_partition {
            return Err(FsError::BadGeometry("partition too small"));
        }
        let unk1 = ((sectors_per_partition - data_sector_offset) >> block_size_mult).wrapping_sub(
            (((((node_table_sectors + 7) >> 3) + 0x202) >> 9) + (1 << block_size_mult) - 1) >> block_size_mult,
        );

        let header = PartitionHeader {
            partition_count1: partition_count1 as u8,
            partition_count2: partition_count2 as u8,
            block_size_mult: block_size_mult as u8,
            node_table_count: node_table_count as u8,
            total_sectors: sectors_per_partition,
            node_table_sectors,
            data_sector_offset,
            unk1,
        };

        // Block 1 holds the root folder.
        let mut first_table_sector = [0; SECTOR_SIZE];
        put_be32(&mut first_table_sector, ROOT_BLOCK as usize * 4, BLOCK_END);
        let empty_sector = [0; SECTOR_SIZE];

        let mut root_sector = [0; SECTOR_SIZE];
        DirEntry::new(".", (ENTRY_BYTES * 2) as u32, 0, ROOT_BLOCK | ATTRIB_IS_FOLDER).encode(&mut root_sector[..ENTRY_BYTES]);
        DirEntry::new("..", 0, 0, ROOT_BLOCK | ATTRIB_IS_FOLDER).encode(&mut root_sector[ENTRY_BYTES..ENTRY_BYTES * 2]);

        let mut lba = start_lba as u64;
        for _ in 0..partitions {
            storage.write_sector(lba, &header.encode())?;
            for index in 0..node_table_sectors as u64 {
                let table = if index == 0 { &first_table_sector } else { &empty_sector };
                storage.write_sector(lba + 1 + index, table)?;
            }
            storage.write_sector(lba + data_sector_offset as u64, &root_sector)?;
            lba += sectors_per_partition as u64;
        }

        log::debug!("pythonfs: formatted {:?}", header);
        self.partition = Some(Partition::load(storage, start_lba as u64)?);
        Ok(())
    }

    /// Returns the entries of a folder.
    pub fn list(&mut self, path: &str) -> Result<Vec<DirEntry>, FsError> {

        let path = self.absolute(path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        Ok(partition.find_folder(storage, &path)?.1)
    }

    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {

        let path = self.absolute(path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        partition.find_folder(storage, &path)?;
        partition.cwd = path;
        Ok(())
    }

    /// Opens a file. Without `OPEN_NEW` an existing entry is opened; with
    /// `OPEN_WRITE` a missing (or `OPEN_NEW`) file is created on close.
    pub fn open(&mut self, path: &str, flags: u32, _mode: u32) -> Result<u32, FsError> {

        let path = self.absolute(path);
        let (folder, name) = split_parent(&path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;

        let (_, entries) = partition.find_folder(storage, &folder)?;
        let existing = entries.into_iter().find(|e| e.name == name && flags & OPEN_NEW == 0);

        let entry = match existing {
            Some(entry) => entry,
            None if flags & OPEN_WRITE != 0 && !name.is_empty() => {
                let block = partition.allocate(1)?[0];
                DirEntry::new(&name, 0, NEW_ENTRY_UNK, block)
            },
            None => return Err(FsError::NotFound(path)),
        };

        let fd = self.next_fd();
        self.handles.insert(fd, Handle::File(OpenFile {
            flags,
            folder,
            entry,
            position: 0,
        }));
        Ok(fd)
    }

    /// Closes a file, recording a written file in its folder.
    pub fn close(&mut self, fd: u32) -> Result<(), FsError> {

        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        match self.handles.remove(&fd) {
            Some(Handle::File(file)) if file.flags & OPEN_WRITE != 0 => {
                partition.add_entry(storage, &file.folder, file.entry)
            },
            Some(_) => Ok(()),
            None => Err(FsError::BadDescriptor(fd)),
        }
    }

    /// Reads up to `len` bytes from the current position.
    pub fn read(&mut self, fd: u32, len: u32) -> Result<Vec<u8>, FsError> {

        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        let Some(Handle::File(file)) = self.handles.get_mut(&fd) else {
            return Err(FsError::BadDescriptor(fd));
        };

        let mut data = Vec::new();
        if file.flags & OPEN_READ == 0 {
            return Ok(data);
        }

        let block_size = partition.block_size() as u32;
        while (data.len() as u32) < len && file.position < file.entry.size {
            let index = (file.position / block_size) as usize;
            let offset = file.position % block_size;
            let block = partition
                .block_at(file.entry.block(), index)?
                .ok_or(FsError::BrokenChain(file.entry.block()))?;

            let count = (len - data.len() as u32).min(block_size - offset).min(file.entry.size - file.position);
            let start = data.len();
            data.resize(start + count as usize, 0);
            read_at(storage, partition.block_address(block) + offset as u64, &mut data[start..])?;
            file.position += count;
        }
        Ok(data)
    }

    /// Writes at the current position, growing the file as needed.
    pub fn write(&mut self, fd: u32, data: &[u8]) -> Result<u32, FsError> {

        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        let Some(Handle::File(file)) = self.handles.get_mut(&fd) else {
            return Err(FsError::BadDescriptor(fd));
        };
        if file.flags & OPEN_WRITE == 0 {
            return Err(FsError::NotWritable(fd));
        }

        let block_size = partition.block_size() as u32;
        let mut written = 0;
        while written < data.len() {
            let index = (file.position / block_size) as usize;
            let offset = file.position % block_size;
            let block = partition.block_for_write(file.entry.block(), index)?;

            let count = (data.len() - written).min((block_size - offset) as usize);
            write_at(storage, partition.block_address(block) + offset as u64, &data[written..written + count])?;
            written += count;
            file.position += count as u32;
            file.entry.size = file.entry.size.max(file.position);
        }
        Ok(written as u32)
    }

    /// Moves the file position. `whence` is 0 (start), 1 (current) or 2
    /// (back from the end).
    pub fn lseek(&mut self, fd: u32, offset: u32, whence: u32) -> Result<u32, FsError> {

        let (_, partition) = mounted(&mut self.storage, &mut self.partition)?;
        let Some(Handle::File(file)) = self.handles.get_mut(&fd) else {
            return Err(FsError::BadDescriptor(fd));
        };

        let size = file.entry.size as i64;
        let target = match whence {
            0 => offset as i64,
            1 => file.position as i64 + offset as i64,
            _ => size - offset as i64,
        };
        if target < 0 || target > size {
            return Err(FsError::BadSeek(target));
        }

        // The chain must reach the new position.
        let index = target as usize / partition.block_size();
        let full_block_end = target > 0 && target as usize % partition.block_size() == 0;
        let needed = if full_block_end { index - 1 } else { index };
        if size > 0 && partition.block_at(file.entry.block(), needed)?.is_none() {
            return Err(FsError::BrokenChain(file.entry.block()));
        }

        file.position = target as u32;
        Ok(file.position)
    }

    /// Opens a folder for listing.
    pub fn dopen(&mut self, path: &str) -> Result<u32, FsError> {

        let path = self.absolute(path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        let (_, entries) = partition.find_folder(storage, &path)?;

        let fd = self.next_fd();
        self.handles.insert(fd, Handle::Folder(OpenFolder { entries, index: 0 }));
        Ok(fd)
    }

    pub fn dclose(&mut self, fd: u32) -> Result<(), FsError> {

        if !self.has_device() {
            return Err(FsError::NoDevice);
        }
        match self.handles.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(FsError::BadDescriptor(fd)),
        }
    }

    /// Returns the next folder entry as a dirent record: a stat block
    /// followed by the name. Folders report the size of their own listing.
    pub fn dread(&mut self, fd: u32) -> Result<Vec<u8>, FsError> {

        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;
        let Some(Handle::Folder(folder)) = self.handles.get_mut(&fd) else {
            return Err(FsError::BadDescriptor(fd));
        };
        let entry = folder.entries.get(folder.index).cloned().ok_or(FsError::EndOfFolder)?;
        folder.index += 1;

        let size = if entry.is_folder() {
            partition
                .read_folder_at(storage, entry.block())?
                .iter()
                .find(|e| e.name == ".")
                .map_or(entry.size, |e| e.size)
        } else {
            entry.size
        };

        let mut record = vec![0; DIRENT_BYTES];
        put_le32(&mut record, 8, size);
        let name = entry.name.as_bytes();
        record[DIRENT_NAME_OFFSET..DIRENT_NAME_OFFSET + name.len()].copy_from_slice(name);
        Ok(record)
    }

    /// Returns the stat record of a file or folder.
    pub fn getstat(&mut self, path: &str) -> Result<[u8; STAT_BYTES], FsError> {

        let path = self.absolute(path);
        let (folder, name) = split_parent(&path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;

        let (_, entries) = partition.find_folder(storage, &folder)?;
        let lookup = if name.is_empty() { "." } else { name.as_str() };
        let entry = entries
            .into_iter()
            .find(|e| e.name == lookup)
            .ok_or(FsError::NotFound(path))?;

        let mut stat = [0; STAT_BYTES];
        put_le32(&mut stat, 4, entry.attributes());
        put_le32(&mut stat, 8, entry.size);
        Ok(stat)
    }

    /// Creates a folder and any missing folders above it.
    pub fn mkdir(&mut self, path: &str, _mode: u32) -> Result<(), FsError> {

        let path = self.absolute(path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;

        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let next = resolve(&current, part);
            match partition.find_folder(storage, &next) {
                Ok(_) => {},
                Err(FsError::NotFound(_)) => {
                    let (parent_block, _) = partition.find_folder(storage, &current)?;
                    let block = partition.allocate(1)?[0];
                    let entries = [
                        DirEntry::new(".", (ENTRY_BYTES * 2) as u32, 0, block | ATTRIB_IS_FOLDER),
                        DirEntry::new("..", 0, 0, parent_block | ATTRIB_IS_FOLDER),
                    ];
                    partition.write_folder(storage, block, &entries)?;
                    partition.add_entry(storage, &current, DirEntry::new(part, 0, NEW_ENTRY_UNK, block | ATTRIB_IS_FOLDER))?;
                    log::debug!("pythonfs: created folder {} at block {}", next, block);
                },
                Err(err) => return Err(err),
            }
            current = next;
        }
        Ok(())
    }

    /// Removes an empty folder.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {

        let path = self.absolute(path);
        let (folder, name) = split_parent(&path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;

        let (block, entries) = partition.find_folder(storage, &path)?;
        if name.is_empty() || entries.iter().any(|e| e.name != "." && e.name != "..") {
            return Err(FsError::NotEmpty(path));
        }
        partition.free_chain(block)?;
        partition.remove_entry(storage, &folder, &name)
    }

    /// Removes a file and frees its blocks. "." and ".." are left alone.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {

        let path = self.absolute(path);
        let (folder, name) = split_parent(&path);
        let (storage, partition) = mounted(&mut self.storage, &mut self.partition)?;

        if name == "." || name == ".." {
            return Ok(());
        }

        let (_, entries) = partition.find_folder(storage, &folder)?;
        let entry = entries
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if partition.is_valid_block(entry.block()) {
            partition.free_chain(entry.block())?;
        }
        partition.remove_entry(storage, &folder, &name)
    }

    /// Answers a device control request. Request 2 returns the partition
    /// geometry.
    pub fn devctl(&mut self, request: u32) -> Result<[u32; 4], FsError> {

        let (_, partition) = mounted(&mut self.storage, &mut self.partition)?;
        match request {
            2 => {
                let header = &partition.header;
                Ok([
                    header.total_sectors,
                    header.partition_count1 as u32,
                    header.partition_count2 as u32,
                    header.node_table_sectors >> 5,
                ])
            },
            _ => {
                log::warn!("pythonfs: unknown devctl request {:#x}", request);
                Err(FsError::Unsupported(request))
            },
        }
    }
}

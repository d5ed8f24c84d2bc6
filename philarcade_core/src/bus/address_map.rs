// SPDX-License-Identifier: GPL-3.0
// address_map.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

/// Read handler signature: device, index within the mapped range (in units of
/// the map's data width), lane mask.
pub type ReadHandler<D> = fn(&mut D, u32, u32) -> u32;

/// Write handler signature: device, index within the mapped range, data, lane mask.
pub type WriteHandler<D> = fn(&mut D, u32, u32, u32);

/// One mapped range. Bounds are inclusive byte addresses.
struct Mapping<D> {
    start: u32,
    end: u32,
    read: Option<ReadHandler<D>>,
    write: Option<WriteHandler<D>>,
}

/// This struct is an ordered register file for a device of type `D`. Ranges may
/// overlap, in which case the narrowest range containing the address wins, and
/// among equally narrow ranges the one mapped last wins.
pub struct AddressMap<D> {

    // Width of one bus unit in bytes (2 for 16-bit devices, 4 for 32-bit ones).
    unit_bytes: u32,
    mappings: Vec<Mapping<D>>,
}

impl<D> AddressMap<D> {

    /// Creates an empty map for a device whose bus offsets count `unit_bytes`-sized units.
    pub fn new(unit_bytes: u32) -> Self {
        AddressMap {
            unit_bytes: unit_bytes.max(1),
            mappings: Vec::new(),
        }
    }

    /// Maps a byte range to read and write handlers.
    pub fn map(
        &mut self,
        start: u32,
        end: u32,
        read: Option<ReadHandler<D>>,
        write: Option<WriteHandler<D>>
    ) -> &mut Self {

        self.mappings.push(Mapping { start, end, read, write });
        self
    }

    /// Maps a byte range to a read handler only.
    pub fn map_read(&mut self, start: u32, end: u32, read: ReadHandler<D>) -> &mut Self {
        self.map(start, end, Some(read), None)
    }

    /// Maps a byte range to a write handler only.
    pub fn map_write(&mut self, start: u32, end: u32, write: WriteHandler<D>) -> &mut Self {
        self.map(start, end, None, Some(write))
    }

    /// Converts a bus offset (in units) into the byte address used by the map.
    #[inline(always)]
    pub fn byte_address(&self, offset: u32) -> u32 {
        offset.wrapping_mul(self.unit_bytes)
    }

    /// Resolves the read handler for a byte address, along with the index of the
    /// access within the matched range.
    pub fn find_read(&self, address: u32) -> Option<(ReadHandler<D>, u32)> {

        self.best_match(address, |mapping| mapping.read.is_some())
            .and_then(|mapping| {
                mapping.read.map(|handler| (handler, (address - mapping.start) / self.unit_bytes))
            })
    }

    /// Resolves the write handler for a byte address, along with the index of the
    /// access within the matched range.
    pub fn find_write(&self, address: u32) -> Option<(WriteHandler<D>, u32)> {

        self.best_match(address, |mapping| mapping.write.is_some())
            .and_then(|mapping| {
                mapping.write.map(|handler| (handler, (address - mapping.start) / self.unit_bytes))
            })
    }

    fn best_match(&self, address: u32, wanted: impl Fn(&Mapping<D>) -> bool) -> Option<&Mapping<D>> {

        let mut best: Option<&Mapping<D>> = None;
        for mapping in self.mappings.iter() {
            if address < mapping.start || address > mapping.end || !wanted(mapping) {
                continue;
            }
            let narrower = match best {
                Some(current) => mapping.end - mapping.start <= current.end - current.start,
                None => true,
            };
            if narrower {
                best = Some(mapping);
            }
        }
        best
    }
}

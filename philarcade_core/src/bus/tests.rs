use super::address_map::AddressMap;
use super::{combine_data, unmapped_read};

struct Registers {
    values: [u32; 4],
    last_write_index: u32,
}

fn read_value(registers: &mut Registers, index: u32, mem_mask: u32) -> u32 {
    registers.values[index as usize] & mem_mask
}

fn read_sentinel(_registers: &mut Registers, _index: u32, _mem_mask: u32) -> u32 {
    0x1234
}

fn write_value(registers: &mut Registers, index: u32, data: u32, mem_mask: u32) {
    registers.last_write_index = index;
    let old = registers.values[index as usize];
    registers.values[index as usize] = combine_data(old, data, mem_mask);
}

fn dispatch_read(map: &AddressMap<Registers>, registers: &mut Registers, offset: u32, mem_mask: u32) -> u32 {
    match map.find_read(map.byte_address(offset)) {
        Some((handler, index)) => handler(registers, index, mem_mask),
        None => unmapped_read(mem_mask),
    }
}

#[test]
fn combine_data_should_only_touch_selected_lanes() {

    let output = combine_data(0xAABBCCDD, 0x11223344, 0x0000FF00);

    assert_eq!(output, 0xAABB33DD);
}

#[test]
fn unmapped_read_should_return_all_ones_masked_to_lanes() {

    assert_eq!(unmapped_read(0xFFFF), 0xFFFF);
    assert_eq!(unmapped_read(0x00FF0000), 0x00FF0000);
}

#[test]
fn narrowest_mapping_should_win_over_wider_one() {

    // Given a wide sentinel range and a narrow real register inside it.
    let mut map = AddressMap::new(2);
    map.map_read(0x00, 0x0F, read_sentinel);
    map.map_read(0x04, 0x07, read_value);
    let mut registers = Registers { values: [5, 6, 7, 8], last_write_index: 0 };

    assert_eq!(dispatch_read(&map, &mut registers, 0, 0xFFFF), 0x1234);
    assert_eq!(dispatch_read(&map, &mut registers, 2, 0xFFFF), 5);
    assert_eq!(dispatch_read(&map, &mut registers, 3, 0xFFFF), 6);
}

#[test]
fn unmapped_address_should_return_sentinel() {

    let mut map = AddressMap::new(2);
    map.map_read(0x00, 0x01, read_value);
    let mut registers = Registers { values: [0; 4], last_write_index: 0 };

    assert_eq!(dispatch_read(&map, &mut registers, 8, 0xFFFF), 0xFFFF);
}

#[test]
fn write_handler_should_receive_index_within_range() {

    let mut map = AddressMap::new(4);
    map.map(0x10, 0x1F, Some(read_value), Some(write_value));
    let mut registers = Registers { values: [0; 4], last_write_index: 0 };

    let (handler, index) = map.find_write(map.byte_address(6)).unwrap();
    handler(&mut registers, index, 0xABCD, 0xFFFFFFFF);

    assert_eq!(registers.last_write_index, 2);
    assert_eq!(registers.values[2], 0xABCD);
}

#[test]
fn read_only_mapping_should_not_shadow_write_handler() {

    // Given a read-only narrow range inside a writable wide one.
    let mut map = AddressMap::new(2);
    map.map(0x00, 0x07, None, Some(write_value));
    map.map_read(0x02, 0x03, read_sentinel);

    assert!(map.find_write(2).is_some());
    assert!(map.find_read(0).is_none());
}

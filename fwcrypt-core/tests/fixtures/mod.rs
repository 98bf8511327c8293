//! Test Fixtures
//!
//! Small ARM firmware images with known contents.

#![allow(dead_code)]

use std::sync::Arc;

/// AES key-schedule round constants.
pub const AES_RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1B, 0x36];

/// First 16 words of the MD5 sine table.
pub const MD5_T: [u32; 16] = [
    0xD76AA478, 0xE8C7B756, 0x242070DB, 0xC1BDCEEE, 0xF57C0FAF, 0x4787C62A, 0xA8304613, 0xFD469501,
    0x698098D8, 0x8B44F7AF, 0xFFFF5BB1, 0x895CD7BE, 0x6B901122, 0xFD987193, 0xA679438E, 0x49B40821,
];

/// Ten-round loop reading a table through a literal-pool pointer.
///
/// ```text
/// 0x00: push {r4, lr}
/// 0x04: ldr  r1, [pc, #0x18]    ; literal at 0x24
/// 0x08: mov  r2, #0
/// 0x0C: ldr  r3, [r1], #4       ; loop header
/// 0x10: eor  r0, r0, r3
/// 0x14: add  r2, r2, #1
/// 0x18: cmp  r2, #10
/// 0x1C: bne  0x0C
/// 0x20: pop  {r4, pc}
/// 0x24: .word table
/// ```
pub fn round_function(table: u32) -> Vec<u32> {
    vec![
        0xE92D4010, 0xE59F1018, 0xE3A02000, 0xE4913004, 0xE0200003, 0xE2822001, 0xE352000A, 0x1AFFFFFA,
        0xE8BD8010, table,
    ]
}

/// Unreferenced straight-line ARM code.
pub fn filler() -> Vec<u32> {
    [
        0xE3A00001, 0xE3A01002, 0xE0800001, 0xE2811004, 0xE1A02000, 0xE5832000, 0xE5930004, 0xE0400001,
        0xE3500000, 0xE12FFF1E,
    ]
    .repeat(2)
}

pub fn words_le(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn place(image: &mut [u8], offset: usize, bytes: &[u8]) {
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Raw image with an AES-128 round loop at 0x0 using the Rcon table at 0x14A0.
pub fn aes_image() -> Arc<[u8]> {
    let mut image: Vec<u8> = vec![0; 0x14B0];
    place(&mut image, 0, &words_le(&round_function(0x14A0)));
    place(&mut image, 0x14A0, &AES_RCON);
    Arc::from(image)
}

/// Raw image whose round loop reads the MD5 sine table at 0x400.
pub fn md5_image() -> Arc<[u8]> {
    let mut image: Vec<u8> = vec![0; 0x440];
    let mut code: Vec<u32> = round_function(0x400);
    code.extend(filler());
    place(&mut image, 0, &words_le(&code));
    place(&mut image, 0x400, &words_le(&MD5_T));
    Arc::from(image)
}

/// Raw image where the function called at 0x14 contains an undefined instruction.
///
/// ```text
/// 0x00: push {r4, lr}
/// 0x04: bl   0x14
/// 0x08: mov  r0, #0
/// 0x0C: pop  {r4, pc}
/// 0x10: nop
/// 0x14: <undefined>
/// 0x18: bx   lr
/// ```
pub fn partial_decode_image() -> Arc<[u8]> {
    let mut code: Vec<u32> = vec![0xE92D4010, 0xEB000002, 0xE3A00000, 0xE8BD8010, 0xE1A00000, 0xF0000000, 0xE12FFF1E];
    code.extend(filler());
    Arc::from(words_le(&code))
}

/// Relocatable ARM ELF: a one-instruction stub at 0x0, then the round loop as function
/// symbol `block_encrypt` at 0x4.
pub fn arm_elf() -> Vec<u8> {
    use object::write::{Object, StandardSection, Symbol, SymbolSection};
    use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

    // nop ; mov r2,#0 ; loop: ldr r3,[r1],#4 ; eor r0,r0,r3 ; add r2,r2,#1 ; cmp r2,#10 ; bne loop ; bx lr
    let code: Vec<u8> = words_le(&[
        0xE1A00000, 0xE3A02000, 0xE4913004, 0xE0200003, 0xE2822001, 0xE352000A, 0x1AFFFFFA, 0xE12FFF1E,
    ]);
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Arm, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &code, 4);
    obj.add_symbol(Symbol {
        name: b"block_encrypt".to_vec(),
        value: offset + 4,
        size: code.len() as u64 - 4,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write().unwrap()
}

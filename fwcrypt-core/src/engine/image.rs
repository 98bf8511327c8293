//! Firmware Image Model
//!
//! Immutable in-memory representation of a loaded firmware image: the raw bytes,
//! the inferred instruction set and byte order, and the ordered list of sections.
//!
//! # Memory Optimizations
//! - `Architecture`, `Endianness` and `ContainerFormat` use `#[repr(u8)]`
//! - Sections reference the shared byte buffer by range instead of copying data

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Instruction-set architecture of an image.
///
/// Variant order doubles as the tie-break preference order used by architecture detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Architecture {
    Arm = 0,
    Mips = 1,
    X86_64 = 2,
    RiscV = 3,
    Avr = 4,
    Unknown = 5,
}

impl Architecture {
    /// Detectable architectures in preference order (ARM > MIPS > x86-64 > RISC-V > AVR).
    pub const PREFERENCE: [Architecture; 5] = [
        Architecture::Arm,
        Architecture::Mips,
        Architecture::X86_64,
        Architecture::RiscV,
        Architecture::Avr,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Arm => "ARM",
            Architecture::Mips => "MIPS",
            Architecture::X86_64 => "x86-64",
            Architecture::RiscV => "RISC-V",
            Architecture::Avr => "AVR",
            Architecture::Unknown => "unknown",
        }
    }

    /// Size of a pointer-sized literal for data reference resolution.
    pub fn pointer_size(&self) -> usize {
        match self {
            Architecture::X86_64 => 8,
            Architecture::Avr => 2,
            _ => 4,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "arm" => Some(Architecture::Arm),
            "mips" => Some(Architecture::Mips),
            "x86-64" | "x86_64" | "amd64" => Some(Architecture::X86_64),
            "risc-v" | "riscv" => Some(Architecture::RiscV),
            "avr" => Some(Architecture::Avr),
            _ => None,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Endianness {
    Little = 0,
    Big = 1,
}

impl Endianness {
    #[inline]
    pub fn read_u16(&self, bytes: &[u8]) -> Option<u16> {
        let raw: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
        Some(match self {
            Endianness::Little => u16::from_le_bytes(raw),
            Endianness::Big => u16::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_u32(&self, bytes: &[u8]) -> Option<u32> {
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(match self {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_u64(&self, bytes: &[u8]) -> Option<u64> {
        let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(match self {
            Endianness::Little => u64::from_le_bytes(raw),
            Endianness::Big => u64::from_be_bytes(raw),
        })
    }
}

/// Container the image was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContainerFormat {
    Elf = 0,
    IntelHex = 1,
    Raw = 2,
}

/// Section access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const RX: Permissions = Permissions {
        read: true,
        write: false,
        execute: true,
    };
    pub const RW: Permissions = Permissions {
        read: true,
        write: true,
        execute: false,
    };
    pub const R: Permissions = Permissions {
        read: true,
        write: false,
        execute: false,
    };
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

/// A contiguous region of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Address the section is mapped at
    pub virtual_address: u64,
    /// Range into the image's byte buffer
    pub range: Range<usize>,
    pub permissions: Permissions,
}

impl Section {
    #[inline]
    pub fn size(&self) -> u64 {
        (self.range.end - self.range.start) as u64
    }

    #[inline]
    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.virtual_address && address < self.virtual_address + self.size()
    }

    /// Offset into the section's data for a virtual address.
    #[inline]
    pub fn offset_of(&self, address: u64) -> Option<usize> {
        if self.contains_address(address) {
            Some((address - self.virtual_address) as usize)
        } else {
            None
        }
    }
}

/// Function name/address hint from a symbol table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolHint {
    pub name: String,
    pub address: u64,
}

/// A loaded firmware image. Immutable once constructed by the loader.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Arc<[u8]>,
    pub format: ContainerFormat,
    pub architecture: Architecture,
    pub endianness: Endianness,
    /// Confidence of the architecture inference in [0,1]; 1.0 for container-declared machines
    pub arch_confidence: f64,
    pub entry_point: Option<u64>,
    pub sections: Vec<Section>,
    pub symbols: Vec<SymbolHint>,
}

impl FirmwareImage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        data: Arc<[u8]>,
        format: ContainerFormat,
        architecture: Architecture,
        endianness: Endianness,
        arch_confidence: f64,
        entry_point: Option<u64>,
        mut sections: Vec<Section>,
        symbols: Vec<SymbolHint>,
    ) -> Self {
        sections.sort_by(|a, b| {
            a.virtual_address
                .cmp(&b.virtual_address)
                .then_with(|| a.name.cmp(&b.name))
        });
        Self {
            data,
            format,
            architecture,
            endianness,
            arch_confidence,
            entry_point,
            sections,
            symbols,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn section_data(&self, section: &Section) -> &[u8] {
        self.data.get(section.range.clone()).unwrap_or(&[])
    }

    pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.permissions.execute)
    }

    pub fn section_at(&self, address: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_address(address))
    }

    /// Read bytes at a virtual address, staying within one section.
    pub fn read_at(&self, address: u64, len: usize) -> Option<&[u8]> {
        let section = self.section_at(address)?;
        let offset = section.offset_of(address)?;
        self.section_data(section).get(offset..offset.checked_add(len)?)
    }

    /// Read a pointer-sized literal at `address` using the image byte order.
    pub fn read_pointer(&self, address: u64) -> Option<u64> {
        let size = self.architecture.pointer_size();
        let bytes = self.read_at(address, size)?;
        match size {
            2 => self.endianness.read_u16(bytes).map(u64::from),
            4 => self.endianness.read_u32(bytes).map(u64::from),
            _ => self.endianness.read_u64(bytes),
        }
    }
}

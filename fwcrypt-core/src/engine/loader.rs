//! Firmware Loader
//!
//! Turns an input buffer into a [`FirmwareImage`]: identifies the container, extracts
//! sections, and determines the instruction set.
//!
//! # Supported Containers
//! - **ELF** (32/64-bit, either byte order) via `goblin`; machine from `e_machine`
//! - **Intel HEX** records (types 00-05), merged into contiguous sections
//! - **Raw** binaries: the whole buffer as one executable `.raw` section
//!
//! PE, Mach-O, gzip and zip inputs are recognized and rejected.
//!
//! # Memory Optimizations
//! - ELF and raw images share the caller's buffer (`Arc<[u8]>`); sections are ranges
//! - Intel HEX data records are assembled into one new buffer

use crate::engine::arch::{ArchitectureDetector, DEFAULT_ARCH_THRESHOLD};
use crate::engine::error::AnalysisError;
use crate::engine::image::{
    Architecture, ContainerFormat, Endianness, FirmwareImage, Permissions, Section, SymbolHint,
};
use goblin::elf::header::{EM_ARM, EM_AVR, EM_MIPS, EM_RISCV, EM_X86_64};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS};
use goblin::elf::sym::STT_FUNC;
use goblin::elf::Elf;
use std::sync::Arc;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Loader settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderOptions {
    /// Virtual address of the first byte of a raw image
    pub raw_base_address: u64,
    /// Minimum statistical confidence to accept an architecture
    pub arch_threshold: f64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            raw_base_address: 0,
            arch_threshold: DEFAULT_ARCH_THRESHOLD,
        }
    }
}

/// Firmware loader.
#[derive(Debug, Clone, Default)]
pub struct Loader {
    options: LoaderOptions,
}

impl Loader {
    pub fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Load a firmware image from a byte buffer.
    ///
    /// # Arguments
    /// * `data` - Complete input file
    /// * `file_name` - Optional file name; a `.hex`/`.ihex` extension selects Intel HEX
    ///
    /// # Returns
    /// `Result<FirmwareImage, AnalysisError>` - the loaded image. The architecture may be
    /// `Unknown`; rejecting such images is the pipeline's decision.
    ///
    /// # Errors
    /// - `EmptyInput` for a zero-length buffer
    /// - `Truncated` when a declared section or header table runs past the buffer
    /// - `UnsupportedFormat` for known-but-unsupported or malformed containers
    pub fn load(&self, data: Arc<[u8]>, file_name: Option<&str>) -> Result<FirmwareImage, AnalysisError> {
        if data.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }

        if data.starts_with(ELF_MAGIC) {
            return self.load_elf(data);
        }
        if let Some(container) = unsupported_container(&data) {
            return Err(AnalysisError::unsupported(format!("{} containers are not supported", container)));
        }

        let hex_hint: bool = file_name
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex"))
            .unwrap_or(false);
        if hex_hint {
            return self.load_intel_hex(&data);
        }
        if looks_like_intel_hex(&data) {
            match self.load_intel_hex(&data) {
                Ok(image) => return Ok(image),
                Err(err) => log::debug!("Input starts like Intel HEX but does not parse ({}); treating as raw", err),
            }
        }

        Ok(self.load_raw(data))
    }

    fn load_raw(&self, data: Arc<[u8]>) -> FirmwareImage {
        let guess = ArchitectureDetector::new(self.options.arch_threshold).detect(&data);
        log::info!(
            "Raw image: {} bytes, detected {} ({:?}, confidence {:.2})",
            data.len(),
            guess.architecture,
            guess.endianness,
            guess.confidence
        );
        let section = Section {
            name: ".raw".to_string(),
            virtual_address: self.options.raw_base_address,
            range: 0..data.len(),
            permissions: Permissions::RX,
        };
        FirmwareImage::new(
            data,
            ContainerFormat::Raw,
            guess.architecture,
            guess.endianness,
            guess.confidence,
            Some(self.options.raw_base_address),
            vec![section],
            Vec::new(),
        )
    }

    fn load_elf(&self, data: Arc<[u8]>) -> Result<FirmwareImage, AnalysisError> {
        check_elf_tables(&data)?;

        let elf: Elf = Elf::parse(&data)
            .map_err(|e| AnalysisError::unsupported(format!("malformed ELF: {}", e)))?;

        let (architecture, arch_confidence) = match elf.header.e_machine {
            EM_ARM => (Architecture::Arm, 1.0),
            EM_MIPS => (Architecture::Mips, 1.0),
            EM_X86_64 => (Architecture::X86_64, 1.0),
            EM_RISCV => (Architecture::RiscV, 1.0),
            EM_AVR => (Architecture::Avr, 1.0),
            other => {
                log::warn!("ELF machine {} is not supported", other);
                (Architecture::Unknown, 0.0)
            }
        };
        let endianness: Endianness = if elf.little_endian {
            Endianness::Little
        } else {
            Endianness::Big
        };

        let mut sections: Vec<Section> = Vec::with_capacity(elf.section_headers.len());
        for header in elf.section_headers.iter() {
            if header.sh_flags & u64::from(SHF_ALLOC) == 0 || header.sh_type == SHT_NOBITS || header.sh_size == 0 {
                continue;
            }
            let name: String = elf.shdr_strtab.get_at(header.sh_name).unwrap_or("").to_string();
            let end: u64 = header
                .sh_offset
                .checked_add(header.sh_size)
                .ok_or_else(|| AnalysisError::truncated(format!("section {}", name), header.sh_offset, header.sh_size, data.len()))?;
            if end > data.len() as u64 {
                return Err(AnalysisError::truncated(
                    format!("section {}", name),
                    header.sh_offset,
                    header.sh_size,
                    data.len(),
                ));
            }
            sections.push(Section {
                name,
                virtual_address: header.sh_addr,
                range: header.sh_offset as usize..end as usize,
                permissions: Permissions {
                    read: true,
                    write: header.sh_flags & u64::from(SHF_WRITE) != 0,
                    execute: header.sh_flags & u64::from(SHF_EXECINSTR) != 0,
                },
            });
        }

        let mut symbols: Vec<SymbolHint> = elf
            .syms
            .iter()
            .filter(|sym| sym.st_type() == STT_FUNC && sym.st_value != 0)
            .map(|sym| SymbolHint {
                name: elf.strtab.get_at(sym.st_name).unwrap_or("").to_string(),
                // Thumb bit
                address: if architecture == Architecture::Arm {
                    sym.st_value & !1
                } else {
                    sym.st_value
                },
            })
            .collect();
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));
        symbols.dedup_by(|a, b| a.address == b.address);

        let entry_point: Option<u64> = if elf.entry != 0 { Some(elf.entry) } else { None };
        log::info!(
            "ELF image: {} ({:?}), {} sections, {} function symbols",
            architecture,
            endianness,
            sections.len(),
            symbols.len()
        );
        drop(elf);

        Ok(FirmwareImage::new(
            data,
            ContainerFormat::Elf,
            architecture,
            endianness,
            arch_confidence,
            entry_point,
            sections,
            symbols,
        ))
    }

    fn load_intel_hex(&self, data: &[u8]) -> Result<FirmwareImage, AnalysisError> {
        let parsed: IntelHex = IntelHex::parse(data)?;
        if parsed.chunks.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }

        // Merge records into contiguous runs.
        let mut runs: Vec<(u64, Vec<u8>)> = Vec::new();
        for (address, bytes) in parsed.chunks {
            match runs.last_mut() {
                Some((start, run)) if *start + run.len() as u64 == address => run.extend_from_slice(&bytes),
                _ => runs.push((address, bytes)),
            }
        }

        let mut buffer: Vec<u8> = Vec::with_capacity(runs.iter().map(|(_, r)| r.len()).sum());
        let mut sections: Vec<Section> = Vec::with_capacity(runs.len());
        for (idx, (address, run)) in runs.into_iter().enumerate() {
            let start: usize = buffer.len();
            buffer.extend_from_slice(&run);
            sections.push(Section {
                name: format!(".ihex{}", idx),
                virtual_address: address,
                range: start..buffer.len(),
                permissions: Permissions::RX,
            });
        }

        let guess = ArchitectureDetector::new(self.options.arch_threshold).detect(&buffer);
        log::info!(
            "Intel HEX image: {} bytes in {} sections, detected {} (confidence {:.2})",
            buffer.len(),
            sections.len(),
            guess.architecture,
            guess.confidence
        );
        let entry_point: Option<u64> = parsed.start_address.or_else(|| sections.first().map(|s| s.virtual_address));
        Ok(FirmwareImage::new(
            Arc::from(buffer),
            ContainerFormat::IntelHex,
            guess.architecture,
            guess.endianness,
            guess.confidence,
            entry_point,
            sections,
            Vec::new(),
        ))
    }
}

/// Verify that the ELF header and section header table fit in the buffer.
///
/// Checked before handing the buffer to the parser so a short file reports `Truncated`
/// rather than a generic parse failure.
fn check_elf_tables(data: &[u8]) -> Result<(), AnalysisError> {
    let is_64: bool = data.get(4) == Some(&2);
    let endianness: Endianness = if data.get(5) == Some(&2) {
        Endianness::Big
    } else {
        Endianness::Little
    };
    let header_size: usize = if is_64 { 64 } else { 52 };
    if data.len() < header_size {
        return Err(AnalysisError::truncated("ELF header", 0, header_size as u64, data.len()));
    }

    let field = |offset: usize, size: usize| -> u64 {
        let bytes: &[u8] = &data[offset..offset + size];
        match size {
            2 => endianness.read_u16(bytes).map(u64::from),
            4 => endianness.read_u32(bytes).map(u64::from),
            _ => endianness.read_u64(bytes),
        }
        .unwrap_or(0)
    };
    let (shoff, shentsize, shnum) = if is_64 {
        (field(0x28, 8), field(0x3A, 2), field(0x3C, 2))
    } else {
        (field(0x20, 4), field(0x2E, 2), field(0x30, 2))
    };
    if shoff == 0 || shnum == 0 {
        return Ok(());
    }
    let table_size: u64 = shentsize.saturating_mul(shnum);
    if shoff.saturating_add(table_size) > data.len() as u64 {
        return Err(AnalysisError::truncated("section header table", shoff, table_size, data.len()));
    }
    Ok(())
}

fn unsupported_container(data: &[u8]) -> Option<&'static str> {
    let magic32: Option<u32> = Endianness::Big.read_u32(data);
    if data.len() >= 0x40 && data.starts_with(b"MZ") {
        Some("PE/MZ")
    } else if matches!(magic32, Some(0xFEEDFACE | 0xFEEDFACF | 0xCEFAEDFE | 0xCFFAEDFE | 0xCAFEBABE)) {
        Some("Mach-O")
    } else if data.starts_with(&[0x1F, 0x8B]) {
        Some("gzip")
    } else if data.starts_with(b"PK\x03\x04") {
        Some("zip")
    } else {
        None
    }
}

fn looks_like_intel_hex(data: &[u8]) -> bool {
    let first: Option<&u8> = data.iter().find(|b| !b.is_ascii_whitespace());
    first == Some(&b':') && data.iter().all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

/// Parsed Intel HEX content: data records in file order plus the start address.
struct IntelHex {
    chunks: Vec<(u64, Vec<u8>)>,
    start_address: Option<u64>,
}

impl IntelHex {
    fn parse(data: &[u8]) -> Result<Self, AnalysisError> {
        let text: &str = std::str::from_utf8(data)
            .map_err(|_| AnalysisError::unsupported("Intel HEX input is not ASCII text"))?;
        let mut chunks: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut start_address: Option<u64> = None;
        let mut base: u64 = 0;
        let mut offset: u64 = 0;

        for (line_no, line) in text.lines().enumerate() {
            let line: &str = line.trim();
            if line.is_empty() {
                offset += 1;
                continue;
            }
            let record: Vec<u8> = decode_record(line, line_no + 1)?;
            if record.len() < 5 {
                return Err(AnalysisError::truncated(
                    format!("Intel HEX record on line {}", line_no + 1),
                    offset,
                    5,
                    record.len(),
                ));
            }
            let length: usize = record[0] as usize;
            if record.len() < length + 5 {
                return Err(AnalysisError::truncated(
                    format!("Intel HEX record on line {}", line_no + 1),
                    offset,
                    (length + 5) as u64,
                    record.len(),
                ));
            }
            if record.len() > length + 5 {
                return Err(AnalysisError::unsupported(format!(
                    "Intel HEX record on line {} is longer than declared",
                    line_no + 1
                )));
            }
            let checksum: u8 = record.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            if checksum != 0 {
                return Err(AnalysisError::unsupported(format!(
                    "Intel HEX checksum mismatch on line {}",
                    line_no + 1
                )));
            }

            let address: u64 = u64::from(u16::from_be_bytes([record[1], record[2]]));
            let payload: &[u8] = &record[4..4 + length];
            match record[3] {
                0x00 => chunks.push((base + address, payload.to_vec())),
                0x01 => break,
                0x02 if length == 2 => base = u64::from(u16::from_be_bytes([payload[0], payload[1]])) << 4,
                0x04 if length == 2 => base = u64::from(u16::from_be_bytes([payload[0], payload[1]])) << 16,
                0x03 if length == 4 => {
                    let cs: u64 = u64::from(u16::from_be_bytes([payload[0], payload[1]]));
                    let ip: u64 = u64::from(u16::from_be_bytes([payload[2], payload[3]]));
                    start_address = Some((cs << 4) + ip);
                }
                0x05 if length == 4 => {
                    start_address = Some(u64::from(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])));
                }
                other => {
                    return Err(AnalysisError::unsupported(format!(
                        "Intel HEX record type {:02X} on line {} is invalid",
                        other,
                        line_no + 1
                    )))
                }
            }
            offset += line.len() as u64 + 1;
        }

        chunks.sort_by_key(|(address, _)| *address);
        Ok(Self { chunks, start_address })
    }
}

fn decode_record(line: &str, line_no: usize) -> Result<Vec<u8>, AnalysisError> {
    let digits: &str = line
        .strip_prefix(':')
        .ok_or_else(|| AnalysisError::unsupported(format!("line {} is not an Intel HEX record", line_no)))?;
    if !digits.is_ascii() {
        return Err(AnalysisError::unsupported(format!("line {} contains non-hex characters", line_no)));
    }
    if digits.len() % 2 != 0 {
        return Err(AnalysisError::unsupported(format!("line {} has an odd number of hex digits", line_no)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| AnalysisError::unsupported(format!("line {} contains non-hex characters", line_no)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(bytes: &[u8], name: Option<&str>) -> Result<FirmwareImage, AnalysisError> {
        Loader::default().load(Arc::from(bytes), name)
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(load(&[], None).unwrap_err(), AnalysisError::EmptyInput);
    }

    #[test]
    fn test_raw_image_is_one_executable_section() {
        let loader = Loader::new(LoaderOptions {
            raw_base_address: 0x0800_0000,
            ..LoaderOptions::default()
        });
        let image = loader.load(Arc::from(&[0u8; 64][..]), Some("dump.bin")).unwrap();
        assert_eq!(image.format, ContainerFormat::Raw);
        assert_eq!(image.sections.len(), 1);
        assert_eq!(image.sections[0].name, ".raw");
        assert_eq!(image.sections[0].virtual_address, 0x0800_0000);
        assert!(image.sections[0].permissions.execute);
        assert_eq!(image.architecture, Architecture::Unknown);
    }

    #[test]
    fn test_rejects_known_containers() {
        let mut pe = vec![0u8; 0x80];
        pe[0] = b'M';
        pe[1] = b'Z';
        let err = load(&pe, None).unwrap_err();
        assert_eq!(err.code(), "UnsupportedFormat");
        assert_eq!(load(&[0x1F, 0x8B, 0x08, 0x00], None).unwrap_err().code(), "UnsupportedFormat");
    }

    #[test]
    fn test_truncated_elf_section_table() {
        let mut header = vec![0u8; 52];
        header[..4].copy_from_slice(ELF_MAGIC);
        header[4] = 1; // ELFCLASS32
        header[5] = 1; // little endian
        header[6] = 1;
        header[0x12..0x14].copy_from_slice(&40u16.to_le_bytes());
        header[0x20..0x24].copy_from_slice(&0x1000u32.to_le_bytes());
        header[0x2E..0x30].copy_from_slice(&40u16.to_le_bytes());
        header[0x30..0x32].copy_from_slice(&3u16.to_le_bytes());
        let err = load(&header, None).unwrap_err();
        assert_eq!(err.code(), "Truncated");
        assert_eq!(err.category(), crate::engine::error::ErrorCategory::InputError);

        assert_eq!(load(&header[..20], None).unwrap_err().code(), "Truncated");
    }

    #[test]
    fn test_intel_hex_records() {
        let text = ":020000040800F2\n:0400000001020304F2\n:0400040005060708DE\n:04000005080000C12E\n:00000001FF\n";
        let image = load(text.as_bytes(), Some("fw.hex")).unwrap();
        assert_eq!(image.format, ContainerFormat::IntelHex);
        assert_eq!(image.sections.len(), 1);
        assert_eq!(image.sections[0].virtual_address, 0x0800_0000);
        assert_eq!(image.section_data(&image.sections[0]), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(image.entry_point, Some(0x0800_00C1));
    }

    #[test]
    fn test_intel_hex_errors() {
        let bad_checksum = load(b":0400000001020304F3\n", Some("fw.ihex")).unwrap_err();
        assert_eq!(bad_checksum.code(), "UnsupportedFormat");
        let short = load(b":10000000010203\n", Some("fw.hex")).unwrap_err();
        assert_eq!(short.code(), "Truncated");
    }

    #[test]
    fn test_intel_hex_non_ascii_record() {
        let err = load(":0\u{e9}0\n".as_bytes(), Some("fw.hex")).unwrap_err();
        assert_eq!(err.code(), "UnsupportedFormat");
        let err = load(":\u{e9}\u{e9}\n".as_bytes(), Some("fw.ihex")).unwrap_err();
        assert_eq!(err.code(), "UnsupportedFormat");
    }
}

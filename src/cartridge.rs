#![cfg_attr(not(feature = "dev"), allow(dead_code))]
use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("ROM image is empty")]
    Empty,
    #[error("ROM too small for SNES format ({0} bytes)")]
    TooSmall(usize),
    #[error("ROM too small to contain a header at {0:#x}")]
    HeaderOutOfRange(usize),
    #[error("invalid checksum pair: {checksum:#06x} ^ {complement:#06x} != 0xFFFF")]
    BadChecksum { checksum: u16, complement: u16 },
    #[error("failed to read ROM file: {0}")]
    Io(#[from] std::io::Error),
}

/// The two linear cartridge layouts this core supports. `Unknown` is the bus
/// state before any cartridge has been inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    LoRom,
    HiRom,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CartridgeHeader {
    pub title: String,
    pub mapper_kind: MapperKind,
    pub rom_size: usize,
    pub ram_size: usize,
    pub country: u8,
    pub developer: u8,
    pub version: u8,
    pub checksum: u16,
    pub checksum_complement: u16,
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub header: CartridgeHeader,
    pub has_copier_header: bool,
    // バッテリーバックアップSRAM。サイズはヘッダ由来。
    pub sram: Vec<u8>,
}

impl Cartridge {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Self::load_from_bytes(data)
    }

    pub fn load_from_bytes(mut data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.is_empty() {
            return Err(CartridgeError::Empty);
        }

        // 512-byte copier header leaves the image off the 1KiB grid.
        let has_copier_header = data.len() % 1024 == 512;
        if has_copier_header {
            data.drain(0..512);
        }

        let header = Self::parse_header(&data)?;
        let sram = vec![0u8; header.ram_size];

        Ok(Cartridge {
            rom: data,
            header,
            has_copier_header,
            sram,
        })
    }

    fn parse_header(rom: &[u8]) -> Result<CartridgeHeader, CartridgeError> {
        let (header_offset, mapper_kind) = Self::detect_mapper_and_location(rom)?;

        if rom.len() <= header_offset + 0x2F {
            return Err(CartridgeError::HeaderOutOfRange(header_offset));
        }

        // Title starts at header base + 0x10 (LoROM: $7FC0, HiROM: $FFC0);
        // our offset is $7FB0/$FFB0, 0x10 bytes before base.
        let title_bytes = &rom[header_offset + 0x10..header_offset + 0x10 + 21];
        let title = Self::extract_title(title_bytes);
        if !Self::is_valid_title(&title) && !crate::debug_flags::quiet() {
            log::warn!("ROM title contains non-printable characters: {:?}", title);
        }

        let rom_size_code = rom[header_offset + 0x27];
        let rom_size = Self::decode_rom_size(rom_size_code);
        Self::validate_rom_size(rom.len(), rom_size);

        let ram_size_code = rom[header_offset + 0x28];
        let ram_size = Self::decode_ram_size(ram_size_code);

        let country = rom[header_offset + 0x29];
        let developer = rom[header_offset + 0x2A];
        let version = rom[header_offset + 0x2B];

        let checksum_complement =
            ((rom[header_offset + 0x2D] as u16) << 8) | (rom[header_offset + 0x2C] as u16);
        let checksum =
            ((rom[header_offset + 0x2F] as u16) << 8) | (rom[header_offset + 0x2E] as u16);
        Self::validate_checksums(checksum, checksum_complement)?;

        let calculated = Self::calculate_rom_checksum(rom);
        if calculated != checksum && !crate::debug_flags::quiet() {
            log::warn!(
                "stored checksum {:#06x} doesn't match calculated checksum {:#06x}",
                checksum,
                calculated
            );
        }

        Ok(CartridgeHeader {
            title,
            mapper_kind,
            rom_size,
            ram_size,
            country,
            developer,
            version,
            checksum,
            checksum_complement,
        })
    }

    fn detect_mapper_and_location(rom: &[u8]) -> Result<(usize, MapperKind), CartridgeError> {
        if rom.len() < 0x10000 {
            return Err(CartridgeError::TooSmall(rom.len()));
        }

        let lorom_score = Self::score_header(rom, 0x7FB0);
        let hirom_score = Self::score_header(rom, 0xFFB0);

        if hirom_score > lorom_score && hirom_score > 4 {
            Ok((0xFFB0, MapperKind::HiRom))
        } else if lorom_score > 4 {
            Ok((0x7FB0, MapperKind::LoRom))
        } else {
            // Fallback to LoROM if scores are low; the bus-side plausibility
            // check gets another chance to flip this for the vector page.
            if !crate::debug_flags::quiet() {
                log::warn!("low header scores, defaulting to LoROM");
            }
            Ok((0x7FB0, MapperKind::LoRom))
        }
    }

    fn extract_title(title_bytes: &[u8]) -> String {
        let mut title = String::new();
        for &byte in title_bytes {
            if byte == 0x00 {
                break;
            } else if (0x20..=0x7E).contains(&byte) {
                title.push(byte as char);
            } else if byte >= 0x80 {
                title.push('?'); // Shift-JISタイトルはプレースホルダに置換
            }
        }
        title.trim().to_string()
    }

    fn is_valid_title(title: &str) -> bool {
        !title.is_empty() && title.chars().all(|c| c.is_ascii_graphic() || c == ' ')
    }

    fn decode_rom_size(size_code: u8) -> usize {
        // Header encodes "1KiB << N". Clamp absurd codes instead of erroring;
        // the real file size is what gets bounds-checked on access.
        if size_code <= 0x0F {
            1024usize << size_code
        } else {
            0
        }
    }

    fn decode_ram_size(size_code: u8) -> usize {
        // RAM size is "1KiB << N" with 0 meaning no RAM. Some ROMs use 0xFF
        // as unknown/none.
        if size_code == 0x00 || size_code == 0xFF {
            return 0;
        }
        let shift = size_code as usize;
        if shift >= usize::BITS as usize {
            return 0;
        }
        1024usize << shift
    }

    fn validate_rom_size(actual_size: usize, header_size: usize) {
        let tolerance = 0x200;
        if (actual_size + tolerance < header_size || actual_size > header_size + tolerance)
            && !crate::debug_flags::quiet()
        {
            log::warn!(
                "ROM file size ({} bytes) doesn't match header size ({} bytes)",
                actual_size,
                header_size
            );
        }
    }

    fn validate_checksums(checksum: u16, complement: u16) -> Result<(), CartridgeError> {
        if std::env::var_os("ALLOW_BAD_CHECKSUM").is_some() {
            return Ok(());
        }
        if checksum ^ complement != 0xFFFF {
            return Err(CartridgeError::BadChecksum {
                checksum,
                complement,
            });
        }
        Ok(())
    }

    fn calculate_rom_checksum(rom: &[u8]) -> u16 {
        let mut sum = 0u32;
        for &byte in rom.iter() {
            sum = sum.wrapping_add(byte as u32);
        }
        (sum & 0xFFFF) as u16
    }

    fn score_header(rom: &[u8], offset: usize) -> u32 {
        if offset + 0x2F >= rom.len() {
            return 0;
        }

        let mut score: u32 = 0;

        let checksum = ((rom[offset + 0x2F] as u16) << 8) | (rom[offset + 0x2E] as u16);
        let complement = ((rom[offset + 0x2D] as u16) << 8) | (rom[offset + 0x2C] as u16);
        if checksum ^ complement == 0xFFFF {
            score += 8;
        }

        let rom_type = rom[offset + 0x26];
        if rom_type <= 0x37 {
            score += 2;
        }

        let rom_size = rom[offset + 0x27];
        if (0x08..=0x0D).contains(&rom_size) {
            score += 2;
            let expected_size = 1024usize << rom_size;
            if rom.len() >= expected_size / 2 && rom.len() <= expected_size * 2 {
                score += 2;
            }
        }

        let ram_size = rom[offset + 0x28];
        if ram_size <= 0x08 || ram_size == 0xFF {
            score += 1;
        }

        let country = rom[offset + 0x29];
        if country <= 0x0D || country == 0xFF {
            score += 1;
        }

        let title_valid = rom[offset + 0x10..offset + 0x10 + 21]
            .iter()
            .all(|&b| (0x20..=0x7E).contains(&b) || b == 0x00);
        if title_valid {
            score += 2;
        }

        if rom[offset + 0x26] == 0xFF || rom[offset + 0x2A] == 0xFF {
            score = score.saturating_sub(3);
        }

        score
    }

    /// Read a ROM byte through the given mapping. Out-of-image addresses
    /// return 0xFF (unprogrammed flash), never an error.
    pub fn read(&self, addr: u32, mapper: MapperKind) -> u8 {
        let rom_addr = match mapper {
            MapperKind::LoRom => Self::map_lorom_address(addr),
            MapperKind::HiRom => Self::map_hirom_address(addr),
            MapperKind::Unknown => return 0xFF,
        };
        if rom_addr < self.rom.len() {
            self.rom[rom_addr]
        } else {
            0xFF
        }
    }

    fn map_lorom_address(addr: u32) -> usize {
        let bank = (addr >> 16) & 0xFF;
        let offset = addr & 0xFFFF;
        // 32KiB pages out of the upper half of each bank; bank bit 7 mirrors.
        match bank {
            0x00..=0x7D | 0x80..=0xFF => {
                if offset >= 0x8000 {
                    ((bank & 0x7F) as usize) * 0x8000 + (offset as usize) - 0x8000
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn map_hirom_address(addr: u32) -> usize {
        let bank = (addr >> 16) & 0xFF;
        let offset = addr & 0xFFFF;
        match bank {
            0x00..=0x3F | 0x80..=0xBF => {
                if offset >= 0x8000 {
                    ((bank & 0x3F) as usize) * 0x10000 + (offset as usize)
                } else {
                    0
                }
            }
            0x40..=0x7D => ((bank - 0x40) as usize) * 0x10000 + (offset as usize),
            0xC0..=0xFF => ((bank - 0xC0) as usize) * 0x10000 + (offset as usize),
            _ => 0,
        }
    }

    /// Reset-vector target as seen through `mapper`.
    pub fn reset_vector(&self, mapper: MapperKind) -> u16 {
        let lo = self.read(0x00FFFC, mapper) as u16;
        let hi = self.read(0x00FFFD, mapper) as u16;
        (hi << 8) | lo
    }

    /// First opcode at the reset-vector target (bank 0) through `mapper`.
    pub fn reset_opcode(&self, mapper: MapperKind) -> u8 {
        let vector = self.reset_vector(mapper) as u32;
        self.read(vector, mapper)
    }

    pub fn sram_read(&self, index: usize) -> u8 {
        if self.sram.is_empty() {
            return 0xFF;
        }
        self.sram[index % self.sram.len()]
    }

    pub fn sram_write(&mut self, index: usize, value: u8) {
        if self.sram.is_empty() {
            return;
        }
        let len = self.sram.len();
        self.sram[index % len] = value;
    }
}


#[cfg(test)]
mod tests {
    use super::test_rom::*;
    use super::*;

    #[test]
    fn empty_rom_is_a_typed_error() {
        match Cartridge::load_from_bytes(Vec::new()) {
            Err(CartridgeError::Empty) => {}
            other => panic!("expected Empty, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn undersized_rom_is_a_typed_error() {
        match Cartridge::load_from_bytes(vec![0; 0x400]) {
            Err(CartridgeError::TooSmall(0x400)) => {}
            other => panic!("expected TooSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn lorom_header_detected() {
        let cart = Cartridge::load_from_bytes(make_lorom(&[0x18, 0xFB], 0x8000)).unwrap();
        assert_eq!(cart.header.mapper_kind, MapperKind::LoRom);
        assert_eq!(cart.header.title, "TEST CART");
        assert_eq!(cart.header.ram_size, 8 * 1024);
        assert_eq!(cart.sram.len(), 8 * 1024);
    }

    #[test]
    fn hirom_header_detected() {
        let cart = Cartridge::load_from_bytes(make_hirom(&[0x18, 0xFB], 0x8000)).unwrap();
        assert_eq!(cart.header.mapper_kind, MapperKind::HiRom);
    }

    #[test]
    fn copier_header_is_stripped() {
        let mut data = vec![0u8; 512];
        data.extend(make_lorom(&[0xEA], 0x8000));
        let cart = Cartridge::load_from_bytes(data).unwrap();
        assert!(cart.has_copier_header);
        assert_eq!(cart.header.mapper_kind, MapperKind::LoRom);
    }

    #[test]
    fn lorom_mapping_reads_code_window() {
        let cart = Cartridge::load_from_bytes(make_lorom(&[0xA9, 0x42], 0x8000)).unwrap();
        assert_eq!(cart.read(0x008000, MapperKind::LoRom), 0xA9);
        assert_eq!(cart.read(0x008001, MapperKind::LoRom), 0x42);
        // Bank 0x80 mirror.
        assert_eq!(cart.read(0x808000, MapperKind::LoRom), 0xA9);
    }

    #[test]
    fn reset_vector_reads_through_mapping() {
        let cart = Cartridge::load_from_bytes(make_lorom(&[0x78], 0x8000)).unwrap();
        assert_eq!(cart.reset_vector(MapperKind::LoRom), 0x8000);
        assert_eq!(cart.reset_opcode(MapperKind::LoRom), 0x78);
    }
}

//! DMA/HDMA channel register block.
//!
//! Register decode lives here; the transfers themselves are executed by the
//! bus, which is the only component allowed to touch memory. General (one
//! shot) and HDMA (per scanline) transfers share the channel registers but
//! keep mutually exclusive runtime state.
use crate::debug_flags;

/// Per-byte stall cost of a general DMA transfer, in master cycles.
pub const DMA_MASTER_CYCLES_PER_BYTE: u64 = 8;
/// Per-channel activation overhead, in master cycles.
pub const DMA_MASTER_CYCLES_PER_CHANNEL: u64 = 8;

/// B-bus offset pattern for each of the eight transfer-unit selections.
/// Index with `control & 7`; the pattern repeats over the transfer length.
pub fn transfer_pattern(unit: u8) -> &'static [u8] {
    match unit & 0x07 {
        0 => &[0],
        1 => &[0, 1],
        2 => &[0, 0],
        3 => &[0, 0, 1, 1],
        4 => &[0, 1, 2, 3],
        5 => &[0, 1, 0, 1], // undocumented
        6 => &[0, 0],       // undocumented
        7 => &[0, 0, 1, 1], // undocumented
        _ => unreachable!(),
    }
}

#[derive(Debug, Clone)]
pub struct DmaChannel {
    pub control: u8,      // DMA制御レジスタ ($43x0)
    pub b_bus_target: u8, // Bバス転送先下位バイト ($43x1)
    pub a_addr: u16,      // Aバスアドレス ($43x2-$43x3)
    pub a_bank: u8,       // Aバスバンク ($43x4)
    pub byte_count: u16,  // 転送サイズ ($43x5-$43x6)、0は65536扱い
    pub indirect_bank: u8, // ($43x7) 保持のみ。転送エンジンは参照しない
    pub unused: u8,       // Unused shared byte ($43xB and $43xF)

    // HDMAランタイム状態（一般DMAとは排他）
    pub table_addr: u16, // HDMAテーブル現在アドレス ($43x8-$43x9)
    pub table_bank: u8,
    pub line_counter: u8, // 残りライン数 ($43xA の下位7ビット)
    pub do_transfer: bool,
    pub terminated: bool,
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaChannel {
    pub fn new() -> Self {
        Self {
            // Power-on defaults per SNESdev wiki:
            // - DMAPn  = $FF
            // - BBADn  = $FF
            // - A1Tn   = $FFFFFF
            // - DASn   = $FFFF
            control: 0xFF,
            b_bus_target: 0xFF,
            a_addr: 0xFFFF,
            a_bank: 0xFF,
            byte_count: 0xFFFF,
            indirect_bank: 0xFF,
            unused: 0xFF,
            table_addr: 0xFFFF,
            table_bank: 0xFF,
            line_counter: 0xFF,
            do_transfer: false,
            terminated: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Transfer direction: bit 7 set reads the B-bus register into A-bus
    /// memory instead of the usual A-bus to B-bus direction.
    pub fn is_b_to_a(&self) -> bool {
        self.control & 0x80 != 0
    }

    pub fn transfer_unit(&self) -> u8 {
        self.control & 0x07
    }

    /// A-bus address step per transferred byte: +1, -1, or fixed.
    pub fn a_step(&self) -> i8 {
        match (self.control >> 3) & 0x03 {
            0 => 1,
            2 => -1,
            _ => 0,
        }
    }

    pub fn step_a_addr(&mut self) {
        self.a_addr = match self.a_step() {
            1 => self.a_addr.wrapping_add(1),
            -1 => self.a_addr.wrapping_sub(1),
            _ => self.a_addr,
        };
    }

    /// HDMA idle detection: a channel whose table pointer, bank, and line
    /// counter are all zero never had a table seeded; treating it as a live
    /// channel would read WRAM byte 0 as a spurious descriptor.
    pub fn hdma_is_idle(&self) -> bool {
        self.table_addr == 0 && self.table_bank == 0 && self.line_counter == 0
    }
}

#[derive(Debug)]
pub struct DmaController {
    pub channels: [DmaChannel; 8],
    pub gdma_enable: u8, // 直近の $420B 書き込み値
    pub hdma_enable: u8, // HDMA有効チャンネル ($420C)
}

impl DmaController {
    pub fn new() -> Self {
        Self {
            channels: Default::default(),
            gdma_enable: 0,
            hdma_enable: 0,
        }
    }

    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.reset();
        }
        self.gdma_enable = 0;
        self.hdma_enable = 0;
    }

    /// Channel register write, `$4300-$43FF`. `$420B/$420C` are handled by
    /// the bus because they have transfer side effects.
    pub fn write(&mut self, addr: u16, value: u8) {
        let channel = ((addr - 0x4300) >> 4) as usize;
        let reg = (addr & 0x0F) as u8;
        // Channel index out of 0-7 is a caller bug, not a runtime condition.
        debug_assert!(channel < 8, "DMA channel register write out of range");
        if channel >= 8 {
            return;
        }

        if debug_flags::dma_reg() {
            log::trace!("DMA ch{} reg ${:X} <= {:02X}", channel, reg, value);
        }

        let ch = &mut self.channels[channel];
        match reg {
            0x00 => ch.control = value,
            0x01 => ch.b_bus_target = value,
            0x02 => ch.a_addr = (ch.a_addr & 0xFF00) | value as u16,
            0x03 => ch.a_addr = (ch.a_addr & 0x00FF) | ((value as u16) << 8),
            0x04 => ch.a_bank = value,
            0x05 => ch.byte_count = (ch.byte_count & 0xFF00) | value as u16,
            0x06 => ch.byte_count = (ch.byte_count & 0x00FF) | ((value as u16) << 8),
            0x07 => ch.indirect_bank = value,
            0x08 => ch.table_addr = (ch.table_addr & 0xFF00) | value as u16,
            0x09 => ch.table_addr = (ch.table_addr & 0x00FF) | ((value as u16) << 8),
            0x0A => ch.line_counter = value & 0x7F,
            0x0B | 0x0F => ch.unused = value,
            // $43xC-$43xE are holes: writes ignored, reads are open bus.
            _ => {}
        }
    }

    /// Channel register read. `None` resolves to open bus at the bus layer.
    pub fn read(&self, addr: u16) -> Option<u8> {
        let channel = ((addr - 0x4300) >> 4) as usize;
        let reg = (addr & 0x0F) as u8;
        if channel >= 8 {
            return None;
        }

        let ch = &self.channels[channel];
        match reg {
            0x00 => Some(ch.control),
            0x01 => Some(ch.b_bus_target),
            0x02 => Some((ch.a_addr & 0xFF) as u8),
            0x03 => Some((ch.a_addr >> 8) as u8),
            0x04 => Some(ch.a_bank),
            0x05 => Some((ch.byte_count & 0xFF) as u8),
            0x06 => Some((ch.byte_count >> 8) as u8),
            0x07 => Some(ch.indirect_bank),
            0x08 => Some((ch.table_addr & 0xFF) as u8),
            0x09 => Some((ch.table_addr >> 8) as u8),
            0x0A => Some(ch.line_counter),
            0x0B | 0x0F => Some(ch.unused),
            _ => None,
        }
    }

    /// Seed HDMA runtime state from the A-bus registers. Called once per
    /// frame at the vblank-to-next-frame boundary.
    pub fn hdma_init(&mut self, mask: u8) {
        for i in 0..8 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let ch = &mut self.channels[i];
            ch.table_addr = ch.a_addr;
            ch.table_bank = ch.a_bank;
            ch.line_counter = 0;
            ch.do_transfer = false;
            ch.terminated = false;
            if debug_flags::hdma() {
                log::trace!(
                    "HDMA ch{} table seeded at {:02X}:{:04X}",
                    i,
                    ch.table_bank,
                    ch.table_addr
                );
            }
        }
    }
}

impl Default for DmaController {
    fn default() -> Self {
        Self::new()
    }
}

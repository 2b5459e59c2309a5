//! Central memory-mapped dispatcher.
//!
//! The bus is the only component that touches system RAM, the cartridge, or
//! any register block; every cross-component effect (DMA into a video
//! register, an enable write re-arming an interrupt) goes through the
//! dispatch methods here. It also owns the open-bus latch, the DMA stall
//! account, and the cross-domain handshake ports.

use crate::apu::{ApuPorts, AudioCoprocessor, HleApu};
use crate::cartridge::{Cartridge, MapperKind};
use crate::cpu_bus::CpuBus;
use crate::debug_flags;
use crate::dma::{
    self, DmaController, DMA_MASTER_CYCLES_PER_BYTE, DMA_MASTER_CYCLES_PER_CHANNEL,
};
use crate::input::InputSystem;
use crate::interrupts::InterruptController;
use crate::ppu::{PpuTimer, RegisterFileVideo, VideoPort};

pub const WRAM_SIZE: usize = 0x20000;

pub struct Bus {
    wram: Vec<u8>,
    pub ppu_timer: PpuTimer,
    pub interrupts: InterruptController,
    pub dma: DmaController,
    pub apu_ports: ApuPorts,
    apu: Box<dyn AudioCoprocessor>,
    video: Box<dyn VideoPort>,
    cartridge: Option<Cartridge>,
    pub input: InputSystem,

    // 直近にバスを流れた値。未マップの読み出しはこれを返す。
    open_bus: u8,
    mapper: MapperKind,
    // Plausibility override: applies only to the trailing page of banks
    // $00/$80 (reset vector and friends), never to general reads.
    vector_override: Option<MapperKind>,
    pending_stall_master_cycles: u64,
    // Mirror of the CPU's WAI state for the floating-bus rule.
    cpu_waiting: bool,

    // $2180-$2183 WRAMデータポート
    wram_port_addr: u32,
    // CPU math unit ($4202-$4206 / $4214-$4217)
    wrmpya: u8,
    wrdiv: u16,
    rddiv: u16,
    rdmpy: u16,
    // $4201 WRIO
    wrio: u8,
    // $420D MEMSEL bit0
    fastrom: bool,
    // Auto-joypad results ($4218-$421B)
    joy1: u16,
    joy2: u16,
}

impl Bus {
    pub fn new() -> Self {
        let mut apu_ports = ApuPorts::new();
        let mut apu: Box<dyn AudioCoprocessor> = Box::new(HleApu::new());
        apu.reset(&mut apu_ports);
        Self {
            wram: vec![0; WRAM_SIZE],
            ppu_timer: PpuTimer::new(),
            interrupts: InterruptController::new(),
            dma: DmaController::new(),
            apu_ports,
            apu,
            video: Box::new(RegisterFileVideo::new()),
            cartridge: None,
            input: InputSystem::new(),
            open_bus: 0,
            mapper: MapperKind::Unknown,
            vector_override: None,
            pending_stall_master_cycles: 0,
            cpu_waiting: false,
            wram_port_addr: 0,
            wrmpya: 0,
            wrdiv: 0,
            rddiv: 0,
            rdmpy: 0,
            wrio: 0xFF,
            fastrom: false,
            joy1: 0,
            joy2: 0,
        }
    }

    /// Soft reset. Counters, latches and the mapping override are cleared;
    /// the cartridge reference (and WRAM contents) survive. The override is
    /// then re-derived from the inserted cartridge.
    pub fn reset(&mut self) {
        self.ppu_timer.reset();
        self.interrupts.reset();
        self.dma.reset();
        self.apu_ports.reset();
        self.apu.reset(&mut self.apu_ports);
        self.video.reset();
        self.input.reset();
        self.open_bus = 0;
        self.vector_override = None;
        self.pending_stall_master_cycles = 0;
        self.cpu_waiting = false;
        self.wram_port_addr = 0;
        self.wrmpya = 0;
        self.wrdiv = 0;
        self.rddiv = 0;
        self.rdmpy = 0;
        self.wrio = 0xFF;
        self.fastrom = false;
        self.joy1 = 0;
        self.joy2 = 0;
        if let Some(cart) = &self.cartridge {
            self.vector_override = Self::detect_vector_override(cart);
        }
    }

    pub fn insert_cartridge(&mut self, cartridge: Cartridge) {
        self.mapper = cartridge.header.mapper_kind;
        self.vector_override = Self::detect_vector_override(&cartridge);
        if let Some(alt) = self.vector_override {
            log::info!(
                "declared mapping {:?} fails the reset-vector plausibility check; \
                 using {:?} for vector-page reads",
                self.mapper,
                alt
            );
        } else if debug_flags::mapper() {
            log::debug!(
                "mapping {:?}, reset vector {:#06x}",
                self.mapper,
                cartridge.reset_vector(self.mapper)
            );
        }
        self.cartridge = Some(cartridge);
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cartridge.as_ref()
    }

    pub fn cartridge_mut(&mut self) -> Option<&mut Cartridge> {
        self.cartridge.as_mut()
    }

    /// The heuristic's decision, exposed for diagnosis.
    pub fn mapping_override(&self) -> Option<MapperKind> {
        self.vector_override
    }

    pub fn mapper(&self) -> MapperKind {
        self.mapper
    }

    pub fn set_video_port(&mut self, video: Box<dyn VideoPort>) {
        self.video = video;
    }

    pub fn set_audio_coprocessor(&mut self, mut apu: Box<dyn AudioCoprocessor>) {
        apu.reset(&mut self.apu_ports);
        self.apu = apu;
    }

    pub fn wram(&self) -> &[u8] {
        &self.wram
    }

    pub fn set_cpu_waiting(&mut self, waiting: bool) {
        self.cpu_waiting = waiting;
    }

    pub fn take_pending_stall_master_cycles(&mut self) -> u64 {
        std::mem::take(&mut self.pending_stall_master_cycles)
    }

    pub fn has_pending_stall(&self) -> bool {
        self.pending_stall_master_cycles > 0
    }

    pub fn is_fastrom(&self) -> bool {
        self.fastrom
    }

    // --- Mapping plausibility -----------------------------------------------

    fn mapping_is_plausible(cart: &Cartridge, mapper: MapperKind) -> bool {
        let vector = cart.reset_vector(mapper);
        if vector == 0x0000 || vector == 0xFFFF {
            return false;
        }
        // Reset code lives in the upper-half ROM window.
        if vector < 0x8000 {
            return false;
        }
        // Opcodes that cannot plausibly start a reset routine. Kept small on
        // purpose; widening it would reclassify legitimate ROMs.
        let opcode = cart.reset_opcode(mapper);
        !matches!(opcode, 0x00 | 0xFF)
    }

    fn detect_vector_override(cart: &Cartridge) -> Option<MapperKind> {
        let declared = cart.header.mapper_kind;
        let alternate = match declared {
            MapperKind::LoRom => MapperKind::HiRom,
            MapperKind::HiRom => MapperKind::LoRom,
            MapperKind::Unknown => return None,
        };
        if !Self::mapping_is_plausible(cart, declared)
            && Self::mapping_is_plausible(cart, alternate)
        {
            Some(alternate)
        } else {
            None
        }
    }

    // --- Dispatch -----------------------------------------------------------

    /// Public entry in bank:addr form.
    pub fn read8(&mut self, bank: u8, addr: u16) -> u8 {
        self.read8_internal(((bank as u32) << 16) | addr as u32, false)
    }

    pub fn write8(&mut self, bank: u8, addr: u16, value: u8) {
        self.write8_internal(((bank as u32) << 16) | addr as u32, value)
    }

    /// DMA-initiated read: bypasses the WAI floating-bus short-circuit,
    /// because the DMA unit keeps the bus driven while the CPU idles.
    fn read8_dma(&mut self, addr: u32) -> u8 {
        self.read8_internal(addr, true)
    }

    fn write8_dma(&mut self, addr: u32, value: u8) {
        self.write8_internal(addr, value)
    }

    fn read8_internal(&mut self, addr: u32, from_dma: bool) -> u8 {
        let addr = addr & 0x00FF_FFFF;

        // A waiting CPU leaves the bus floating: reads resolve to the latch.
        if !from_dma
            && self.cpu_waiting
            && !self.interrupts.nmi_line()
            && !self.interrupts.irq_line()
        {
            return self.open_bus;
        }

        match self.dispatch_read(addr) {
            Some(value) => {
                self.open_bus = value;
                value
            }
            None => self.open_bus,
        }
    }

    fn write8_internal(&mut self, addr: u32, value: u8) {
        let addr = addr & 0x00FF_FFFF;
        // Writes drive the bus too.
        self.open_bus = value;

        let bank = (addr >> 16) as u8;
        let offset = (addr & 0xFFFF) as u16;
        match bank {
            0x7E | 0x7F => self.wram[(addr - 0x7E_0000) as usize] = value,
            0x00..=0x3F | 0x80..=0xBF => self.system_area_write(bank, offset, value),
            _ => self.cartridge_write(bank, offset, value),
        }
    }

    fn dispatch_read(&mut self, addr: u32) -> Option<u8> {
        let bank = (addr >> 16) as u8;
        let offset = (addr & 0xFFFF) as u16;
        match bank {
            0x7E | 0x7F => Some(self.wram[(addr - 0x7E_0000) as usize]),
            0x00..=0x3F | 0x80..=0xBF => self.system_area_read(bank, offset),
            _ => self.cartridge_read(bank, offset),
        }
    }

    fn system_area_read(&mut self, bank: u8, offset: u16) -> Option<u8> {
        match offset {
            // Low 8KiB of WRAM is mirrored into every system bank.
            0x0000..=0x1FFF => Some(self.wram[offset as usize]),
            0x2100..=0x213F => Some(self.video.read_register(offset, self.open_bus)),
            // APU ports mirror every four bytes through $217F.
            0x2140..=0x217F => Some(self.apu_ports.cpu_read((offset & 3) as usize)),
            0x2180 => {
                let value = self.wram[self.wram_port_addr as usize];
                self.wram_port_addr = (self.wram_port_addr + 1) % WRAM_SIZE as u32;
                Some(value)
            }
            // $2181-$2183 are write-only (WRAM port address).
            0x4016 => Some((self.input.read_port1() & 0x03) | (self.open_bus & 0xFC)),
            0x4017 => Some((self.input.read_port2() & 0x03) | (self.open_bus & 0xE0) | 0x1C),
            0x4210 => {
                let value = self.interrupts.read_status_nmi();
                Some(value | (self.open_bus & 0x70))
            }
            0x4211 => Some(self.interrupts.read_status_irq(self.open_bus)),
            0x4212 => {
                // HVBJOY: vblank, hblank, auto-joypad busy.
                let mut value = self.open_bus & 0x3E;
                if self.ppu_timer.is_vblank() {
                    value |= 0x80;
                }
                if self.ppu_timer.is_hblank() {
                    value |= 0x40;
                }
                if self.ppu_timer.auto_joypad_busy() {
                    value |= 0x01;
                }
                Some(value)
            }
            0x4213 => Some(self.wrio),
            0x4214 => Some((self.rddiv & 0xFF) as u8),
            0x4215 => Some((self.rddiv >> 8) as u8),
            0x4216 => Some((self.rdmpy & 0xFF) as u8),
            0x4217 => Some((self.rdmpy >> 8) as u8),
            0x4218 => Some((self.joy1 & 0xFF) as u8),
            0x4219 => Some((self.joy1 >> 8) as u8),
            0x421A => Some((self.joy2 & 0xFF) as u8),
            0x421B => Some((self.joy2 >> 8) as u8),
            // Pads 3/4 are not wired.
            0x421C..=0x421F => Some(0x00),
            0x4300..=0x437F => self.dma.read(offset),
            0x6000..=0x7FFF | 0x8000..=0xFFFF => self.cartridge_read(bank, offset),
            _ => None,
        }
    }

    fn system_area_write(&mut self, bank: u8, offset: u16, value: u8) {
        match offset {
            0x0000..=0x1FFF => self.wram[offset as usize] = value,
            0x2100..=0x213F => self.video.write_register(offset, value),
            0x2140..=0x217F => self.apu_ports.cpu_write((offset & 3) as usize, value),
            0x2180 => {
                self.wram[self.wram_port_addr as usize] = value;
                self.wram_port_addr = (self.wram_port_addr + 1) % WRAM_SIZE as u32;
            }
            0x2181 => {
                self.wram_port_addr = (self.wram_port_addr & 0x1_FF00) | value as u32;
            }
            0x2182 => {
                self.wram_port_addr = (self.wram_port_addr & 0x1_00FF) | ((value as u32) << 8);
            }
            0x2183 => {
                self.wram_port_addr =
                    (self.wram_port_addr & 0x0_FFFF) | (((value & 1) as u32) << 16);
            }
            0x4016 => self.input.write_strobe(value),
            0x4200 => self.interrupts.set_enable_register(value),
            0x4201 => self.wrio = value,
            0x4202 => self.wrmpya = value,
            0x4203 => {
                // Result is available immediately; the real delay is below
                // what any instruction sequence can observe through this bus.
                self.rdmpy = (self.wrmpya as u16).wrapping_mul(value as u16);
            }
            0x4204 => self.wrdiv = (self.wrdiv & 0xFF00) | value as u16,
            0x4205 => self.wrdiv = (self.wrdiv & 0x00FF) | ((value as u16) << 8),
            0x4206 => {
                if value == 0 {
                    self.rddiv = 0xFFFF;
                    self.rdmpy = self.wrdiv;
                } else {
                    self.rddiv = self.wrdiv / value as u16;
                    self.rdmpy = self.wrdiv % value as u16;
                }
            }
            0x4207 => self.interrupts.set_htime_low(value),
            0x4208 => self.interrupts.set_htime_high(value),
            0x4209 => self.interrupts.set_vtime_low(value),
            0x420A => self.interrupts.set_vtime_high(value),
            0x420B => {
                self.dma.gdma_enable = value;
                self.run_general_dma(value);
            }
            0x420C => self.dma.hdma_enable = value,
            0x420D => self.fastrom = value & 1 != 0,
            0x4300..=0x437F => self.dma.write(offset, value),
            0x6000..=0x7FFF | 0x8000..=0xFFFF => self.cartridge_write(bank, offset, value),
            _ => {}
        }
    }

    /// Effective mapping for a read, honoring the vector-page override.
    fn effective_mapper(&self, bank: u8, offset: u16) -> MapperKind {
        if offset >= 0xFF00 && (bank == 0x00 || bank == 0x80) {
            self.vector_override.unwrap_or(self.mapper)
        } else {
            self.mapper
        }
    }

    fn sram_index(&self, bank: u8, offset: u16) -> Option<usize> {
        match self.mapper {
            MapperKind::LoRom => {
                if (0x70..=0x7D).contains(&bank) && offset < 0x8000 {
                    Some(((bank - 0x70) as usize) * 0x8000 + offset as usize)
                } else {
                    None
                }
            }
            MapperKind::HiRom => {
                if matches!(bank, 0x20..=0x3F | 0xA0..=0xBF) && (0x6000..=0x7FFF).contains(&offset)
                {
                    Some(((bank & 0x1F) as usize) * 0x2000 + (offset - 0x6000) as usize)
                } else {
                    None
                }
            }
            MapperKind::Unknown => None,
        }
    }

    fn cartridge_read(&mut self, bank: u8, offset: u16) -> Option<u8> {
        let mapper = self.effective_mapper(bank, offset);
        let cart = self.cartridge.as_ref()?;
        if let Some(index) = self.sram_index(bank, offset) {
            if !cart.sram.is_empty() {
                return Some(cart.sram_read(index));
            }
        }
        let mapped = match mapper {
            MapperKind::LoRom => offset >= 0x8000,
            MapperKind::HiRom => offset >= 0x8000 || matches!(bank, 0x40..=0x7D | 0xC0..=0xFF),
            MapperKind::Unknown => false,
        };
        if !mapped {
            return None;
        }
        let addr = ((bank as u32) << 16) | offset as u32;
        Some(cart.read(addr, mapper))
    }

    fn cartridge_write(&mut self, bank: u8, offset: u16, value: u8) {
        if let Some(index) = self.sram_index(bank, offset) {
            if let Some(cart) = self.cartridge.as_mut() {
                cart.sram_write(index, value);
            }
            return;
        }
        // ROM writes fall off the bus.
        if debug_flags::mapper() {
            log::trace!("ignored write {:02X}:{:04X} <= {:02X}", bank, offset, value);
        }
    }

    // --- General DMA --------------------------------------------------------

    /// One-shot block transfers for every channel in `mask`. The stall cost
    /// is accumulated and consumed by the driver before the CPU resumes.
    pub fn run_general_dma(&mut self, mask: u8) {
        if mask == 0 {
            return;
        }
        let mut total_bytes: u64 = 0;
        let mut channels_activated: u64 = 0;

        for i in 0..8 {
            if mask & (1 << i) == 0 {
                continue;
            }
            channels_activated += 1;

            // Copy the scalar channel state out; the transfer loop below
            // needs the whole bus.
            let (control, b_base, mut a_addr, a_bank, mut count) = {
                let ch = &self.dma.channels[i];
                (ch.control, ch.b_bus_target, ch.a_addr, ch.a_bank, ch.byte_count)
            };
            let pattern = dma::transfer_pattern(control);
            let b_to_a = control & 0x80 != 0;
            let step: i32 = match (control >> 3) & 0x03 {
                0 => 1,
                2 => -1,
                _ => 0,
            };

            if debug_flags::dma() {
                log::debug!(
                    "DMA ch{} {} {:02X}:{:04X} {} $21{:02X} count={} unit={}",
                    i,
                    if b_to_a { "<-" } else { "->" },
                    a_bank,
                    a_addr,
                    if b_to_a { "from" } else { "to" },
                    b_base,
                    count,
                    control & 7
                );
            }

            let mut index = 0usize;
            // バイトカウント0は65536バイト転送
            loop {
                let b_offset = b_base.wrapping_add(pattern[index % pattern.len()]);
                let b_addr = 0x2100u32 | b_offset as u32;
                let a_full = ((a_bank as u32) << 16) | a_addr as u32;
                if b_to_a {
                    let value = self.read8_dma(b_addr);
                    self.write8_dma(a_full, value);
                } else {
                    let value = self.read8_dma(a_full);
                    self.write8_dma(b_addr, value);
                }
                a_addr = match step {
                    1 => a_addr.wrapping_add(1),
                    -1 => a_addr.wrapping_sub(1),
                    _ => a_addr,
                };
                count = count.wrapping_sub(1);
                total_bytes += 1;
                index += 1;
                if count == 0 {
                    break;
                }
            }

            let ch = &mut self.dma.channels[i];
            ch.a_addr = a_addr;
            ch.byte_count = 0;
        }

        let stall = total_bytes * DMA_MASTER_CYCLES_PER_BYTE
            + channels_activated * DMA_MASTER_CYCLES_PER_CHANNEL;
        self.pending_stall_master_cycles += stall;
    }

    // --- HDMA ---------------------------------------------------------------

    /// One HDMA pass, called once per visible scanline.
    pub fn run_hdma_line(&mut self) {
        let mask = self.dma.hdma_enable;
        if mask == 0 {
            return;
        }
        for i in 0..8 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let (control, b_base, mut table_addr, table_bank, mut line_counter, mut do_transfer) = {
                let ch = &self.dma.channels[i];
                if ch.terminated || ch.hdma_is_idle() {
                    continue;
                }
                (
                    ch.control,
                    ch.b_bus_target,
                    ch.table_addr,
                    ch.table_bank,
                    ch.line_counter,
                    ch.do_transfer,
                )
            };

            if line_counter == 0 {
                let desc = self.read8_dma(((table_bank as u32) << 16) | table_addr as u32);
                table_addr = table_addr.wrapping_add(1);
                if desc == 0 {
                    // 終了マーカー: このフレームの残りは休止
                    let ch = &mut self.dma.channels[i];
                    ch.terminated = true;
                    ch.table_addr = table_addr;
                    if debug_flags::hdma() {
                        log::trace!("HDMA ch{} terminated for the frame", i);
                    }
                    continue;
                }
                line_counter = desc & 0x7F;
                // Top bit set: this entry only carries the line count; the
                // load line itself transfers nothing.
                do_transfer = desc & 0x80 == 0;
                if do_transfer {
                    table_addr = self.hdma_transfer_batch(control, b_base, table_bank, table_addr);
                }
            } else {
                table_addr = self.hdma_transfer_batch(control, b_base, table_bank, table_addr);
                line_counter -= 1;
            }

            let ch = &mut self.dma.channels[i];
            ch.table_addr = table_addr;
            ch.line_counter = line_counter;
            ch.do_transfer = do_transfer;
        }
    }

    /// Transfer one pattern-sized batch from the table into the B-bus
    /// register window; returns the advanced table pointer.
    fn hdma_transfer_batch(
        &mut self,
        control: u8,
        b_base: u8,
        table_bank: u8,
        mut table_addr: u16,
    ) -> u16 {
        let pattern = dma::transfer_pattern(control);
        for &b_off in pattern {
            let value = self.read8_dma(((table_bank as u32) << 16) | table_addr as u32);
            table_addr = table_addr.wrapping_add(1);
            let b_addr = 0x2100u32 | b_base.wrapping_add(b_off) as u32;
            self.write8_dma(b_addr, value);
        }
        table_addr
    }

    // --- Per-dot stepping ---------------------------------------------------

    /// Advance the video timing by one dot, feeding the interrupt controller
    /// and the HDMA scheduler from the resulting edges.
    pub fn step_dot(&mut self) {
        self.ppu_timer.step_dot();

        if self.ppu_timer.entered_vblank() {
            self.interrupts.on_enter_vblank();
            self.video.on_vblank();
            if self.interrupts.auto_joypad_enabled() {
                let (j1, j2) = self.input.auto_read();
                self.joy1 = j1;
                self.joy2 = j2;
                self.ppu_timer.start_auto_joypad_busy();
            }
        }
        if self.ppu_timer.left_vblank() {
            self.interrupts.on_leave_vblank();
            // New frame: reseed the HDMA tables.
            let mask = self.dma.hdma_enable;
            self.dma.hdma_init(mask);
        }
        if self.ppu_timer.line_started() && self.ppu_timer.is_visible_scanline() {
            self.run_hdma_line();
        }

        self.interrupts
            .poll_hv_match(self.ppu_timer.dot, self.ppu_timer.scanline);
    }

    /// Forward a master-cycle slice to the sound domain. Pending CPU-side
    /// port writes become visible at this boundary.
    pub fn step_apu(&mut self, master_cycles: u64) {
        self.apu_ports.apply_pending();
        self.apu.step(master_cycles, &mut self.apu_ports);
    }

    fn is_rom_address(&self, addr: u32) -> bool {
        let bank = (addr >> 16) as u8;
        let offset = (addr & 0xFFFF) as u16;
        match bank {
            0x7E | 0x7F => false,
            0x40..=0x7D | 0xC0..=0xFF => true,
            _ => offset >= 0x8000,
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBus for Bus {
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.read8_internal(addr, false)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        self.write8_internal(addr, value)
    }

    fn opcode_memory_penalty(&mut self, addr: u32) -> u8 {
        if debug_flags::mem_timing() && !self.fastrom && self.is_rom_address(addr) {
            2
        } else {
            0
        }
    }

    fn poll_nmi(&mut self) -> bool {
        self.interrupts.nmi_line()
    }

    fn poll_irq(&mut self) -> bool {
        self.interrupts.irq_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::test_rom::{make_hirom, make_lorom};
    use crate::ppu::{DOTS_PER_LINE, SCANLINES_PER_FRAME, VBLANK_START_LINE};

    fn bus_with_lorom() -> Bus {
        let mut bus = Bus::new();
        let cart = Cartridge::load_from_bytes(make_lorom(&[0x78, 0x18], 0x8000)).unwrap();
        bus.insert_cartridge(cart);
        bus
    }

    fn step_dots(bus: &mut Bus, n: u32) {
        for _ in 0..n {
            bus.step_dot();
        }
    }

    #[test]
    fn wram_is_mirrored_into_system_banks() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x0123, 0x42);
        assert_eq!(bus.read8(0x7E, 0x0123), 0x42);
        assert_eq!(bus.read8(0x80, 0x0123), 0x42);
    }

    #[test]
    fn open_bus_returns_last_transferred_value() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x0000, 0x5A);
        assert_eq!(bus.read8(0x00, 0x0000), 0x5A);
        // $5000 in bank 0 is claimed by nothing (no cartridge): open bus.
        assert_eq!(bus.read8(0x00, 0x5000), 0x5A);
        // The latch follows every successful transaction.
        bus.write8(0x00, 0x0001, 0xC3);
        assert_eq!(bus.read8(0x00, 0x5000), 0xC3);
    }

    #[test]
    fn waiting_cpu_reads_float_to_open_bus() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x0000, 0x99);
        bus.write8(0x00, 0x0010, 0x11); // open bus now 0x11
        bus.set_cpu_waiting(true);
        // CPU-path read short-circuits.
        assert_eq!(bus.read8(0x00, 0x0000), 0x11);
        // DMA-path read does not.
        assert_eq!(bus.read8_dma(0x000000), 0x99);
    }

    #[test]
    fn wram_data_port_autoincrements() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x2181, 0x00);
        bus.write8(0x00, 0x2182, 0x10);
        bus.write8(0x00, 0x2183, 0x00);
        bus.write8(0x00, 0x2180, 0xAA);
        bus.write8(0x00, 0x2180, 0xBB);
        assert_eq!(bus.read8(0x7E, 0x1000), 0xAA);
        assert_eq!(bus.read8(0x7E, 0x1001), 0xBB);

        bus.write8(0x00, 0x2181, 0x00);
        bus.write8(0x00, 0x2182, 0x10);
        assert_eq!(bus.read8(0x00, 0x2180), 0xAA);
        assert_eq!(bus.read8(0x00, 0x2180), 0xBB);
    }

    #[test]
    fn math_unit_multiplies_and_divides() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x4202, 0x12);
        bus.write8(0x00, 0x4203, 0x34);
        assert_eq!(bus.read8(0x00, 0x4216), (0x12u16 * 0x34) as u8);
        assert_eq!(bus.read8(0x00, 0x4217), ((0x12u16 * 0x34) >> 8) as u8);

        bus.write8(0x00, 0x4204, 0x39); // 10041 = $2739
        bus.write8(0x00, 0x4205, 0x27);
        bus.write8(0x00, 0x4206, 100);
        let quot = bus.read8(0x00, 0x4214) as u16 | ((bus.read8(0x00, 0x4215) as u16) << 8);
        let rem = bus.read8(0x00, 0x4216) as u16 | ((bus.read8(0x00, 0x4217) as u16) << 8);
        assert_eq!(quot, 100);
        assert_eq!(rem, 41);
    }

    #[test]
    fn divide_by_zero_saturates() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x4204, 0x34);
        bus.write8(0x00, 0x4205, 0x12);
        bus.write8(0x00, 0x4206, 0);
        let quot = bus.read8(0x00, 0x4214) as u16 | ((bus.read8(0x00, 0x4215) as u16) << 8);
        let rem = bus.read8(0x00, 0x4216) as u16 | ((bus.read8(0x00, 0x4217) as u16) << 8);
        assert_eq!(quot, 0xFFFF);
        assert_eq!(rem, 0x1234);
    }

    #[test]
    fn apu_port_write_is_deferred_until_step() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x2140, 0x7E);
        assert_eq!(bus.apu_ports.apu_read(0), 0x00);
        bus.step_apu(64);
        assert_eq!(bus.apu_ports.apu_read(0), 0x7E);
    }

    #[test]
    fn apu_ports_mirror_through_217f() {
        let mut bus = Bus::new();
        // HleApu shows AA/BB after reset.
        assert_eq!(bus.read8(0x00, 0x2140), 0xAA);
        assert_eq!(bus.read8(0x00, 0x2144), 0xAA);
        assert_eq!(bus.read8(0x00, 0x217D), 0xBB);
    }

    #[test]
    fn cartridge_reads_through_lorom_mapping() {
        let mut bus = bus_with_lorom();
        assert_eq!(bus.read8(0x00, 0x8000), 0x78);
        assert_eq!(bus.read8(0x00, 0x8001), 0x18);
    }

    #[test]
    fn lorom_lower_half_is_open_bus_outside_registers() {
        let mut bus = bus_with_lorom();
        bus.write8(0x00, 0x0000, 0x77);
        assert_eq!(bus.read8(0x00, 0x5000), 0x77);
    }

    #[test]
    fn sram_window_reads_and_writes_lorom() {
        let mut bus = bus_with_lorom();
        bus.write8(0x70, 0x0010, 0x3C);
        assert_eq!(bus.read8(0x70, 0x0010), 0x3C);
    }

    #[test]
    fn sram_window_reads_and_writes_hirom() {
        let mut bus = Bus::new();
        let cart = Cartridge::load_from_bytes(make_hirom(&[0xEA], 0x8000)).unwrap();
        bus.insert_cartridge(cart);
        bus.write8(0x20, 0x6000, 0x99);
        assert_eq!(bus.read8(0x20, 0x6000), 0x99);
    }

    #[test]
    fn mapping_override_applies_to_vector_page_only() {
        // Declared (scored) LoROM whose reset vector is garbage, while the
        // HiROM view of the vector page is plausible.
        let mut rom = make_lorom(&[0xEA], 0x8000);
        rom[0x7FFC] = 0xFF; // LoROM vector -> $FFFF
        rom[0x7FFD] = 0xFF;
        rom[0xFFFC] = 0x00; // HiROM vector -> $8000
        rom[0xFFFD] = 0x80;
        rom[0x8000] = 0x78; // SEI at the HiROM target
        let cart = Cartridge::load_from_bytes(rom).unwrap();
        assert_eq!(cart.header.mapper_kind, MapperKind::LoRom);

        let mut bus = Bus::new();
        bus.insert_cartridge(cart);
        assert_eq!(bus.mapping_override(), Some(MapperKind::HiRom));

        // Vector page reads go through the alternate mapping.
        assert_eq!(bus.read8(0x00, 0xFFFC), 0x00);
        assert_eq!(bus.read8(0x00, 0xFFFD), 0x80);
        // Ordinary code reads still use the declared mapping
        // (LoROM $00:8000 -> file offset 0, the EA we placed there).
        assert_eq!(bus.read8(0x00, 0x8000), 0xEA);
    }

    #[test]
    fn no_override_when_declared_mapping_is_plausible() {
        let mut bus = bus_with_lorom();
        assert_eq!(bus.mapping_override(), None);
        assert_eq!(bus.read8(0x00, 0xFFFC), 0x00);
        assert_eq!(bus.read8(0x00, 0xFFFD), 0x80);
    }

    #[test]
    fn general_dma_transfers_and_accumulates_stall() {
        let mut bus = Bus::new();
        bus.write8(0x7E, 0x0100, 0x11);
        bus.write8(0x7E, 0x0101, 0x22);
        bus.write8(0x7E, 0x0102, 0x33);
        bus.write8(0x7E, 0x0103, 0x44);

        // Channel 0: unit 0 (single byte), increment, A->B to $2100.
        bus.write8(0x00, 0x4300, 0x00);
        bus.write8(0x00, 0x4301, 0x00);
        bus.write8(0x00, 0x4302, 0x00);
        bus.write8(0x00, 0x4303, 0x01);
        bus.write8(0x00, 0x4304, 0x7E);
        bus.write8(0x00, 0x4305, 0x04);
        bus.write8(0x00, 0x4306, 0x00);
        bus.write8(0x00, 0x420B, 0x01);

        // Last byte written to the register file wins.
        assert_eq!(bus.read8(0x00, 0x2100), 0x44);
        assert_eq!(
            bus.take_pending_stall_master_cycles(),
            4 * DMA_MASTER_CYCLES_PER_BYTE + DMA_MASTER_CYCLES_PER_CHANNEL
        );
        // Counter is zeroed at the end of a one-shot transfer.
        assert_eq!(bus.dma.channels[0].byte_count, 0);
        assert_eq!(bus.dma.channels[0].a_addr, 0x0104);
    }

    #[test]
    fn dma_pattern_walks_register_window() {
        let mut bus = Bus::new();
        bus.write8(0x7E, 0x0200, 0xAA);
        bus.write8(0x7E, 0x0201, 0xBB);

        // Unit 1: two registers ($2102/$2103).
        bus.write8(0x00, 0x4310, 0x01);
        bus.write8(0x00, 0x4311, 0x02);
        bus.write8(0x00, 0x4312, 0x00);
        bus.write8(0x00, 0x4313, 0x02);
        bus.write8(0x00, 0x4314, 0x7E);
        bus.write8(0x00, 0x4315, 0x02);
        bus.write8(0x00, 0x4316, 0x00);
        bus.write8(0x00, 0x420B, 0x02);

        assert_eq!(bus.read8(0x00, 0x2102), 0xAA);
        assert_eq!(bus.read8(0x00, 0x2103), 0xBB);
    }

    #[test]
    fn dma_byte_count_zero_means_65536() {
        let mut bus = Bus::new();
        // Fixed A-bus address, single-register pattern.
        bus.write8(0x00, 0x4300, 0x08);
        bus.write8(0x00, 0x4301, 0x00);
        bus.write8(0x00, 0x4302, 0x00);
        bus.write8(0x00, 0x4303, 0x00);
        bus.write8(0x00, 0x4304, 0x7E);
        bus.write8(0x00, 0x4305, 0x00);
        bus.write8(0x00, 0x4306, 0x00);
        bus.write8(0x00, 0x420B, 0x01);

        assert_eq!(bus.dma.channels[0].byte_count, 0);
        assert_eq!(
            bus.take_pending_stall_master_cycles(),
            65536 * DMA_MASTER_CYCLES_PER_BYTE + DMA_MASTER_CYCLES_PER_CHANNEL
        );
    }

    #[test]
    fn dma_b_to_a_reads_register_into_memory() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x2100, 0x66); // register file holds 0x66
        bus.write8(0x00, 0x4300, 0x80); // direction B->A
        bus.write8(0x00, 0x4301, 0x00);
        bus.write8(0x00, 0x4302, 0x00);
        bus.write8(0x00, 0x4303, 0x03);
        bus.write8(0x00, 0x4304, 0x7E);
        bus.write8(0x00, 0x4305, 0x02);
        bus.write8(0x00, 0x4306, 0x00);
        bus.write8(0x00, 0x420B, 0x01);

        assert_eq!(bus.read8(0x7E, 0x0300), 0x66);
        assert_eq!(bus.read8(0x7E, 0x0301), 0x66);
    }

    fn setup_hdma_channel(bus: &mut Bus, table: &[u8]) {
        for (i, &b) in table.iter().enumerate() {
            bus.write8(0x7E, 0x0400 + i as u16, b);
        }
        bus.write8(0x00, 0x4300, 0x00); // unit 0
        bus.write8(0x00, 0x4301, 0x00); // -> $2100
        bus.write8(0x00, 0x4302, 0x00);
        bus.write8(0x00, 0x4303, 0x04); // table at $7E:0400
        bus.write8(0x00, 0x4304, 0x7E);
        bus.write8(0x00, 0x420C, 0x01);
        bus.dma.hdma_init(0x01);
    }

    #[test]
    fn hdma_zero_descriptor_terminates_for_frame() {
        let mut bus = Bus::new();
        setup_hdma_channel(&mut bus, &[0x00]);
        bus.run_hdma_line();
        assert!(bus.dma.channels[0].terminated);

        // Further lines transfer nothing.
        let before = bus.read8(0x00, 0x2100);
        bus.run_hdma_line();
        assert_eq!(bus.read8(0x00, 0x2100), before);

        // Reseeding re-arms the channel.
        bus.dma.hdma_init(0x01);
        assert!(!bus.dma.channels[0].terminated);
    }

    #[test]
    fn hdma_direct_entry_transfers_on_load_line() {
        let mut bus = Bus::new();
        // Entry: 2 lines, data bytes follow inline.
        setup_hdma_channel(&mut bus, &[0x02, 0x5A, 0x5B, 0x5C, 0x00]);

        bus.run_hdma_line(); // load line: descriptor + first batch
        assert_eq!(bus.read8(0x00, 0x2100), 0x5A);
        assert_eq!(bus.dma.channels[0].line_counter, 2);

        bus.run_hdma_line();
        assert_eq!(bus.read8(0x00, 0x2100), 0x5B);
        assert_eq!(bus.dma.channels[0].line_counter, 1);

        bus.run_hdma_line();
        assert_eq!(bus.read8(0x00, 0x2100), 0x5C);

        // Counter exhausted: next line reads the terminator.
        bus.run_hdma_line();
        assert!(bus.dma.channels[0].terminated);
    }

    #[test]
    fn hdma_count_only_descriptor_skips_load_line_transfer() {
        let mut bus = Bus::new();
        setup_hdma_channel(&mut bus, &[0x82, 0x77, 0x78, 0x00]);
        let before = bus.read8(0x00, 0x2100);

        bus.run_hdma_line(); // descriptor only, no transfer
        assert_eq!(bus.read8(0x00, 0x2100), before);
        assert_eq!(bus.dma.channels[0].line_counter, 2);

        bus.run_hdma_line();
        assert_eq!(bus.read8(0x00, 0x2100), 0x77);
    }

    #[test]
    fn hdma_idle_channel_is_skipped() {
        let mut bus = Bus::new();
        bus.write8(0x7E, 0x0000, 0x05); // would be a descriptor if read
        bus.write8(0x00, 0x4300, 0x00);
        bus.write8(0x00, 0x4301, 0x00);
        // Table pointer/bank left at zero; counter zero: channel idle.
        bus.dma.channels[0].table_addr = 0;
        bus.dma.channels[0].table_bank = 0;
        bus.dma.channels[0].line_counter = 0;
        bus.dma.hdma_enable = 0x01;
        bus.run_hdma_line();
        assert_eq!(bus.dma.channels[0].line_counter, 0);
        assert!(!bus.dma.channels[0].terminated);
    }

    #[test]
    fn vblank_edge_raises_nmi_and_latches_joypads() {
        let mut bus = Bus::new();
        bus.input.controller1.set_buttons(crate::input::button::START);
        bus.write8(0x00, 0x4200, 0x81); // NMI + auto-joypad

        step_dots(&mut bus, DOTS_PER_LINE as u32 * VBLANK_START_LINE as u32);

        assert!(bus.interrupts.nmi_line());
        let hvbjoy = bus.read8(0x00, 0x4212);
        assert_eq!(hvbjoy & 0x81, 0x81); // vblank + joypad busy
        assert_eq!(bus.read8(0x00, 0x4219), 0x10); // Start in the high byte
    }

    #[test]
    fn hdma_reseeds_at_frame_boundary() {
        let mut bus = Bus::new();
        bus.write8(0x7E, 0x0400, 0x00); // immediate terminator
        bus.write8(0x00, 0x4300, 0x00);
        bus.write8(0x00, 0x4301, 0x00);
        bus.write8(0x00, 0x4302, 0x00);
        bus.write8(0x00, 0x4303, 0x04);
        bus.write8(0x00, 0x4304, 0x7E);
        bus.write8(0x00, 0x420C, 0x01);
        bus.dma.hdma_init(0x01);
        bus.run_hdma_line();
        assert!(bus.dma.channels[0].terminated);

        // Rewrite the table, then run a whole frame: the wrap reseeds the
        // pointer and the new first entry transfers on line 0.
        bus.write8(0x7E, 0x0400, 0x01);
        bus.write8(0x7E, 0x0401, 0xCC);
        bus.write8(0x7E, 0x0402, 0x00);
        step_dots(
            &mut bus,
            DOTS_PER_LINE as u32 * SCANLINES_PER_FRAME as u32,
        );
        assert_eq!(bus.read8(0x00, 0x2100), 0xCC);
    }

    #[test]
    fn hv_compare_fires_through_step_dot() {
        let mut bus = Bus::new();
        bus.write8(0x00, 0x4209, 0x02); // V = 2
        bus.write8(0x00, 0x420A, 0x00);
        bus.write8(0x00, 0x4200, 0x20); // V-IRQ enable

        step_dots(&mut bus, DOTS_PER_LINE as u32 * 2);
        assert!(bus.interrupts.irq_line());
        let timeup = bus.read8(0x00, 0x4211);
        assert_eq!(timeup & 0x80, 0x80);
        assert!(!bus.interrupts.irq_line());
    }
}

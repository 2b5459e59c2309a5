//! Top-level session object: owns every component, wires them together, and
//! turns "advance by N master cycles" into deterministically interleaved
//! progress across the clock domains.
//!
//! Ordering within one slice is fixed: pending DMA stall is drained first,
//! then the CPU runs its quota, then video timing advances dot by dot for
//! the full slice, then the sound domain gets the same slice.

use crate::bus::Bus;
use crate::cartridge::{Cartridge, CartridgeError};
use crate::clock::{CycleDivider, MasterClock, MASTER_CLOCK_NTSC, MASTER_PER_CPU_CYCLE};
use crate::cpu::Cpu;
use crate::ppu::{DOTS_PER_LINE, SCANLINES_PER_FRAME};

/// Master cycles in one scanline (dot clock is master/4).
pub const MASTER_CYCLES_PER_SCANLINE: u64 = DOTS_PER_LINE as u64 * 4;

/// Master cycles in one full video frame.
pub const MASTER_CYCLES_PER_FRAME: u64 =
    MASTER_CYCLES_PER_SCANLINE * SCANLINES_PER_FRAME as u64;

/// Interchangeable "advance the CPU by this many cycles" strategy. The
/// interpreter is the only shipped implementation; a dynamic-codegen backend
/// would slot in here. `flush` must leave no partially executed block state
/// behind, so backends can be swapped at any step boundary.
pub trait ExecutionBackend {
    fn name(&self) -> &'static str;

    /// Run up to `cpu_cycles` CPU cycles; returns the cycles actually
    /// consumed. Stops early when the bus reports a DMA stall or the CPU
    /// halts.
    fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, cpu_cycles: u32) -> u32;

    fn flush(&mut self, _cpu: &mut Cpu) {}
}

pub struct Interpreter;

impl ExecutionBackend for Interpreter {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn run(&mut self, cpu: &mut Cpu, bus: &mut Bus, cpu_cycles: u32) -> u32 {
        let mut used = 0u32;
        while used < cpu_cycles {
            if cpu.is_stopped() {
                break;
            }
            used += cpu.step(bus) as u32;
            bus.set_cpu_waiting(cpu.is_waiting());
            // A DMA kicked off by the last instruction halts the CPU; hand
            // control back so the driver can account the stall.
            if bus.has_pending_stall() {
                break;
            }
        }
        used
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub bus: Bus,
    clock: MasterClock,
    // DMAストール（マスターサイクル）をCPUサイクルへ換算する分周器
    stall_divider: CycleDivider,
    stall_cpu_cycles: u64,
    // Signed so sub-instruction overshoot carries into the next slice and
    // the long-run cycle ratio stays exact.
    cpu_budget: i64,
    backend: Box<dyn ExecutionBackend>,
    rom_path: Option<String>,
}

impl Emulator {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            clock: MasterClock::new(),
            stall_divider: CycleDivider::new(MASTER_PER_CPU_CYCLE),
            stall_cpu_cycles: 0,
            cpu_budget: 0,
            backend: Box::new(Interpreter),
            rom_path: None,
        }
    }

    pub fn load_rom_bytes(&mut self, data: Vec<u8>) -> Result<(), CartridgeError> {
        let cartridge = Cartridge::load_from_bytes(data)?;
        log::info!(
            "loaded \"{}\" ({:?}, {} KiB ROM, {} KiB RAM)",
            cartridge.header.title,
            cartridge.header.mapper_kind,
            cartridge.rom.len() / 1024,
            cartridge.header.ram_size / 1024
        );
        self.bus.insert_cartridge(cartridge);
        self.reset();
        Ok(())
    }

    pub fn load_rom_file(&mut self, path: &str) -> Result<(), CartridgeError> {
        let cartridge = Cartridge::load_from_file(path)?;
        self.rom_path = Some(path.to_string());
        self.bus.insert_cartridge(cartridge);
        // Battery-backed RAM from a previous session, if any.
        if let Ok(Some(saved)) = crate::sram::load_sram(path) {
            if let Some(cart) = self.bus.cartridge_mut() {
                let n = saved.len().min(cart.sram.len());
                cart.sram[..n].copy_from_slice(&saved[..n]);
            }
        }
        self.reset();
        Ok(())
    }

    pub fn save_sram(&self) -> std::io::Result<()> {
        if let (Some(path), Some(cart)) = (&self.rom_path, self.bus.cartridge()) {
            if !cart.sram.is_empty() {
                return crate::sram::save_sram(path, &cart.sram);
            }
        }
        Ok(())
    }

    /// Hard reset: every component reinitializes synchronously.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus);
        self.bus.set_cpu_waiting(false);
        self.clock.reset();
        self.stall_divider.reset();
        self.stall_cpu_cycles = 0;
        self.cpu_budget = 0;
        self.backend.flush(&mut self.cpu);
    }

    /// Swap the CPU execution backend at a step boundary. The outgoing
    /// backend is flushed first so no in-flight state leaks across.
    pub fn set_backend(&mut self, backend: Box<dyn ExecutionBackend>) {
        self.backend.flush(&mut self.cpu);
        log::debug!(
            "execution backend: {} -> {}",
            self.backend.name(),
            backend.name()
        );
        self.backend = backend;
    }

    /// Advance the whole machine by `master_cycles` master cycles.
    pub fn step_master_cycles(&mut self, master_cycles: u64) {
        self.clock.advance(master_cycles);

        // CPU quota for this slice, remainder carried by the divider.
        self.cpu_budget += self.clock.cpu_cycles(master_cycles) as i64;

        loop {
            // DMA stall is resolved before CPU progress for the same slice.
            let stall = self.bus.take_pending_stall_master_cycles();
            if stall > 0 {
                self.stall_cpu_cycles += self.stall_divider.convert(stall);
            }
            if self.stall_cpu_cycles > 0 && self.cpu_budget > 0 {
                let consumed = self.stall_cpu_cycles.min(self.cpu_budget as u64);
                self.stall_cpu_cycles -= consumed;
                self.cpu_budget -= consumed as i64;
                continue;
            }
            if self.cpu_budget <= 0 {
                break;
            }
            if self.cpu.is_stopped() {
                // A stopped CPU forfeits its quota; time still passes for
                // the other domains.
                self.cpu_budget = 0;
                break;
            }
            let used = self
                .backend
                .run(&mut self.cpu, &mut self.bus, self.cpu_budget as u32);
            if used == 0 {
                self.cpu_budget = 0;
                break;
            }
            self.cpu_budget -= used as i64;
        }

        // Video timing advances dot by dot for the full slice.
        let dots = self.clock.dot_cycles(master_cycles);
        for _ in 0..dots {
            self.bus.step_dot();
        }

        // The sound domain gets the same slice.
        self.bus.step_apu(master_cycles);
    }

    /// Advance by wall-clock seconds of emulated time.
    pub fn step_seconds(&mut self, seconds: f64) {
        let total = (seconds * MASTER_CLOCK_NTSC as f64) as u64;
        let mut remaining = total;
        // Scanline-sized slices bound the cross-domain event latency: the
        // CPU sees an edge no more than one line after the dot that made it.
        while remaining > 0 {
            let slice = remaining.min(MASTER_CYCLES_PER_SCANLINE);
            self.step_master_cycles(slice);
            remaining -= slice;
        }
    }

    /// Run exactly one video frame worth of master cycles.
    pub fn run_frame(&mut self) {
        for _ in 0..SCANLINES_PER_FRAME {
            self.step_master_cycles(MASTER_CYCLES_PER_SCANLINE);
        }
    }

    pub fn total_master_cycles(&self) -> u64 {
        self.clock.total_master_cycles()
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

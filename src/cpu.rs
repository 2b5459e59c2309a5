#![cfg_attr(not(feature = "dev"), allow(dead_code))]
//! S-CPU register file and interrupt-aware fetch loop.
//!
//! The instruction set itself lives in `cpu_core`; this wrapper owns the
//! power-up/reset sequence and the per-step interrupt arbitration (NMI is
//! edge latched, IRQ is level sensitive, WAI parks the fetch loop).
use crate::cpu_bus::CpuBus;
use crate::cpu_core::{self, Core};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const CARRY = 0x01;
        const ZERO = 0x02;
        const IRQ_DISABLE = 0x04;
        const DECIMAL = 0x08;
        const INDEX_8BIT = 0x10;
        const MEMORY_8BIT = 0x20;
        const OVERFLOW = 0x40;
        const NEGATIVE = 0x80;
    }
}

impl StatusFlags {
    /// Power-up pattern: interrupts masked, both width flags set.
    pub fn power_on() -> Self {
        StatusFlags::IRQ_DISABLE | StatusFlags::MEMORY_8BIT | StatusFlags::INDEX_8BIT
    }
}

pub struct Cpu {
    pub core: Core,
    // NMIはエッジラッチ: ライン立ち上がりで1回だけサービスし、
    // ラインが下がるまで再アームしない。
    nmi_latched: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            core: Core::new(StatusFlags::power_on(), true),
            nmi_latched: false,
        }
    }

    /// Hard reset: power-up register pattern, PC loaded from the emulation
    /// reset vector at $00FFFC.
    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        self.core.reset(StatusFlags::power_on(), true);
        let vector = bus.read_u16(0x00FFFC);
        self.core.state_mut().pc = vector;
        self.nmi_latched = false;
    }

    /// One iteration of the fetch loop: service a pending interrupt or run a
    /// single instruction. Returns the CPU cycles consumed.
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        let nmi = bus.poll_nmi();
        if !nmi {
            // Line went low: the edge re-arms.
            self.nmi_latched = false;
        }

        if self.core.state().stopped {
            // STP: only a reset restarts the clock. Time still passes.
            let state = self.core.state_mut();
            state.cycles = state.cycles.wrapping_add(2);
            return 2;
        }

        if nmi && !self.nmi_latched {
            self.nmi_latched = true;
            return cpu_core::service_nmi(self.core.state_mut(), bus);
        }

        let irq = bus.poll_irq();
        if irq && !self.core.state().p.contains(StatusFlags::IRQ_DISABLE) {
            return cpu_core::service_irq(self.core.state_mut(), bus);
        }

        if self.core.state().waiting_for_irq {
            if irq {
                // WAI falls through to the next instruction when the IRQ
                // line rises while masked.
                self.core.state_mut().waiting_for_irq = false;
            } else {
                let state = self.core.state_mut();
                state.cycles = state.cycles.wrapping_add(1);
                return 1;
            }
        }

        self.core.step(bus).cycles
    }

    pub fn is_waiting(&self) -> bool {
        self.core.state().waiting_for_irq
    }

    pub fn is_stopped(&self) -> bool {
        self.core.state().stopped
    }

    /// Current 24-bit program counter (PB:PC).
    pub fn pc24(&self) -> u32 {
        let state = self.core.state();
        ((state.pb as u32) << 16) | state.pc as u32
    }

    pub fn a_is_8bit(&self) -> bool {
        cpu_core::memory_is_8bit(self.core.state())
    }

    pub fn index_is_8bit(&self) -> bool {
        cpu_core::index_is_8bit(self.core.state())
    }

    pub fn total_cycles(&self) -> u64 {
        self.core.state().cycles
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

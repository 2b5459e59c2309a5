//! Interrupt controller: NMI/IRQ enable bits, H/V compare, sticky status
//! registers.
//!
//! Interrupts here are latched edges read back through a status port, not
//! asynchronous signals: reading `$4210`/`$4211` is itself a state change
//! (clear-on-read), and the output lines track the sticky bits until that
//! read happens.

use crate::debug_flags;

/// Low nibble of `$4210` reads back the CPU die version.
const CPU_VERSION: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct InterruptController {
    nmi_enabled: bool,
    h_irq_enabled: bool,
    v_irq_enabled: bool,
    auto_joypad_enabled: bool,
    // H/Vカウンタ比較値 ($4207-$420A、9bit)
    htime: u16,
    vtime: u16,
    // Sticky status bits: set on the qualifying transition, cleared only by
    // reading the corresponding status register.
    nmi_flag: bool,
    irq_flag: bool,
    nmi_line: bool,
    irq_line: bool,
    // Mirror of the vblank state, needed for the NMI-enable catch-up rule.
    in_vblank: bool,
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            nmi_enabled: false,
            h_irq_enabled: false,
            v_irq_enabled: false,
            auto_joypad_enabled: false,
            htime: 0x1FF,
            vtime: 0x1FF,
            nmi_flag: false,
            irq_flag: false,
            nmi_line: false,
            irq_line: false,
            in_vblank: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// `$4200` NMITIMEN. bit7=NMI, bit5=V-IRQ, bit4=H-IRQ, bit0=auto-joypad.
    pub fn set_enable_register(&mut self, value: u8) {
        let was_nmi_enabled = self.nmi_enabled;
        self.nmi_enabled = value & 0x80 != 0;
        self.v_irq_enabled = value & 0x20 != 0;
        self.h_irq_enabled = value & 0x10 != 0;
        self.auto_joypad_enabled = value & 0x01 != 0;

        // Enabling NMI mid-vblank fires it immediately; real hardware
        // catches up on the same scanline instead of waiting a frame.
        if !was_nmi_enabled && self.nmi_enabled && self.in_vblank {
            self.nmi_flag = true;
            self.nmi_line = true;
        }
        if !self.nmi_enabled {
            self.nmi_line = false;
        }
        // Disabling both timer IRQ sources acknowledges any pending IRQ.
        if !self.h_irq_enabled && !self.v_irq_enabled {
            self.irq_flag = false;
            self.irq_line = false;
        }
    }

    pub fn set_htime_low(&mut self, value: u8) {
        self.htime = (self.htime & 0x100) | value as u16;
    }

    pub fn set_htime_high(&mut self, value: u8) {
        self.htime = (self.htime & 0x0FF) | (((value & 1) as u16) << 8);
    }

    pub fn set_vtime_low(&mut self, value: u8) {
        self.vtime = (self.vtime & 0x100) | value as u16;
    }

    pub fn set_vtime_high(&mut self, value: u8) {
        self.vtime = (self.vtime & 0x0FF) | (((value & 1) as u16) << 8);
    }

    pub fn on_enter_vblank(&mut self) {
        self.in_vblank = true;
        if self.nmi_enabled {
            self.nmi_flag = true;
            self.nmi_line = true;
        }
    }

    pub fn on_leave_vblank(&mut self) {
        self.in_vblank = false;
        self.nmi_flag = false;
        self.nmi_line = false;
    }

    /// Evaluate the H/V compare for the current dot position.
    ///
    /// Tie-break rule: both sources enabled means exact dot AND scanline;
    /// V-only matches its scanline at dot 0; H-only matches its dot on every
    /// scanline. A line already high is not re-asserted.
    pub fn poll_hv_match(&mut self, dot: u16, scanline: u16) {
        let matched = match (self.h_irq_enabled, self.v_irq_enabled) {
            (true, true) => dot == self.htime && scanline == self.vtime,
            (false, true) => dot == 0 && scanline == self.vtime,
            (true, false) => dot == self.htime,
            (false, false) => false,
        };
        if matched && !self.irq_line {
            if debug_flags::irq() {
                log::debug!(
                    "H/V IRQ match at dot={} scanline={} (H={:#05x} V={:#05x})",
                    dot,
                    scanline,
                    self.htime,
                    self.vtime
                );
            }
            self.irq_flag = true;
            self.irq_line = true;
        }
    }

    /// `$4210` RDNMI: sticky NMI-occurred bit in bit7 plus the die version.
    /// Reading clears the flag and deasserts the NMI line.
    pub fn read_status_nmi(&mut self) -> u8 {
        let value = if self.nmi_flag { 0x80 } else { 0x00 } | CPU_VERSION;
        self.nmi_flag = false;
        self.nmi_line = false;
        value
    }

    /// `$4211` TIMEUP: sticky IRQ-occurred bit in bit7; the low bits float
    /// (open bus). Reading clears the flag and deasserts the IRQ line.
    pub fn read_status_irq(&mut self, open_bus: u8) -> u8 {
        let value = if self.irq_flag { 0x80 } else { 0x00 } | (open_bus & 0x7F);
        self.irq_flag = false;
        self.irq_line = false;
        value
    }

    pub fn nmi_line(&self) -> bool {
        self.nmi_line
    }

    pub fn irq_line(&self) -> bool {
        self.irq_line
    }

    pub fn auto_joypad_enabled(&self) -> bool {
        self.auto_joypad_enabled
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_latches_once_per_vblank_entry() {
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x80);
        ic.on_enter_vblank();
        assert!(ic.nmi_line());
        // Repolling the compare path or re-reading state must not stack
        // further assertions; the line stays high until the status read.
        assert_eq!(ic.read_status_nmi() & 0x80, 0x80);
        assert!(!ic.nmi_line());
        assert_eq!(ic.read_status_nmi() & 0x80, 0x00);
    }

    #[test]
    fn nmi_gated_by_enable_bit() {
        let mut ic = InterruptController::new();
        ic.on_enter_vblank();
        assert!(!ic.nmi_line());
        assert_eq!(ic.read_status_nmi() & 0x80, 0);
    }

    #[test]
    fn enabling_nmi_inside_vblank_catches_up() {
        let mut ic = InterruptController::new();
        ic.on_enter_vblank();
        ic.set_enable_register(0x80);
        assert!(ic.nmi_line());
    }

    #[test]
    fn status_read_clears_top_bit_and_line() {
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x20);
        ic.set_vtime_low(10);
        ic.poll_hv_match(0, 10);
        assert!(ic.irq_line());

        let first = ic.read_status_irq(0x21);
        assert_eq!(first, 0x80 | 0x21);
        assert!(!ic.irq_line());
        // Second read: same low bits, top bit clear.
        let second = ic.read_status_irq(first);
        assert_eq!(second, first & 0x7F);
    }

    #[test]
    fn hv_tie_break_rules() {
        // Both enabled: exact dot and scanline required.
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x30);
        ic.set_htime_low(0x40);
        ic.set_vtime_low(0x10);
        ic.poll_hv_match(0x40, 0x11);
        assert!(!ic.irq_line());
        ic.poll_hv_match(0x40, 0x10);
        assert!(ic.irq_line());

        // V only: scanline match at dot 0.
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x20);
        ic.set_vtime_low(0x10);
        ic.poll_hv_match(5, 0x10);
        assert!(!ic.irq_line());
        ic.poll_hv_match(0, 0x10);
        assert!(ic.irq_line());

        // H only: dot match on every scanline.
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x10);
        ic.set_htime_low(0x80);
        ic.poll_hv_match(0x80, 3);
        assert!(ic.irq_line());
        let _ = ic.read_status_irq(0);
        ic.poll_hv_match(0x80, 4);
        assert!(ic.irq_line());
    }

    #[test]
    fn line_not_reasserted_while_high() {
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x10);
        ic.set_htime_low(0x20);
        ic.poll_hv_match(0x20, 1);
        ic.poll_hv_match(0x20, 2);
        assert!(ic.irq_line());
        let _ = ic.read_status_irq(0);
        assert!(!ic.irq_line());
    }

    #[test]
    fn disabling_both_irq_sources_acknowledges() {
        let mut ic = InterruptController::new();
        ic.set_enable_register(0x10);
        ic.set_htime_low(0x20);
        ic.poll_hv_match(0x20, 1);
        assert!(ic.irq_line());
        ic.set_enable_register(0x00);
        assert!(!ic.irq_line());
        assert_eq!(ic.read_status_irq(0) & 0x80, 0);
    }
}

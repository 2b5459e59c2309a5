//! Audio co-processor boundary: the `$2140-$2143` handshake port pair.
//!
//! The S-CPU and the sound unit live in different clock domains, so a
//! CPU-side port write is not visible to the co-processor until the next
//! internal step boundary applies it (two-stage buffer: pending write +
//! applied value). Co-processor writes are visible to the CPU immediately.
//! The co-processor itself is opaque; the shipped implementation is a boot
//! handshake HLE good enough to walk ROM upload loops.
use crate::debug_flags;
use std::collections::VecDeque;

/// Number of ports in each direction.
pub const NUM_PORTS: usize = 4;

/// How many port transitions the diagnostic ring keeps.
const TRACE_RING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    Cpu,
    Coprocessor,
}

#[derive(Debug, Clone, Copy)]
pub struct PortEvent {
    pub side: PortSide,
    pub port: u8,
    pub value: u8,
}

pub struct ApuPorts {
    // CPU->APU: 適用済みの値。コプロセッサ側が読む。
    cpu_to_apu: [u8; NUM_PORTS],
    // CPU->APU: 未適用の書き込みバッファとそのビットマスク。
    pending: [u8; NUM_PORTS],
    pending_mask: u8,
    // APU->CPU: 即時可視。
    apu_to_cpu: [u8; NUM_PORTS],
    // Recent transitions, diagnostics only.
    trace: VecDeque<PortEvent>,
}

impl ApuPorts {
    pub fn new() -> Self {
        Self {
            cpu_to_apu: [0; NUM_PORTS],
            pending: [0; NUM_PORTS],
            pending_mask: 0,
            apu_to_cpu: [0; NUM_PORTS],
            trace: VecDeque::with_capacity(TRACE_RING_CAPACITY),
        }
    }

    pub fn reset(&mut self) {
        self.cpu_to_apu = [0; NUM_PORTS];
        self.pending = [0; NUM_PORTS];
        self.pending_mask = 0;
        self.apu_to_cpu = [0; NUM_PORTS];
        self.trace.clear();
    }

    /// CPU-side write ($2140+port). Lands in the pending buffer; the
    /// co-processor sees it only after the next `apply_pending`.
    pub fn cpu_write(&mut self, port: usize, value: u8) {
        debug_assert!(port < NUM_PORTS);
        self.pending[port & 3] = value;
        self.pending_mask |= 1 << (port & 3);
        self.push_trace(PortSide::Cpu, port as u8, value);
        if debug_flags::apu_port() {
            log::trace!("CPU port{} <= {:02X} (pending)", port & 3, value);
        }
    }

    /// CPU-side read ($2140+port): the co-processor's output latch.
    pub fn cpu_read(&self, port: usize) -> u8 {
        self.apu_to_cpu[port & 3]
    }

    /// Commit pending CPU writes at a step boundary. Returns the mask of
    /// ports that changed.
    pub fn apply_pending(&mut self) -> u8 {
        let mask = self.pending_mask;
        for port in 0..NUM_PORTS {
            if mask & (1 << port) != 0 {
                self.cpu_to_apu[port] = self.pending[port];
            }
        }
        self.pending_mask = 0;
        mask
    }

    /// Co-processor side write: visible to the CPU immediately.
    pub fn apu_write(&mut self, port: usize, value: u8) {
        debug_assert!(port < NUM_PORTS);
        self.apu_to_cpu[port & 3] = value;
        self.push_trace(PortSide::Coprocessor, port as u8, value);
    }

    /// Co-processor side read of the applied CPU value.
    pub fn apu_read(&self, port: usize) -> u8 {
        self.cpu_to_apu[port & 3]
    }

    pub fn recent_transitions(&self) -> impl Iterator<Item = &PortEvent> {
        self.trace.iter()
    }

    fn push_trace(&mut self, side: PortSide, port: u8, value: u8) {
        if self.trace.len() == TRACE_RING_CAPACITY {
            self.trace.pop_front();
        }
        self.trace.push_back(PortEvent { side, port, value });
    }
}

impl Default for ApuPorts {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque sound domain. Advanced once per outer slice with the same
/// master-cycle budget as everything else; converts to its own clock
/// internally.
pub trait AudioCoprocessor {
    fn reset(&mut self, ports: &mut ApuPorts);
    fn step(&mut self, master_cycles: u64, ports: &mut ApuPorts);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootState {
    /// 初期シグネチャ (AA/BB) をCPUに見せる段階
    ReadySignature,
    /// CPUからのキック(0xCC)後、ブロック転送中
    Uploading,
    /// 転送完了後。以降はポートをエコーバックする
    Running,
}

/// High-level emulation of the boot ROM handshake: show the AA/BB ready
/// signature, accept the $CC kick and the indexed upload protocol, then echo
/// port writes once running. No instruction engine, no DSP.
pub struct HleApu {
    boot_state: BootState,
    expected_index: u8,
    upload_bytes: u64,
    last_port0: u8,
}

impl HleApu {
    pub fn new() -> Self {
        Self {
            boot_state: BootState::ReadySignature,
            expected_index: 0,
            upload_bytes: 0,
            last_port0: 0,
        }
    }
}

impl Default for HleApu {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCoprocessor for HleApu {
    fn reset(&mut self, ports: &mut ApuPorts) {
        self.boot_state = BootState::ReadySignature;
        self.expected_index = 0;
        self.upload_bytes = 0;
        self.last_port0 = 0;
        ports.apu_write(0, 0xAA);
        ports.apu_write(1, 0xBB);
        ports.apu_write(2, 0x00);
        ports.apu_write(3, 0x00);
    }

    fn step(&mut self, _master_cycles: u64, ports: &mut ApuPorts) {
        let p0 = ports.apu_read(0);
        let p1 = ports.apu_read(1);

        match self.boot_state {
            BootState::ReadySignature => {
                // Kick: $CC on port0 with a non-zero command on port1.
                if p0 == 0xCC && p1 != 0 {
                    self.boot_state = BootState::Uploading;
                    self.expected_index = 0;
                    ports.apu_write(0, 0xCC);
                    if debug_flags::apu_port() {
                        log::debug!("APU boot kick received");
                    }
                }
            }
            BootState::Uploading => {
                if p0 == self.expected_index {
                    // One data byte per index; echo the index back.
                    self.upload_bytes += 1;
                    ports.apu_write(0, p0);
                    self.expected_index = self.expected_index.wrapping_add(1);
                } else if p0 > self.expected_index || p0 < self.last_port0 {
                    // Block boundary: command 0 on port1 starts execution,
                    // anything else opens the next block.
                    if p1 == 0 {
                        self.boot_state = BootState::Running;
                        if debug_flags::apu_port() {
                            log::debug!("APU upload done ({} bytes), running", self.upload_bytes);
                        }
                    }
                    self.expected_index = 0;
                    ports.apu_write(0, p0);
                }
            }
            BootState::Running => {
                // Loopback keeps simple CPU-side handshakes converging.
                for port in 0..NUM_PORTS {
                    ports.apu_write(port, ports.apu_read(port));
                }
            }
        }
        self.last_port0 = p0;
    }
}

use std::collections::VecDeque;
use std::time::Instant;

use crate::sim::DxlBusSim;

/// Factory default rate for X-series servos.
pub const DEFAULT_BAUDRATE: u32 = 57_600;

/// Byte-level channel the packet handler drives. Implementations exist
/// for real serial ports, a pty pair and the in-memory bus simulator.
pub trait PortHandler {
    fn clear_port(&mut self);
    fn read_port(&mut self, length: usize) -> Vec<u8>;
    fn write_port(&mut self, packet: &[u8]) -> usize;
    fn set_packet_timeout(&mut self, packet_length: usize);
    fn set_packet_timeout_millis(&mut self, msec: u64);
    fn is_packet_timeout(&mut self) -> bool;
    fn set_baud_rate(&mut self, baudrate: u32) -> bool;
    fn get_baud_rate(&self) -> u32;
    fn get_bytes_available(&self) -> usize;
    fn is_open(&self) -> bool;
    fn close_port(&mut self);
}

/// Port wired straight into a [`DxlBusSim`]. Every write is handed to the
/// simulator and any status response is queued for the next read.
#[derive(Debug)]
pub struct SimPort {
    sim: DxlBusSim,
    rx_buffer: VecDeque<u8>,
    baudrate: u32,
    tx_time_per_byte_ms: f64,
    packet_start_time: Instant,
    packet_timeout_ms: f64,
    open: bool,
    releases: u32,
}

impl SimPort {
    pub fn new(sim: DxlBusSim) -> Self {
        let mut port = Self {
            sim,
            rx_buffer: VecDeque::new(),
            baudrate: DEFAULT_BAUDRATE,
            tx_time_per_byte_ms: 0.0,
            packet_start_time: Instant::now(),
            packet_timeout_ms: 0.0,
            open: true,
            releases: 0,
        };
        port.update_tx_time_per_byte();
        port
    }

    pub fn sim_mut(&mut self) -> &mut DxlBusSim {
        &mut self.sim
    }

    /// How many times the channel has actually been released.
    pub fn release_count(&self) -> u32 {
        self.releases
    }

    fn update_tx_time_per_byte(&mut self) {
        // 10 bits per byte on the wire
        self.tx_time_per_byte_ms = (1000.0 / self.baudrate as f64) * 10.0;
    }

    fn elapsed_ms(&self) -> f64 {
        self.packet_start_time.elapsed().as_secs_f64() * 1000.0
    }
}

impl PortHandler for SimPort {
    fn clear_port(&mut self) {
        self.rx_buffer.clear();
    }

    fn read_port(&mut self, length: usize) -> Vec<u8> {
        if !self.open {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(length.min(self.rx_buffer.len()));
        while out.len() < length {
            match self.rx_buffer.pop_front() {
                Some(byte) => out.push(byte),
                None => break,
            }
        }
        out
    }

    fn write_port(&mut self, packet: &[u8]) -> usize {
        if !self.open {
            return 0;
        }
        if let Ok(Some(response)) = self.sim.handle_frame(packet) {
            self.rx_buffer.extend(response);
        }
        packet.len()
    }

    fn set_packet_timeout(&mut self, packet_length: usize) {
        self.packet_start_time = Instant::now();
        self.packet_timeout_ms = self.tx_time_per_byte_ms * packet_length as f64
            + self.tx_time_per_byte_ms * 3.0
            + 50.0;
    }

    fn set_packet_timeout_millis(&mut self, msec: u64) {
        self.packet_start_time = Instant::now();
        self.packet_timeout_ms = msec as f64;
    }

    fn is_packet_timeout(&mut self) -> bool {
        if self.packet_timeout_ms <= 0.0 {
            return false;
        }
        if self.elapsed_ms() > self.packet_timeout_ms {
            self.packet_timeout_ms = 0.0;
            return true;
        }
        false
    }

    fn set_baud_rate(&mut self, baudrate: u32) -> bool {
        self.baudrate = baudrate;
        self.update_tx_time_per_byte();
        true
    }

    fn get_baud_rate(&self) -> u32 {
        self.baudrate
    }

    fn get_bytes_available(&self) -> usize {
        self.rx_buffer.len()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close_port(&mut self) {
        if self.open {
            self.open = false;
            self.releases += 1;
        }
    }
}

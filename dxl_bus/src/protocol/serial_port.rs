use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::protocol::port_handler::PortHandler;

/// Real serial bus adapter (USB2Dynamixel, U2D2 and similar).
pub struct SerialPortHandler {
    port: Option<Box<dyn SerialPort>>,
    baudrate: u32,
    tx_time_per_byte_ms: f64,
    packet_start_time: Instant,
    packet_timeout_ms: f64,
}

impl SerialPortHandler {
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(2))
            .open()?;

        let mut handler = Self {
            port: Some(port),
            baudrate,
            tx_time_per_byte_ms: 0.0,
            packet_start_time: Instant::now(),
            packet_timeout_ms: 0.0,
        };
        handler.update_tx_time_per_byte();
        Ok(handler)
    }

    fn update_tx_time_per_byte(&mut self) {
        // 10 bits per byte on the wire
        self.tx_time_per_byte_ms = (1000.0 / self.baudrate as f64) * 10.0;
    }

    fn elapsed_ms(&self) -> f64 {
        self.packet_start_time.elapsed().as_secs_f64() * 1000.0
    }
}

impl PortHandler for SerialPortHandler {
    fn clear_port(&mut self) {
        if let Some(port) = self.port.as_mut() {
            let _ = port.clear(serialport::ClearBuffer::Input);
        }
    }

    fn read_port(&mut self, length: usize) -> Vec<u8> {
        let Some(port) = self.port.as_mut() else {
            return Vec::new();
        };
        if length == 0 {
            return Vec::new();
        }

        let mut out = vec![0u8; length];
        match port.read(&mut out) {
            Ok(read_len) => {
                out.truncate(read_len);
                out
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    fn write_port(&mut self, packet: &[u8]) -> usize {
        let Some(port) = self.port.as_mut() else {
            return 0;
        };
        match port.write_all(packet) {
            Ok(()) => {
                let _ = port.flush();
                packet.len()
            }
            Err(_) => 0,
        }
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
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        if port.set_baud_rate(baudrate).is_err() {
            return false;
        }
        self.baudrate = baudrate;
        self.update_tx_time_per_byte();
        true
    }

    fn get_baud_rate(&self) -> u32 {
        self.baudrate
    }

    fn get_bytes_available(&self) -> usize {
        self.port
            .as_ref()
            .and_then(|port| port.bytes_to_read().ok())
            .unwrap_or(0) as usize
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close_port(&mut self) {
        // dropping the handle releases the device
        self.port = None;
    }
}

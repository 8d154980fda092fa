use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::protocol::port_handler::{PortHandler, DEFAULT_BAUDRATE};

/// Master side of a pty pair. The slave path can be handed to any client
/// that expects a serial device, which lets the bus simulator stand in
/// for real hardware.
#[derive(Debug)]
pub struct VirtualUartPort {
    master_fd: RawFd,
    slave_path: String,
    baudrate: u32,
    tx_time_per_byte_ms: f64,
    packet_start_time: Instant,
    packet_timeout_ms: f64,
}

impl VirtualUartPort {
    pub fn new() -> io::Result<Self> {
        let master_fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
        if master_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::grantpt(master_fd) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(master_fd) };
            return Err(err);
        }
        if unsafe { libc::unlockpt(master_fd) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(master_fd) };
            return Err(err);
        }

        let slave_ptr = unsafe { libc::ptsname(master_fd) };
        if slave_ptr.is_null() {
            let err = io::Error::last_os_error();
            unsafe { libc::close(master_fd) };
            return Err(err);
        }
        let slave_path = unsafe { CStr::from_ptr(slave_ptr) }
            .to_string_lossy()
            .into_owned();

        let flags = unsafe { libc::fcntl(master_fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(master_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(master_fd) };
            return Err(err);
        }

        let mut port = Self {
            master_fd,
            slave_path,
            baudrate: DEFAULT_BAUDRATE,
            tx_time_per_byte_ms: 0.0,
            packet_start_time: Instant::now(),
            packet_timeout_ms: 0.0,
        };
        port.update_tx_time_per_byte();
        Ok(port)
    }

    /// Device path clients should open, e.g. `/dev/pts/3`.
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    fn update_tx_time_per_byte(&mut self) {
        self.tx_time_per_byte_ms = (1000.0 / self.baudrate as f64) * 10.0;
    }

    fn elapsed_ms(&self) -> f64 {
        self.packet_start_time.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for VirtualUartPort {
    fn drop(&mut self) {
        self.close_port();
    }
}

impl PortHandler for VirtualUartPort {
    fn clear_port(&mut self) {
        // drain whatever is pending on the master side
        while !self.read_port(256).is_empty() {}
    }

    fn read_port(&mut self, length: usize) -> Vec<u8> {
        if self.master_fd < 0 || length == 0 {
            return Vec::new();
        }
        let mut out = vec![0u8; length];
        let read_len =
            unsafe { libc::read(self.master_fd, out.as_mut_ptr() as *mut libc::c_void, length) };
        if read_len <= 0 {
            return Vec::new();
        }
        out.truncate(read_len as usize);
        out
    }

    fn write_port(&mut self, packet: &[u8]) -> usize {
        if self.master_fd < 0 {
            return 0;
        }
        let written = unsafe {
            libc::write(
                self.master_fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if written < 0 {
            0
        } else {
            written as usize
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
        // a pty has no real line rate; track it for timeout accounting only
        self.baudrate = baudrate;
        self.update_tx_time_per_byte();
        true
    }

    fn get_baud_rate(&self) -> u32 {
        self.baudrate
    }

    fn get_bytes_available(&self) -> usize {
        if self.master_fd < 0 {
            return 0;
        }
        let mut available: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.master_fd, libc::FIONREAD, &mut available) };
        if rc == 0 && available > 0 {
            available as usize
        } else {
            0
        }
    }

    fn is_open(&self) -> bool {
        self.master_fd >= 0
    }

    fn close_port(&mut self) {
        if self.master_fd >= 0 {
            unsafe { libc::close(self.master_fd) };
            self.master_fd = -1;
        }
    }
}

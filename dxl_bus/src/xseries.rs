//! High-level client for X-series servos. Each operation is one register
//! transaction (velocity-mode entry is two); values go out exactly as
//! given, range enforcement is the servo's job.

use crate::control_table::{self, OperatingMode, TORQUE_OFF, TORQUE_ON};
use crate::error::{OpenError, TransferError};
use crate::protocol::packet_handler::PacketHandler;
use crate::protocol::port_handler::{PortHandler, DEFAULT_BAUDRATE};
use crate::protocol::serial_port::SerialPortHandler;
use crate::transport::Transport;

pub struct XSeries<T: Transport> {
    pub transport: T,
}

impl XSeries<PacketHandler<SerialPortHandler>> {
    /// Opens the serial device and configures the requested baud rate.
    ///
    /// Acquisition happens at the protocol default rate first; a device
    /// that cannot be acquired at all and one that refuses the requested
    /// rate are reported as distinct errors.
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self, OpenError> {
        let mut port = SerialPortHandler::open(port_name, DEFAULT_BAUDRATE).map_err(|source| {
            OpenError::PortUnavailable {
                port: port_name.to_string(),
                source,
            }
        })?;
        if !port.set_baud_rate(baudrate) {
            return Err(OpenError::BaudRateRejected {
                port: port_name.to_string(),
                baud: baudrate,
            });
        }
        Ok(Self::new(PacketHandler::new(port)))
    }
}

impl<T: Transport> XSeries<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Releases the underlying channel. Safe to call more than once.
    pub fn close(&mut self) {
        self.transport.close_channel();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Switches the control mode. Entering velocity mode also zeroes the
    /// goal velocity so torque-on cannot chase a stale goal; both writes
    /// are always issued and the mode write's failure wins.
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<(), TransferError> {
        let mode_write = self.transport.write_register(
            id,
            control_table::OPERATING_MODE,
            mode.register_value() as u32,
        );
        if mode == OperatingMode::Velocity {
            let reset = self.transport.write_register(id, control_table::GOAL_VELOCITY, 0);
            return mode_write.and(reset);
        }
        mode_write
    }

    pub fn set_velocity_limit(&mut self, id: u8, limit: u32) -> Result<(), TransferError> {
        self.transport.write_register(id, control_table::VELOCITY_LIMIT, limit)
    }

    /// Writes both position limits, low bound first. The writes are
    /// independent transactions; both are issued and the first failure
    /// is the one reported.
    pub fn set_position_limits(&mut self, id: u8, min: u32, max: u32) -> Result<(), TransferError> {
        let min_write = self
            .transport
            .write_register(id, control_table::MIN_POSITION_LIMIT, min);
        let max_write = self
            .transport
            .write_register(id, control_table::MAX_POSITION_LIMIT, max);
        min_write.and(max_write)
    }

    pub fn enable_torque(&mut self, id: u8) -> Result<(), TransferError> {
        self.transport
            .write_register(id, control_table::TORQUE_ENABLE, TORQUE_ON as u32)
    }

    pub fn disable_torque(&mut self, id: u8) -> Result<(), TransferError> {
        self.transport
            .write_register(id, control_table::TORQUE_ENABLE, TORQUE_OFF as u32)
    }

    /// Commands a goal velocity in native units (0.229 rpm per unit),
    /// negative for reverse.
    pub fn write_velocity(&mut self, id: u8, velocity: i32) -> Result<(), TransferError> {
        self.transport
            .write_register(id, control_table::GOAL_VELOCITY, velocity as u32)
    }

    pub fn read_velocity(&mut self, id: u8) -> Result<i32, TransferError> {
        self.transport
            .read_register(id, control_table::PRESENT_VELOCITY)
            .map(|raw| raw as i32)
    }

    /// Commands a goal position in encoder steps, transmitted unmodified.
    pub fn write_position(&mut self, id: u8, position: u32) -> Result<(), TransferError> {
        self.transport
            .write_register(id, control_table::GOAL_POSITION, position)
    }

    pub fn read_position(&mut self, id: u8) -> Result<u32, TransferError> {
        self.transport.read_register(id, control_table::PRESENT_POSITION)
    }

    pub fn set_led(&mut self, id: u8, on: bool) -> Result<(), TransferError> {
        self.transport
            .write_register(id, control_table::LED, u32::from(on))
    }

    /// Reads the latched hardware alarm bits behind the alert flag.
    pub fn read_hardware_error(&mut self, id: u8) -> Result<u8, TransferError> {
        self.transport
            .read_register(id, control_table::HARDWARE_ERROR_STATUS)
            .map(|raw| raw as u8)
    }
}

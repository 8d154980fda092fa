//! X-series control table. Addresses below 64 live in EEPROM and are
//! locked while torque is enabled; the rest is RAM.

/// Whether the host may write a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Transfer width of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegWidth {
    Byte,
    Dword,
}

impl RegWidth {
    pub const fn bytes(self) -> u16 {
        match self {
            RegWidth::Byte => 1,
            RegWidth::Dword => 4,
        }
    }
}

/// One entry of the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub width: RegWidth,
    pub access: Access,
}

const fn rw(address: u16, width: RegWidth) -> Register {
    Register {
        address,
        width,
        access: Access::ReadWrite,
    }
}

const fn ro(address: u16, width: RegWidth) -> Register {
    Register {
        address,
        width,
        access: Access::ReadOnly,
    }
}

// EEPROM area.
pub const OPERATING_MODE: Register = rw(11, RegWidth::Byte);
pub const VELOCITY_LIMIT: Register = rw(44, RegWidth::Dword);
pub const MAX_POSITION_LIMIT: Register = rw(48, RegWidth::Dword);
pub const MIN_POSITION_LIMIT: Register = rw(52, RegWidth::Dword);

// RAM area.
pub const TORQUE_ENABLE: Register = rw(64, RegWidth::Byte);
pub const LED: Register = rw(65, RegWidth::Byte);
pub const HARDWARE_ERROR_STATUS: Register = ro(70, RegWidth::Byte);
pub const GOAL_VELOCITY: Register = rw(104, RegWidth::Dword);
pub const GOAL_POSITION: Register = rw(116, RegWidth::Dword);
pub const PRESENT_VELOCITY: Register = ro(128, RegWidth::Dword);
pub const PRESENT_POSITION: Register = ro(132, RegWidth::Dword);

pub const TORQUE_ON: u8 = 1;
pub const TORQUE_OFF: u8 = 0;

/// Control modes exposed by the X-series firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Velocity = 1,
    Position = 3,
    ExtendedPosition = 4,
}

impl OperatingMode {
    pub fn register_value(self) -> u8 {
        self as u8
    }

    pub fn from_register_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(OperatingMode::Velocity),
            3 => Some(OperatingMode::Position),
            4 => Some(OperatingMode::ExtendedPosition),
            _ => None,
        }
    }
}

//! Failure types for bus sessions. Communication failures and faults
//! reported by a servo are kept on separate axes; a device fault is only
//! ever surfaced when the transaction itself completed.

use std::fmt;

use thiserror::Error;

use crate::protocol::dxl_def::{
    ERRBIT_ALERT, ERRNUM_ACCESS, ERRNUM_CRC, ERRNUM_DATA_LENGTH, ERRNUM_DATA_LIMIT,
    ERRNUM_DATA_RANGE, ERRNUM_INSTRUCTION, ERRNUM_RESULT_FAIL,
};

/// Failure to acquire the bus channel.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("cannot open {port}: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("{port} rejected baud rate {baud}")]
    BaudRateRejected { port: String, baud: u32 },
}

/// Transport-level failure: nothing usable came back from the device.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommError {
    #[error("port is not open")]
    NotOpen,
    #[error("port is busy with another transaction")]
    PortBusy,
    #[error("failed to transmit the instruction packet")]
    TxFail,
    #[error("no status packet arrived before the timeout")]
    RxTimeout,
    #[error("received a corrupt status packet")]
    RxCorrupt,
    #[error("broadcast and reserved ids cannot be used in a status transaction")]
    Broadcast,
}

/// Nonzero error number in a status packet. The alert flag on its own is
/// not a fault; it only marks a latched hardware alarm and is reported
/// alongside whatever error number the servo raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFault {
    raw: u8,
}

impl DeviceFault {
    pub fn from_status(raw: u8) -> Option<Self> {
        if raw & !ERRBIT_ALERT == 0 {
            None
        } else {
            Some(Self { raw })
        }
    }

    pub fn raw(&self) -> u8 {
        self.raw
    }

    pub fn alert(&self) -> bool {
        self.raw & ERRBIT_ALERT != 0
    }

    pub fn kind(&self) -> FaultKind {
        match self.raw & !ERRBIT_ALERT {
            ERRNUM_RESULT_FAIL => FaultKind::ResultFail,
            ERRNUM_INSTRUCTION => FaultKind::Instruction,
            ERRNUM_CRC => FaultKind::Crc,
            ERRNUM_DATA_RANGE => FaultKind::DataRange,
            ERRNUM_DATA_LENGTH => FaultKind::DataLength,
            ERRNUM_DATA_LIMIT => FaultKind::DataLimit,
            ERRNUM_ACCESS => FaultKind::Access,
            other => FaultKind::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device reported {} (status 0x{:02X})",
            self.kind(),
            self.raw
        )?;
        if self.alert() {
            f.write_str(" with the alert flag set")?;
        }
        Ok(())
    }
}

impl std::error::Error for DeviceFault {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    ResultFail,
    Instruction,
    Crc,
    DataRange,
    DataLength,
    DataLimit,
    Access,
    Unknown(u8),
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::ResultFail => f.write_str("an internal failure"),
            FaultKind::Instruction => f.write_str("an undefined instruction"),
            FaultKind::Crc => f.write_str("a crc mismatch in the request"),
            FaultKind::DataRange => f.write_str("a value outside the register range"),
            FaultKind::DataLength => f.write_str("a data length mismatch"),
            FaultKind::DataLimit => f.write_str("a value outside the configured limits"),
            FaultKind::Access => f.write_str("a register access violation"),
            FaultKind::Unknown(number) => write!(f, "an unknown error number {number}"),
        }
    }
}

/// Outcome axis for a single register transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("communication failed: {0}")]
    Comm(#[from] CommError),
    #[error(transparent)]
    Device(#[from] DeviceFault),
}

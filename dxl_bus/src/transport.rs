use crate::control_table::Register;
use crate::error::TransferError;

/// Register-level view of the bus that the actuator layer is written
/// against. The packet handler implements it for real hardware; tests
/// substitute recording fakes.
pub trait Transport {
    fn write_register(&mut self, id: u8, reg: Register, value: u32) -> Result<(), TransferError>;
    fn read_register(&mut self, id: u8, reg: Register) -> Result<u32, TransferError>;
    fn close_channel(&mut self);
    fn is_open(&self) -> bool;
}

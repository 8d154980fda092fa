//! Driver for Dynamixel X-series servos on a shared half-duplex bus,
//! speaking Protocol 2.0 over a serial port, a pseudo-terminal, or an
//! in-memory simulated bus.

pub mod control_table;
pub mod error;
pub mod protocol;
pub mod sim;
pub mod transport;
pub mod xseries;

#[cfg(test)]
mod tests;

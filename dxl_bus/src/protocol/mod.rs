pub mod crc;
pub mod dxl_def;
pub mod frame;
pub mod packet_handler;
pub mod port_handler;
pub mod serial_port;
#[cfg(unix)]
pub mod virtual_uart;

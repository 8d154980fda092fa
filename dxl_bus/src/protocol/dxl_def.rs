// Protocol 2.0 wire constants.

pub const BROADCAST_ID: u8 = 0xFE;
pub const MAX_ID: u8 = 0xFC;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_REG_WRITE: u8 = 0x04;
pub const INST_ACTION: u8 = 0x05;
pub const INST_FACTORY_RESET: u8 = 0x06;
pub const INST_REBOOT: u8 = 0x08;
pub const INST_STATUS: u8 = 0x55;
pub const INST_SYNC_READ: u8 = 0x82;
pub const INST_SYNC_WRITE: u8 = 0x83;
pub const INST_BULK_READ: u8 = 0x92;
pub const INST_BULK_WRITE: u8 = 0x93;

// Error numbers carried in the low seven bits of a status packet's error
// field. Bit 7 is the alert flag and can accompany any of them.
pub const ERRNUM_RESULT_FAIL: u8 = 0x01;
pub const ERRNUM_INSTRUCTION: u8 = 0x02;
pub const ERRNUM_CRC: u8 = 0x03;
pub const ERRNUM_DATA_RANGE: u8 = 0x04;
pub const ERRNUM_DATA_LENGTH: u8 = 0x05;
pub const ERRNUM_DATA_LIMIT: u8 = 0x06;
pub const ERRNUM_ACCESS: u8 = 0x07;
pub const ERRBIT_ALERT: u8 = 0x80;

// Byte offsets within a framed packet. Instruction packets carry their
// parameters from PKT_PARAMETER0; status packets put the error field
// there and their parameters one byte later.
pub const PKT_HEADER0: usize = 0;
pub const PKT_HEADER1: usize = 1;
pub const PKT_HEADER2: usize = 2;
pub const PKT_RESERVED: usize = 3;
pub const PKT_ID: usize = 4;
pub const PKT_LENGTH_L: usize = 5;
pub const PKT_LENGTH_H: usize = 6;
pub const PKT_INSTRUCTION: usize = 7;
pub const PKT_ERROR: usize = 8;
pub const PKT_PARAMETER0: usize = 8;

pub const TXPACKET_MAX_LEN: usize = 250;
pub const RXPACKET_MAX_LEN: usize = 250;

// Smallest possible status packet: header, id, length, instruction,
// error and crc.
pub const STATUS_PACKET_MIN_LEN: usize = 11;

//! Instruction/status transaction engine. One request is written to the
//! port, then the reply stream is scanned for a well-formed status packet
//! until the byte-time deadline passes.

use log::{debug, trace, warn};

use crate::control_table::{RegWidth, Register};
use crate::error::{CommError, DeviceFault, TransferError};
use crate::protocol::crc::update_crc;
use crate::protocol::dxl_def::{
    ERRBIT_ALERT, INST_READ, INST_STATUS, MAX_ID, PKT_ID, PKT_INSTRUCTION, PKT_LENGTH_H,
    PKT_LENGTH_L, PKT_PARAMETER0, PKT_RESERVED, RXPACKET_MAX_LEN, STATUS_PACKET_MIN_LEN,
    TXPACKET_MAX_LEN,
};
use crate::protocol::frame::{self, Instruction, StatusPacket};
use crate::protocol::port_handler::PortHandler;
use crate::transport::Transport;

/// Reply to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResponse {
    pub model_number: u16,
    pub firmware: u8,
}

#[derive(Debug)]
pub struct PacketHandler<P: PortHandler> {
    port: P,
    is_using: bool,
}

impl<P: PortHandler> PacketHandler<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            is_using: false,
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    fn tx_packet(&mut self, txpacket: &[u8]) -> Result<(), CommError> {
        if self.is_using {
            return Err(CommError::PortBusy);
        }
        if !self.port.is_open() {
            return Err(CommError::NotOpen);
        }
        self.is_using = true;

        if txpacket.len() > TXPACKET_MAX_LEN {
            self.is_using = false;
            return Err(CommError::TxFail);
        }

        trace!("tx {}", format_packet_hex(txpacket));
        self.port.clear_port();
        let written = self.port.write_port(txpacket);
        if written != txpacket.len() {
            self.is_using = false;
            return Err(CommError::TxFail);
        }
        Ok(())
    }

    fn rx_packet(&mut self) -> Result<StatusPacket, CommError> {
        let mut rxpacket: Vec<u8> = Vec::new();
        let mut rx_length = 0usize;
        let mut wait_length = STATUS_PACKET_MIN_LEN;

        let result = loop {
            if rx_length < wait_length {
                let mut chunk = self.port.read_port(wait_length - rx_length);
                rxpacket.append(&mut chunk);
                rx_length = rxpacket.len();
            }

            if rx_length < wait_length {
                if self.port.is_packet_timeout() {
                    break Err(if rx_length == 0 {
                        CommError::RxTimeout
                    } else {
                        CommError::RxCorrupt
                    });
                }
                continue;
            }

            // find a header, skipping stuffing artifacts (FF FF FD FD)
            let mut header_index = None;
            for idx in 0..(rx_length - 3) {
                if rxpacket[idx] == 0xFF
                    && rxpacket[idx + 1] == 0xFF
                    && rxpacket[idx + 2] == 0xFD
                    && rxpacket[idx + 3] != 0xFD
                {
                    header_index = Some(idx);
                    break;
                }
            }

            match header_index {
                Some(0) => {
                    let length_field =
                        u16::from_le_bytes([rxpacket[PKT_LENGTH_L], rxpacket[PKT_LENGTH_H]])
                            as usize;
                    if rxpacket[PKT_RESERVED] != 0x00
                        || rxpacket[PKT_ID] > MAX_ID
                        || length_field < 4
                        || length_field > RXPACKET_MAX_LEN
                        || rxpacket[PKT_INSTRUCTION] != INST_STATUS
                    {
                        // not a plausible status packet, shift by one byte
                        rxpacket.remove(0);
                        rx_length -= 1;
                        continue;
                    }

                    let expected_length = length_field + PKT_LENGTH_H + 1;
                    if wait_length != expected_length {
                        wait_length = expected_length;
                        continue;
                    }

                    let crc_received = u16::from_le_bytes([
                        rxpacket[wait_length - 2],
                        rxpacket[wait_length - 1],
                    ]);
                    if update_crc(0, &rxpacket[..wait_length - 2]) == crc_received {
                        break Ok(());
                    }
                    break Err(CommError::RxCorrupt);
                }
                Some(idx) => {
                    // discard garbage in front of the header
                    rxpacket.drain(0..idx);
                    rx_length = rxpacket.len();
                }
                None => {
                    // keep the last bytes in case a header is split
                    if rx_length > 3 {
                        rxpacket.drain(0..rx_length - 3);
                        rx_length = rxpacket.len();
                    }
                    if self.port.is_packet_timeout() {
                        break Err(if rx_length == 0 {
                            CommError::RxTimeout
                        } else {
                            CommError::RxCorrupt
                        });
                    }
                }
            }
        };
        self.is_using = false;

        match result {
            Ok(()) => {
                trace!("rx {}", format_packet_hex(&rxpacket[..wait_length]));
                let body = frame::unstuff(&rxpacket[PKT_INSTRUCTION..wait_length - 2]);
                Ok(StatusPacket {
                    id: rxpacket[PKT_ID],
                    error: body[1],
                    params: body[2..].to_vec(),
                })
            }
            Err(CommError::RxCorrupt) => {
                warn!("rx corrupt after {rx_length} bytes");
                Err(CommError::RxCorrupt)
            }
            Err(err) => {
                debug!("rx failed: {err}");
                Err(err)
            }
        }
    }

    fn tx_rx_packet(&mut self, txpacket: &[u8]) -> Result<StatusPacket, CommError> {
        self.tx_packet(txpacket)?;

        // reads answer with data, everything else with a bare status
        if txpacket[PKT_INSTRUCTION] == INST_READ {
            let data_length = u16::from_le_bytes([
                txpacket[PKT_PARAMETER0 + 2],
                txpacket[PKT_PARAMETER0 + 3],
            ]) as usize;
            self.port
                .set_packet_timeout(data_length + STATUS_PACKET_MIN_LEN);
        } else {
            self.port.set_packet_timeout(STATUS_PACKET_MIN_LEN);
        }

        loop {
            let status = self.rx_packet()?;
            if status.id == txpacket[PKT_ID] {
                return Ok(status);
            }
        }
    }

    fn check_status(&self, id: u8, status: &StatusPacket) -> Result<(), TransferError> {
        match DeviceFault::from_status(status.error) {
            Some(fault) => Err(TransferError::Device(fault)),
            None => {
                if status.error & ERRBIT_ALERT != 0 {
                    warn!("servo {id} raised the alert flag; its hardware error status holds the cause");
                }
                Ok(())
            }
        }
    }

    /// Checks that a servo is alive and reports its model and firmware.
    pub fn ping(&mut self, id: u8) -> Result<PingResponse, TransferError> {
        if id > MAX_ID {
            return Err(CommError::Broadcast.into());
        }
        let txpacket = frame::encode_instruction(id, &Instruction::Ping);
        let status = self.tx_rx_packet(&txpacket)?;
        self.check_status(id, &status)?;
        if status.params.len() < 3 {
            return Err(CommError::RxCorrupt.into());
        }
        Ok(PingResponse {
            model_number: u16::from_le_bytes([status.params[0], status.params[1]]),
            firmware: status.params[2],
        })
    }

    /// Restarts a servo, dropping its RAM state and latched alarms.
    pub fn reboot(&mut self, id: u8) -> Result<(), TransferError> {
        if id > MAX_ID {
            return Err(CommError::Broadcast.into());
        }
        let txpacket = frame::encode_instruction(id, &Instruction::Reboot);
        let status = self.tx_rx_packet(&txpacket)?;
        self.check_status(id, &status)
    }

    pub fn read_bytes(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>, TransferError> {
        if id > MAX_ID {
            return Err(CommError::Broadcast.into());
        }
        let txpacket = frame::encode_instruction(id, &Instruction::Read { address, length });
        let status = self.tx_rx_packet(&txpacket)?;
        self.check_status(id, &status)?;
        if status.params.len() < length as usize {
            return Err(CommError::RxCorrupt.into());
        }
        Ok(status.params)
    }

    pub fn write_bytes(&mut self, id: u8, address: u16, data: &[u8]) -> Result<(), TransferError> {
        if id > MAX_ID {
            return Err(CommError::Broadcast.into());
        }
        let txpacket = frame::encode_instruction(
            id,
            &Instruction::Write {
                address,
                data: data.to_vec(),
            },
        );
        let status = self.tx_rx_packet(&txpacket)?;
        self.check_status(id, &status)
    }

    pub fn read_u8(&mut self, id: u8, address: u16) -> Result<u8, TransferError> {
        let data = self.read_bytes(id, address, 1)?;
        Ok(data[0])
    }

    pub fn read_u32(&mut self, id: u8, address: u16) -> Result<u32, TransferError> {
        let data = self.read_bytes(id, address, 4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub fn write_u8(&mut self, id: u8, address: u16, value: u8) -> Result<(), TransferError> {
        self.write_bytes(id, address, &[value])
    }

    pub fn write_u32(&mut self, id: u8, address: u16, value: u32) -> Result<(), TransferError> {
        self.write_bytes(id, address, &value.to_le_bytes())
    }
}

impl<P: PortHandler> Transport for PacketHandler<P> {
    fn write_register(&mut self, id: u8, reg: Register, value: u32) -> Result<(), TransferError> {
        match reg.width {
            RegWidth::Byte => self.write_u8(id, reg.address, value as u8),
            RegWidth::Dword => self.write_u32(id, reg.address, value),
        }
    }

    fn read_register(&mut self, id: u8, reg: Register) -> Result<u32, TransferError> {
        match reg.width {
            RegWidth::Byte => self.read_u8(id, reg.address).map(u32::from),
            RegWidth::Dword => self.read_u32(id, reg.address),
        }
    }

    fn close_channel(&mut self) {
        self.port.close_port();
    }

    fn is_open(&self) -> bool {
        self.port.is_open()
    }
}

fn format_packet_hex(packet: &[u8]) -> String {
    packet
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

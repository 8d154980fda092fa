//! Protocol 2.0 frame codec. Builds and parses whole packets; the stream
//! side of receiving (resync, timeouts) lives in the packet handler.

use thiserror::Error;

use crate::protocol::crc::update_crc;
use crate::protocol::dxl_def::{
    INST_PING, INST_READ, INST_REBOOT, INST_STATUS, INST_WRITE, PKT_ID, PKT_INSTRUCTION,
    PKT_LENGTH_H, PKT_LENGTH_L, RXPACKET_MAX_LEN,
};

pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Instructions the driver exchanges with a servo. Anything else on the
/// bus decodes as `Unknown` and is left to the device to refuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    Read { address: u16, length: u16 },
    Write { address: u16, data: Vec<u8> },
    Reboot,
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub id: u8,
    pub instruction: Instruction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    pub error: u8,
    pub params: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than the minimum packet")]
    TooShort,
    #[error("header bytes do not match")]
    BadHeader,
    #[error("length field disagrees with the frame size")]
    LengthMismatch,
    #[error("crc check failed")]
    CrcMismatch,
    #[error("parameter block is malformed")]
    Malformed,
    #[error("not a status packet")]
    NotStatus,
}

/// Inserts the stuffing byte after every `FF FF FD` run so a packet body
/// can never alias the header. The length field counts stuffed bytes.
pub fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &byte in body {
        out.push(byte);
        let n = out.len();
        if n >= 3 && out[n - 3..] == [0xFF, 0xFF, 0xFD] {
            out.push(0xFD);
        }
    }
    out
}

pub fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        let n = out.len();
        if n >= 3 && out[n - 3..] == [0xFF, 0xFF, 0xFD] && body.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

fn encode_frame(id: u8, body: &[u8]) -> Vec<u8> {
    let body = stuff(body);
    let length = (body.len() + 2) as u16;

    let mut frame = Vec::with_capacity(body.len() + 9);
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&body);
    let crc = update_crc(0, &frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn encode_instruction(id: u8, instruction: &Instruction) -> Vec<u8> {
    let mut body = Vec::new();
    match instruction {
        Instruction::Ping => body.push(INST_PING),
        Instruction::Read { address, length } => {
            body.push(INST_READ);
            body.extend_from_slice(&address.to_le_bytes());
            body.extend_from_slice(&length.to_le_bytes());
        }
        Instruction::Write { address, data } => {
            body.push(INST_WRITE);
            body.extend_from_slice(&address.to_le_bytes());
            body.extend_from_slice(data);
        }
        Instruction::Reboot => body.push(INST_REBOOT),
        Instruction::Unknown(inst) => body.push(*inst),
    }
    encode_frame(id, &body)
}

pub fn encode_status(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + params.len());
    body.push(INST_STATUS);
    body.push(error);
    body.extend_from_slice(params);
    encode_frame(id, &body)
}

/// Validates framing and crc, returning the id and the unstuffed body
/// (instruction byte first).
fn parse_frame(bytes: &[u8]) -> Result<(u8, Vec<u8>), FrameError> {
    if bytes.len() < 10 {
        return Err(FrameError::TooShort);
    }
    if bytes[..4] != HEADER {
        return Err(FrameError::BadHeader);
    }
    let length = u16::from_le_bytes([bytes[PKT_LENGTH_L], bytes[PKT_LENGTH_H]]) as usize;
    if length < 3 || bytes.len() != length + 7 {
        return Err(FrameError::LengthMismatch);
    }
    let crc_received = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
    if update_crc(0, &bytes[..bytes.len() - 2]) != crc_received {
        return Err(FrameError::CrcMismatch);
    }
    Ok((bytes[PKT_ID], unstuff(&bytes[PKT_INSTRUCTION..bytes.len() - 2])))
}

pub fn decode_instruction(bytes: &[u8]) -> Result<Decoded, FrameError> {
    let (id, body) = parse_frame(bytes)?;
    let (inst, params) = body.split_first().ok_or(FrameError::Malformed)?;
    let instruction = match *inst {
        INST_PING => {
            if !params.is_empty() {
                return Err(FrameError::Malformed);
            }
            Instruction::Ping
        }
        INST_READ => {
            if params.len() != 4 {
                return Err(FrameError::Malformed);
            }
            Instruction::Read {
                address: u16::from_le_bytes([params[0], params[1]]),
                length: u16::from_le_bytes([params[2], params[3]]),
            }
        }
        INST_WRITE => {
            if params.len() < 2 {
                return Err(FrameError::Malformed);
            }
            Instruction::Write {
                address: u16::from_le_bytes([params[0], params[1]]),
                data: params[2..].to_vec(),
            }
        }
        INST_REBOOT => {
            if !params.is_empty() {
                return Err(FrameError::Malformed);
            }
            Instruction::Reboot
        }
        other => Instruction::Unknown(other),
    };
    Ok(Decoded { id, instruction })
}

pub fn decode_status(bytes: &[u8]) -> Result<StatusPacket, FrameError> {
    let (id, body) = parse_frame(bytes)?;
    if body.first() != Some(&INST_STATUS) {
        return Err(FrameError::NotStatus);
    }
    if body.len() < 2 {
        return Err(FrameError::Malformed);
    }
    Ok(StatusPacket {
        id,
        error: body[1],
        params: body[2..].to_vec(),
    })
}

/// Splits complete frames out of a raw byte stream, leaving any trailing
/// partial frame in the buffer. Used by the virtual bus service loop.
pub fn extract_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        if buffer.len() < 4 {
            break;
        }

        let mut start = None;
        for idx in 0..=(buffer.len() - 4) {
            if buffer[idx..idx + 4] == HEADER {
                start = Some(idx);
                break;
            }
        }
        let Some(start) = start else {
            // no header yet; keep the tail in case one is split across reads
            let keep = buffer.len().min(3);
            buffer.drain(0..buffer.len() - keep);
            break;
        };
        if start > 0 {
            buffer.drain(0..start);
        }

        if buffer.len() < 7 {
            break;
        }
        let length = u16::from_le_bytes([buffer[PKT_LENGTH_L], buffer[PKT_LENGTH_H]]) as usize;
        if length < 3 || length > RXPACKET_MAX_LEN {
            // implausible length field, resync from the next byte
            buffer.drain(0..1);
            continue;
        }
        let total = length + 7;
        if buffer.len() < total {
            break;
        }
        frames.push(buffer.drain(0..total).collect());
    }
    frames
}

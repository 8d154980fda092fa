//! In-memory model of an X-series servo bus. Frames go in, status packets
//! come out, and `step` advances a simple motion model so velocity and
//! position commands have observable effects.

use std::collections::HashMap;

use crate::control_table::{self, Access, OperatingMode, Register};
use crate::protocol::dxl_def::{
    BROADCAST_ID, ERRBIT_ALERT, ERRNUM_ACCESS, ERRNUM_CRC, ERRNUM_DATA_LENGTH, ERRNUM_DATA_LIMIT,
    ERRNUM_DATA_RANGE, ERRNUM_INSTRUCTION, PKT_ID,
};
use crate::protocol::frame::{self, FrameError, Instruction};

const REGISTER_COUNT: usize = 256;
const EEPROM_END: u16 = 64;

const DEFAULT_MODEL_NUMBER: u16 = 1060;
const DEFAULT_FIRMWARE: u8 = 44;
const DEFAULT_VELOCITY_LIMIT: u32 = 265;
const DEFAULT_MAX_POSITION: u32 = 4095;

// Registers the host table does not carry but a device still has.
const REG_MODEL_NUMBER: u16 = 0;
const REG_FIRMWARE_VERSION: u16 = 6;
const REG_ID: u16 = 7;
const REG_BAUD_RATE: u16 = 8;

// One goal-velocity unit is 0.229 rpm.
const STEPS_PER_VELOCITY_UNIT: f64 = 0.229 * 4096.0 / 60.0;

struct Field {
    address: u16,
    len: u16,
    writable: bool,
}

const fn field(reg: Register) -> Field {
    Field {
        address: reg.address,
        len: reg.width.bytes(),
        writable: matches!(reg.access, Access::ReadWrite),
    }
}

const FIELDS: &[Field] = &[
    Field { address: REG_MODEL_NUMBER, len: 2, writable: false },
    Field { address: REG_FIRMWARE_VERSION, len: 1, writable: false },
    Field { address: REG_ID, len: 1, writable: true },
    Field { address: REG_BAUD_RATE, len: 1, writable: true },
    field(control_table::OPERATING_MODE),
    field(control_table::VELOCITY_LIMIT),
    field(control_table::MAX_POSITION_LIMIT),
    field(control_table::MIN_POSITION_LIMIT),
    field(control_table::TORQUE_ENABLE),
    field(control_table::LED),
    field(control_table::HARDWARE_ERROR_STATUS),
    field(control_table::GOAL_VELOCITY),
    field(control_table::GOAL_POSITION),
    field(control_table::PRESENT_VELOCITY),
    field(control_table::PRESENT_POSITION),
];

fn read_u16_le(registers: &[u8], address: u16) -> u16 {
    let a = address as usize;
    u16::from_le_bytes([registers[a], registers[a + 1]])
}

fn write_u16_le(registers: &mut [u8], address: u16, value: u16) {
    let a = address as usize;
    registers[a..a + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u32_le(registers: &[u8], address: u16) -> u32 {
    let a = address as usize;
    u32::from_le_bytes([
        registers[a],
        registers[a + 1],
        registers[a + 2],
        registers[a + 3],
    ])
}

fn write_u32_le(registers: &mut [u8], address: u16, value: u32) {
    let a = address as usize;
    registers[a..a + 4].copy_from_slice(&value.to_le_bytes());
}

/// One simulated servo: a register file plus a fractional position the
/// motion model integrates between register updates.
#[derive(Debug, Clone)]
pub struct SimServo {
    registers: [u8; REGISTER_COUNT],
    position_steps: f64,
}

impl SimServo {
    fn new(id: u8) -> Self {
        let mut servo = Self {
            registers: [0; REGISTER_COUNT],
            position_steps: 0.0,
        };
        write_u16_le(&mut servo.registers, REG_MODEL_NUMBER, DEFAULT_MODEL_NUMBER);
        servo.registers[REG_FIRMWARE_VERSION as usize] = DEFAULT_FIRMWARE;
        servo.registers[REG_ID as usize] = id;
        servo.registers[REG_BAUD_RATE as usize] = 1; // 57600
        servo.registers[control_table::OPERATING_MODE.address as usize] =
            OperatingMode::Position.register_value();
        write_u32_le(
            &mut servo.registers,
            control_table::VELOCITY_LIMIT.address,
            DEFAULT_VELOCITY_LIMIT,
        );
        write_u32_le(
            &mut servo.registers,
            control_table::MAX_POSITION_LIMIT.address,
            DEFAULT_MAX_POSITION,
        );
        write_u32_le(&mut servo.registers, control_table::MIN_POSITION_LIMIT.address, 0);
        servo
    }

    fn mode(&self) -> Option<OperatingMode> {
        OperatingMode::from_register_value(
            self.registers[control_table::OPERATING_MODE.address as usize],
        )
    }

    fn torque_enabled(&self) -> bool {
        self.registers[control_table::TORQUE_ENABLE.address as usize] != 0
    }

    fn hardware_error(&self) -> u8 {
        self.registers[control_table::HARDWARE_ERROR_STATUS.address as usize]
    }

    fn read_region(&self, address: u16, length: u16) -> Option<Vec<u8>> {
        let start = address as usize;
        let end = start + length as usize;
        if end > REGISTER_COUNT {
            return None;
        }
        Some(self.registers[start..end].to_vec())
    }

    /// Applies one write the way the firmware would, returning the error
    /// number for the status packet (0 on success).
    fn handle_write(&mut self, address: u16, data: &[u8]) -> u8 {
        let end = address as usize + data.len();
        if end > REGISTER_COUNT {
            return ERRNUM_ACCESS;
        }

        let Some(field) = FIELDS.iter().find(|field| field.address == address) else {
            return ERRNUM_ACCESS;
        };
        if !field.writable {
            return ERRNUM_ACCESS;
        }
        if data.len() != field.len as usize {
            return ERRNUM_DATA_LENGTH;
        }
        if address < EEPROM_END && self.torque_enabled() {
            return ERRNUM_ACCESS;
        }

        if address == control_table::OPERATING_MODE.address
            && OperatingMode::from_register_value(data[0]).is_none()
        {
            return ERRNUM_DATA_RANGE;
        }
        if (address == control_table::TORQUE_ENABLE.address
            || address == control_table::LED.address)
            && data[0] > 1
        {
            return ERRNUM_DATA_RANGE;
        }
        if address == control_table::GOAL_VELOCITY.address {
            if self.mode() != Some(OperatingMode::Velocity) {
                return ERRNUM_ACCESS;
            }
            let goal = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let limit = read_u32_le(&self.registers, control_table::VELOCITY_LIMIT.address);
            if goal.unsigned_abs() > limit {
                return ERRNUM_DATA_LIMIT;
            }
        }
        if address == control_table::GOAL_POSITION.address {
            match self.mode() {
                Some(OperatingMode::Position) => {
                    let goal = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                    let min =
                        read_u32_le(&self.registers, control_table::MIN_POSITION_LIMIT.address);
                    let max =
                        read_u32_le(&self.registers, control_table::MAX_POSITION_LIMIT.address);
                    if goal < min || goal > max {
                        return ERRNUM_DATA_LIMIT;
                    }
                }
                // multi-turn, the single-turn limits do not apply
                Some(OperatingMode::ExtendedPosition) => {}
                _ => return ERRNUM_ACCESS,
            }
        }

        let torque_was_on = self.torque_enabled();
        self.registers[address as usize..end].copy_from_slice(data);

        // engaging torque makes the goal track the shaft, as the firmware
        // does, so the horn cannot jump to a stale goal
        if address == control_table::TORQUE_ENABLE.address && !torque_was_on && data[0] == 1 {
            let present = read_u32_le(&self.registers, control_table::PRESENT_POSITION.address);
            write_u32_le(&mut self.registers, control_table::GOAL_POSITION.address, present);
        }
        0
    }

    fn reboot(&mut self) {
        // RAM reverts, the EEPROM and the absolute encoder survive
        let position = read_u32_le(&self.registers, control_table::PRESENT_POSITION.address);
        for byte in &mut self.registers[EEPROM_END as usize..] {
            *byte = 0;
        }
        write_u32_le(&mut self.registers, control_table::PRESENT_POSITION.address, position);
        write_u32_le(&mut self.registers, control_table::GOAL_POSITION.address, position);
        self.position_steps = position as i32 as f64;
    }

    fn update_motion(&mut self, dt: f64) {
        if !self.torque_enabled() {
            write_u32_le(&mut self.registers, control_table::PRESENT_VELOCITY.address, 0);
            return;
        }

        match self.mode() {
            Some(OperatingMode::Velocity) => {
                let goal =
                    read_u32_le(&self.registers, control_table::GOAL_VELOCITY.address) as i32;
                self.position_steps += goal as f64 * STEPS_PER_VELOCITY_UNIT * dt;
                write_u32_le(
                    &mut self.registers,
                    control_table::PRESENT_VELOCITY.address,
                    goal as u32,
                );
            }
            Some(OperatingMode::Position) | Some(OperatingMode::ExtendedPosition) => {
                let goal =
                    read_u32_le(&self.registers, control_table::GOAL_POSITION.address) as i32;
                let limit =
                    read_u32_le(&self.registers, control_table::VELOCITY_LIMIT.address) as i32;
                let max_step = limit as f64 * STEPS_PER_VELOCITY_UNIT * dt;
                let delta = goal as f64 - self.position_steps;
                if delta.abs() <= max_step {
                    self.position_steps = goal as f64;
                    write_u32_le(&mut self.registers, control_table::PRESENT_VELOCITY.address, 0);
                } else {
                    self.position_steps += max_step.copysign(delta);
                    let velocity = if delta < 0.0 { -limit } else { limit };
                    write_u32_le(
                        &mut self.registers,
                        control_table::PRESENT_VELOCITY.address,
                        velocity as u32,
                    );
                }
            }
            None => {}
        }

        write_u32_le(
            &mut self.registers,
            control_table::PRESENT_POSITION.address,
            self.position_steps.round() as i32 as u32,
        );
    }
}

/// Point-in-time view of one simulated servo, for displays and tests.
#[derive(Debug, Clone)]
pub struct SimServoSnapshot {
    pub id: u8,
    pub mode: Option<OperatingMode>,
    pub torque_enabled: bool,
    pub led_on: bool,
    pub goal_position: i32,
    pub present_position: i32,
    pub goal_velocity: i32,
    pub present_velocity: i32,
    pub hardware_error: u8,
    pub moving: bool,
}

#[derive(Debug, Default)]
pub struct DxlBusSim {
    servos: HashMap<u8, SimServo>,
}

impl DxlBusSim {
    pub fn new() -> Self {
        Self {
            servos: HashMap::new(),
        }
    }

    pub fn add_servo(&mut self, id: u8) {
        self.servos.entry(id).or_insert_with(|| SimServo::new(id));
    }

    pub fn remove_servo(&mut self, id: u8) -> bool {
        self.servos.remove(&id).is_some()
    }

    pub fn set_present_position(&mut self, id: u8, position: i32) -> bool {
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        servo.position_steps = position as f64;
        write_u32_le(
            &mut servo.registers,
            control_table::PRESENT_POSITION.address,
            position as u32,
        );
        true
    }

    pub fn set_present_velocity(&mut self, id: u8, velocity: i32) -> bool {
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        write_u32_le(
            &mut servo.registers,
            control_table::PRESENT_VELOCITY.address,
            velocity as u32,
        );
        true
    }

    /// Latches hardware alarm bits; every status packet from the servo
    /// will carry the alert flag until a reboot clears them.
    pub fn set_hardware_error(&mut self, id: u8, bits: u8) -> bool {
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        servo.registers[control_table::HARDWARE_ERROR_STATUS.address as usize] = bits;
        true
    }

    /// Feeds one received frame to the bus. `Ok(None)` means no servo
    /// answers (broadcast or unknown id).
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let decoded = match frame::decode_instruction(bytes) {
            Ok(decoded) => decoded,
            Err(FrameError::CrcMismatch) => {
                // the addressed servo still answers, flagging our bad crc
                let id = bytes[PKT_ID];
                let Some(servo) = self.servos.get(&id) else {
                    return Ok(None);
                };
                let error = Self::with_alert(servo, ERRNUM_CRC);
                return Ok(Some(frame::encode_status(id, error, &[])));
            }
            Err(err) => return Err(err),
        };

        if decoded.id == BROADCAST_ID {
            for servo in self.servos.values_mut() {
                let _ = Self::apply_instruction(servo, &decoded.instruction);
            }
            return Ok(None);
        }

        let Some(servo) = self.servos.get_mut(&decoded.id) else {
            return Ok(None);
        };

        let (errnum, params) = Self::apply_instruction(servo, &decoded.instruction);
        let error = Self::with_alert(servo, errnum);
        Ok(Some(frame::encode_status(decoded.id, error, &params)))
    }

    pub fn step(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        for servo in self.servos.values_mut() {
            servo.update_motion(dt);
        }
    }

    pub fn snapshots(&self) -> Vec<SimServoSnapshot> {
        let mut ids: Vec<u8> = self.servos.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .map(|&id| {
                let servo = &self.servos[&id];
                let present_velocity =
                    read_u32_le(&servo.registers, control_table::PRESENT_VELOCITY.address) as i32;
                SimServoSnapshot {
                    id,
                    mode: servo.mode(),
                    torque_enabled: servo.torque_enabled(),
                    led_on: servo.registers[control_table::LED.address as usize] != 0,
                    goal_position: read_u32_le(
                        &servo.registers,
                        control_table::GOAL_POSITION.address,
                    ) as i32,
                    present_position: read_u32_le(
                        &servo.registers,
                        control_table::PRESENT_POSITION.address,
                    ) as i32,
                    goal_velocity: read_u32_le(
                        &servo.registers,
                        control_table::GOAL_VELOCITY.address,
                    ) as i32,
                    present_velocity,
                    hardware_error: servo.hardware_error(),
                    moving: present_velocity != 0,
                }
            })
            .collect()
    }

    fn with_alert(servo: &SimServo, errnum: u8) -> u8 {
        if servo.hardware_error() != 0 {
            errnum | ERRBIT_ALERT
        } else {
            errnum
        }
    }

    fn apply_instruction(servo: &mut SimServo, instruction: &Instruction) -> (u8, Vec<u8>) {
        match instruction {
            Instruction::Ping => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(
                    &read_u16_le(&servo.registers, REG_MODEL_NUMBER).to_le_bytes(),
                );
                params.push(servo.registers[REG_FIRMWARE_VERSION as usize]);
                (0, params)
            }
            Instruction::Read { address, length } => match servo.read_region(*address, *length) {
                Some(data) => (0, data),
                None => (ERRNUM_ACCESS, Vec::new()),
            },
            Instruction::Write { address, data } => (servo.handle_write(*address, data), Vec::new()),
            Instruction::Reboot => {
                servo.reboot();
                (0, Vec::new())
            }
            Instruction::Unknown(_) => (ERRNUM_INSTRUCTION, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::dxl_def::INST_SYNC_WRITE;
    use crate::protocol::frame::StatusPacket;

    fn bus_with_servo(id: u8) -> DxlBusSim {
        let mut sim = DxlBusSim::new();
        sim.add_servo(id);
        sim
    }

    fn write_frame(id: u8, address: u16, data: &[u8]) -> Vec<u8> {
        frame::encode_instruction(
            id,
            &Instruction::Write {
                address,
                data: data.to_vec(),
            },
        )
    }

    fn read_frame(id: u8, address: u16, length: u16) -> Vec<u8> {
        frame::encode_instruction(id, &Instruction::Read { address, length })
    }

    fn decode(response: Option<Vec<u8>>) -> StatusPacket {
        let bytes = response.expect("expected a status response");
        frame::decode_status(&bytes).expect("status decodes")
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut sim = bus_with_servo(1);

        let status = decode(sim.handle_frame(&write_frame(1, 65, &[1])).expect("write"));
        assert_eq!(status.error, 0);

        let status = decode(sim.handle_frame(&read_frame(1, 65, 1)).expect("read"));
        assert_eq!(status.params, vec![1]);
    }

    #[test]
    fn unknown_instruction_is_refused_by_the_servo() {
        let mut sim = bus_with_servo(1);
        let bytes = frame::encode_instruction(1, &Instruction::Unknown(INST_SYNC_WRITE));
        let status = decode(sim.handle_frame(&bytes).expect("frame"));
        assert_eq!(status.error & 0x7F, ERRNUM_INSTRUCTION);
    }

    #[test]
    fn corrupted_request_is_answered_with_a_crc_error() {
        let mut sim = bus_with_servo(1);
        let mut bytes = write_frame(1, 65, &[1]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let status = decode(sim.handle_frame(&bytes).expect("frame"));
        assert_eq!(status.error & 0x7F, ERRNUM_CRC);
    }

    #[test]
    fn absent_and_broadcast_ids_stay_silent() {
        let mut sim = bus_with_servo(1);
        assert!(sim.handle_frame(&write_frame(9, 65, &[1])).expect("absent").is_none());
        assert!(sim
            .handle_frame(&write_frame(BROADCAST_ID, 65, &[1]))
            .expect("broadcast")
            .is_none());

        // the broadcast write still landed
        let status = decode(sim.handle_frame(&read_frame(1, 65, 1)).expect("read"));
        assert_eq!(status.params, vec![1]);
    }

    #[test]
    fn partial_field_write_reports_a_length_error() {
        let mut sim = bus_with_servo(1);
        let status = decode(sim.handle_frame(&write_frame(1, 116, &[0x00, 0x02])).expect("write"));
        assert_eq!(status.error & 0x7F, ERRNUM_DATA_LENGTH);
    }

    #[test]
    fn velocity_motion_integrates_position() {
        let mut sim = bus_with_servo(1);
        sim.handle_frame(&write_frame(1, 11, &[1])).expect("mode");
        sim.handle_frame(&write_frame(1, 64, &[1])).expect("torque");
        sim.handle_frame(&write_frame(1, 104, &[100, 0, 0, 0])).expect("goal");

        sim.step(1.0);

        let snapshot = &sim.snapshots()[0];
        assert_eq!(snapshot.present_velocity, 100);
        assert!(snapshot.moving);
        assert!(
            snapshot.present_position > 1500,
            "position only reached {}",
            snapshot.present_position
        );
    }

    #[test]
    fn position_motion_stops_at_the_goal() {
        let mut sim = bus_with_servo(1);
        sim.handle_frame(&write_frame(1, 64, &[1])).expect("torque");
        sim.handle_frame(&write_frame(1, 116, &[0xF4, 0x01, 0x00, 0x00])).expect("goal");

        sim.step(0.05);
        let mid = sim.snapshots()[0].present_position;
        assert!(mid > 0 && mid < 500, "unexpected midpoint {mid}");

        sim.step(1.0);
        let done = &sim.snapshots()[0];
        assert_eq!(done.present_position, 500);
        assert_eq!(done.present_velocity, 0);
        assert!(!done.moving);
    }

    #[test]
    fn reboot_clears_ram_but_keeps_the_encoder() {
        let mut sim = bus_with_servo(1);
        sim.handle_frame(&write_frame(1, 64, &[1])).expect("torque");
        sim.handle_frame(&write_frame(1, 65, &[1])).expect("led");
        assert!(sim.set_present_position(1, 2048));
        assert!(sim.set_hardware_error(1, 0x04));

        let bytes = frame::encode_instruction(1, &Instruction::Reboot);
        let status = decode(sim.handle_frame(&bytes).expect("reboot"));
        assert_eq!(status.error & 0x7F, 0);

        let snapshot = &sim.snapshots()[0];
        assert!(!snapshot.torque_enabled);
        assert!(!snapshot.led_on);
        assert_eq!(snapshot.hardware_error, 0);
        assert_eq!(snapshot.present_position, 2048);
        assert_eq!(snapshot.goal_position, 2048);
    }
}

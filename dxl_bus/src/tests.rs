use std::collections::VecDeque;

use crate::control_table::{OperatingMode, Register};
use crate::error::{CommError, DeviceFault, FaultKind, TransferError};
use crate::protocol::dxl_def::BROADCAST_ID;
use crate::protocol::packet_handler::PacketHandler;
use crate::protocol::port_handler::SimPort;
use crate::sim::DxlBusSim;
use crate::transport::Transport;
use crate::xseries::XSeries;

/// Records every transaction and can be primed to fail, so tests can
/// assert which registers an operation touches without any bus at all.
#[derive(Default)]
struct RecordingTransport {
    writes: Vec<(u8, u16, u16, u32)>,
    reads: Vec<(u8, u16, u16)>,
    read_value: u32,
    failures: VecDeque<TransferError>,
    closed: bool,
}

impl RecordingTransport {
    fn new() -> Self {
        Self::default()
    }

    fn queue_failure(&mut self, error: TransferError) {
        self.failures.push_back(error);
    }

    fn next_outcome(&mut self) -> Result<(), TransferError> {
        match self.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Transport for RecordingTransport {
    fn write_register(&mut self, id: u8, reg: Register, value: u32) -> Result<(), TransferError> {
        self.writes.push((id, reg.address, reg.width.bytes(), value));
        self.next_outcome()
    }

    fn read_register(&mut self, id: u8, reg: Register) -> Result<u32, TransferError> {
        self.reads.push((id, reg.address, reg.width.bytes()));
        self.next_outcome().map(|_| self.read_value)
    }

    fn close_channel(&mut self) {
        self.closed = true;
    }

    fn is_open(&self) -> bool {
        !self.closed
    }
}

fn sim_client(ids: &[u8]) -> XSeries<PacketHandler<SimPort>> {
    let mut sim = DxlBusSim::new();
    for &id in ids {
        sim.add_servo(id);
    }
    XSeries::new(PacketHandler::new(SimPort::new(sim)))
}

fn expect_device_fault<T: std::fmt::Debug>(result: Result<T, TransferError>) -> DeviceFault {
    match result {
        Err(TransferError::Device(fault)) => fault,
        other => panic!("expected a device fault, got {other:?}"),
    }
}

#[test]
fn operations_address_the_documented_registers() {
    type Op = fn(&mut XSeries<RecordingTransport>) -> Result<(), TransferError>;
    let cases: [(Op, (u8, u16, u16, u32)); 6] = [
        (|c| c.set_velocity_limit(1, 265), (1, 44, 4, 265)),
        (|c| c.enable_torque(1), (1, 64, 1, 1)),
        (|c| c.disable_torque(1), (1, 64, 1, 0)),
        (|c| c.write_velocity(1, -120), (1, 104, 4, (-120i32) as u32)),
        (|c| c.write_position(1, 2048), (1, 116, 4, 2048)),
        (|c| c.set_led(1, true), (1, 65, 1, 1)),
    ];

    for (op, expected) in cases {
        let mut client = XSeries::new(RecordingTransport::new());
        op(&mut client).expect("operation");
        assert_eq!(client.transport.writes, vec![expected]);
    }
}

#[test]
fn velocity_mode_entry_writes_mode_then_zero_goal() {
    let mut client = XSeries::new(RecordingTransport::new());
    client
        .set_operating_mode(1, OperatingMode::Velocity)
        .expect("mode");
    assert_eq!(
        client.transport.writes,
        vec![(1, 11, 1, 1), (1, 104, 4, 0)]
    );
}

#[test]
fn position_mode_entry_is_a_single_write() {
    let mut client = XSeries::new(RecordingTransport::new());
    client
        .set_operating_mode(1, OperatingMode::Position)
        .expect("mode");
    client
        .set_operating_mode(1, OperatingMode::ExtendedPosition)
        .expect("mode");
    assert_eq!(client.transport.writes, vec![(1, 11, 1, 3), (1, 11, 1, 4)]);
}

#[test]
fn velocity_goal_reset_is_sent_even_when_the_mode_write_faults() {
    let mut transport = RecordingTransport::new();
    let fault = DeviceFault::from_status(0x07).expect("nonzero status");
    transport.queue_failure(TransferError::Device(fault));

    let mut client = XSeries::new(transport);
    let reported = expect_device_fault(client.set_operating_mode(1, OperatingMode::Velocity));

    assert_eq!(reported.kind(), FaultKind::Access);
    assert_eq!(
        client.transport.writes,
        vec![(1, 11, 1, 1), (1, 104, 4, 0)]
    );
}

#[test]
fn position_limits_written_low_bound_first() {
    let mut client = XSeries::new(RecordingTransport::new());
    client.set_position_limits(1, 100, 4000).expect("limits");
    assert_eq!(
        client.transport.writes,
        vec![(1, 52, 4, 100), (1, 48, 4, 4000)]
    );
}

#[test]
fn both_limit_writes_are_issued_when_the_first_fails() {
    let mut transport = RecordingTransport::new();
    transport.queue_failure(TransferError::Comm(CommError::RxTimeout));

    let mut client = XSeries::new(transport);
    let err = client.set_position_limits(1, 0, 4095).unwrap_err();

    assert_eq!(err, TransferError::Comm(CommError::RxTimeout));
    assert_eq!(client.transport.writes.len(), 2);
    assert_eq!(client.transport.writes[1], (1, 48, 4, 4095));
}

#[test]
fn demo_sequence_issues_seven_register_writes() {
    let mut client = XSeries::new(RecordingTransport::new());

    client
        .set_operating_mode(1, OperatingMode::Velocity)
        .expect("mode");
    client.set_velocity_limit(1, 250).expect("limit");
    client.enable_torque(1).expect("torque on");
    client.write_velocity(1, 250).expect("spin");
    client.write_velocity(1, 0).expect("stop");
    client.disable_torque(1).expect("torque off");

    assert_eq!(
        client.transport.writes,
        vec![
            (1, 11, 1, 1),
            (1, 104, 4, 0),
            (1, 44, 4, 250),
            (1, 64, 1, 1),
            (1, 104, 4, 250),
            (1, 104, 4, 0),
            (1, 64, 1, 0),
        ]
    );
}

#[test]
fn velocity_reads_decode_twos_complement() {
    let mut transport = RecordingTransport::new();
    transport.read_value = (-250i32) as u32;

    let mut client = XSeries::new(transport);
    assert_eq!(client.read_velocity(1).expect("read"), -250);
    assert_eq!(client.transport.reads, vec![(1, 128, 4)]);
}

#[test]
fn absent_servo_reports_a_comm_failure() {
    let mut client = sim_client(&[1]);

    let err = client.write_position(9, 100).unwrap_err();
    assert_eq!(err, TransferError::Comm(CommError::RxTimeout));

    let err = client.read_position(9).unwrap_err();
    assert_eq!(err, TransferError::Comm(CommError::RxTimeout));
}

#[test]
fn present_values_pass_through_unmodified() {
    let mut client = sim_client(&[1]);
    assert!(client.transport.port_mut().sim_mut().set_present_position(1, 3000));
    assert!(client.transport.port_mut().sim_mut().set_present_velocity(1, -42));

    assert_eq!(client.read_position(1).expect("position"), 3000);
    assert_eq!(client.read_velocity(1).expect("velocity"), -42);
}

#[test]
fn eeprom_writes_rejected_while_torque_enabled() {
    let mut client = sim_client(&[1]);
    client.enable_torque(1).expect("torque on");

    let fault = expect_device_fault(client.set_velocity_limit(1, 200));
    assert_eq!(fault.kind(), FaultKind::Access);

    client.disable_torque(1).expect("torque off");
    client.set_velocity_limit(1, 200).expect("limit lands");
}

#[test]
fn goal_writes_must_match_the_active_mode() {
    let mut client = sim_client(&[1]);

    // factory mode is position control, a velocity goal is refused
    let fault = expect_device_fault(client.write_velocity(1, 50));
    assert_eq!(fault.kind(), FaultKind::Access);

    client
        .set_operating_mode(1, OperatingMode::Velocity)
        .expect("mode");
    let fault = expect_device_fault(client.write_position(1, 1000));
    assert_eq!(fault.kind(), FaultKind::Access);

    client.write_velocity(1, 50).expect("goal");
}

#[test]
fn velocity_goals_beyond_the_limit_are_rejected() {
    let mut client = sim_client(&[1]);
    client
        .set_operating_mode(1, OperatingMode::Velocity)
        .expect("mode");
    client.set_velocity_limit(1, 100).expect("limit");

    client.write_velocity(1, 100).expect("at the limit");
    let fault = expect_device_fault(client.write_velocity(1, 101));
    assert_eq!(fault.kind(), FaultKind::DataLimit);
    let fault = expect_device_fault(client.write_velocity(1, -101));
    assert_eq!(fault.kind(), FaultKind::DataLimit);
}

#[test]
fn boundary_position_is_transmitted_unmodified() {
    let mut client = sim_client(&[1]);

    client.write_position(1, 4095).expect("boundary");
    let snapshots = client.transport.port_mut().sim_mut().snapshots();
    assert_eq!(snapshots[0].goal_position, 4095);

    let fault = expect_device_fault(client.write_position(1, 4096));
    assert_eq!(fault.kind(), FaultKind::DataLimit);
}

#[test]
fn extended_position_mode_ignores_single_turn_limits() {
    let mut client = sim_client(&[1]);
    client
        .set_operating_mode(1, OperatingMode::ExtendedPosition)
        .expect("mode");
    client.write_position(1, 8192).expect("multi-turn goal");
}

#[test]
fn velocity_demo_sequence_runs_end_to_end() {
    let mut client = sim_client(&[1]);

    client
        .set_operating_mode(1, OperatingMode::Velocity)
        .expect("mode");
    client.set_velocity_limit(1, 250).expect("limit");
    client.enable_torque(1).expect("torque on");
    client.write_velocity(1, 250).expect("spin");

    client.transport.port_mut().sim_mut().step(0.5);
    assert_eq!(client.read_velocity(1).expect("present velocity"), 250);
    assert!(client.read_position(1).expect("present position") > 0);

    client.write_velocity(1, 0).expect("stop");
    client.transport.port_mut().sim_mut().step(0.1);
    assert_eq!(client.read_velocity(1).expect("stopped"), 0);

    client.disable_torque(1).expect("torque off");
    client.close();
    assert!(!client.is_open());
    client.close();
    assert_eq!(client.transport.port_mut().release_count(), 1);
}

#[test]
fn ping_identifies_present_servos() {
    let mut client = sim_client(&[1]);

    let info = client.transport.ping(1).expect("ping");
    assert_eq!(info.model_number, 1060);
    assert_eq!(info.firmware, 44);

    let err = client.transport.ping(9).unwrap_err();
    assert_eq!(err, TransferError::Comm(CommError::RxTimeout));

    let err = client.transport.ping(BROADCAST_ID).unwrap_err();
    assert_eq!(err, TransferError::Comm(CommError::Broadcast));
}

#[test]
fn reboot_clears_volatile_state() {
    let mut client = sim_client(&[1]);
    client.enable_torque(1).expect("torque on");
    client.set_led(1, true).expect("led on");

    client.transport.reboot(1).expect("reboot");

    let snapshots = client.transport.port_mut().sim_mut().snapshots();
    assert!(!snapshots[0].torque_enabled);
    assert!(!snapshots[0].led_on);
    assert_eq!(client.read_hardware_error(1).expect("hardware error"), 0);
}

#[test]
fn alert_flag_marks_faults_but_never_blocks_reads() {
    let mut client = sim_client(&[1]);
    assert!(client.transport.port_mut().sim_mut().set_hardware_error(1, 0x04));

    // the alarm alone must not fail the read that diagnoses it
    assert_eq!(client.read_hardware_error(1).expect("readable"), 0x04);

    let fault = expect_device_fault(client.write_velocity(1, 10));
    assert_eq!(fault.kind(), FaultKind::Access);
    assert!(fault.alert());
    assert_eq!(fault.raw(), 0x87);
}

#[test]
fn close_is_idempotent_and_releases_once() {
    let mut client = sim_client(&[1]);
    assert!(client.is_open());

    client.close();
    client.close();

    assert!(!client.is_open());
    assert_eq!(client.transport.port_mut().release_count(), 1);
}

#[test]
fn operations_after_close_report_not_open() {
    let mut client = sim_client(&[1]);
    client.close();

    let err = client.write_position(1, 100).unwrap_err();
    assert_eq!(err, TransferError::Comm(CommError::NotOpen));

    let err = client.read_position(1).unwrap_err();
    assert_eq!(err, TransferError::Comm(CommError::NotOpen));
}

#[cfg(unix)]
mod virtual_uart {
    use std::fs::OpenOptions;
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};

    use crate::protocol::frame::{self, Instruction};
    use crate::protocol::port_handler::PortHandler;
    use crate::protocol::virtual_uart::VirtualUartPort;

    fn read_until_len<P: PortHandler>(port: &mut P, len: usize) -> Vec<u8> {
        let start = Instant::now();
        let mut out = Vec::new();
        while out.len() < len && start.elapsed() < Duration::from_secs(1) {
            let mut chunk = port.read_port(len - out.len());
            if chunk.is_empty() {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            out.append(&mut chunk);
        }
        out
    }

    fn set_raw(fd: i32) {
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut term) != 0 {
                return;
            }
            libc::cfmakeraw(&mut term);
            let _ = libc::tcsetattr(fd, libc::TCSANOW, &term);
        }
    }

    #[test]
    fn protocol_frames_cross_the_pty() {
        let mut port = VirtualUartPort::new().expect("create virtual uart");
        let slave_path = port.slave_path().to_string();

        let mut slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&slave_path)
            .expect("open slave");
        set_raw(slave.as_raw_fd());

        let ping = frame::encode_instruction(1, &Instruction::Ping);
        slave.write_all(&ping).expect("write to slave");
        let read = read_until_len(&mut port, ping.len());
        assert_eq!(read, ping);

        // model 1060, firmware 44, the way a servo would answer
        let status = frame::encode_status(1, 0, &[0x24, 0x04, 0x2C]);
        let written = port.write_port(&status);
        assert_eq!(written, status.len());

        let mut buf = vec![0u8; status.len()];
        let mut got = 0usize;
        let start = Instant::now();
        while got < buf.len() && start.elapsed() < Duration::from_secs(1) {
            match slave.read(&mut buf[got..]) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => got += n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("read slave: {err}"),
            }
        }
        assert_eq!(buf[..got], status[..]);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use dxl_bus::control_table::OperatingMode;
use dxl_bus::error::{CommError, TransferError};
use dxl_bus::protocol::dxl_def::MAX_ID;
use dxl_bus::protocol::packet_handler::PacketHandler;
use dxl_bus::protocol::serial_port::SerialPortHandler;
use dxl_bus::xseries::XSeries;
use log::LevelFilter;
use serialport::{SerialPortInfo, SerialPortType};

#[cfg(unix)]
use dxl_bus::protocol::frame;
#[cfg(unix)]
use dxl_bus::protocol::port_handler::PortHandler;
#[cfg(unix)]
use dxl_bus::protocol::virtual_uart::VirtualUartPort;
#[cfg(unix)]
use dxl_bus::sim::DxlBusSim;

#[cfg(unix)]
const VBUS_FIRST_SERVO_ID: u8 = 1;
#[cfg(unix)]
const VBUS_LAST_SERVO_ID: u8 = 6;

#[derive(Debug, Parser)]
#[command(name = "dxlctl", about = "Dynamixel X-series servo bus client")]
struct Args {
    #[arg(
        long,
        value_name = "PORT",
        help = "Serial port path (e.g. COM6 or /dev/ttyUSB0). If omitted, auto-selects a detected port."
    )]
    port: Option<String>,

    #[arg(long, default_value_t = 57_600)]
    baud: u32,

    #[arg(short, long, help = "Log protocol traffic")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ping a range of ids and print the servos that answer.
    Scan {
        #[arg(long, default_value_t = 1)]
        from: u8,

        #[arg(long, default_value_t = 20)]
        to: u8,
    },

    /// Read position, velocity and hardware error status from one servo.
    Read {
        #[arg(long)]
        id: u8,
    },

    /// Switch the operating mode of one servo.
    Mode {
        #[arg(long)]
        id: u8,

        #[arg(long, value_enum)]
        mode: ModeArg,
    },

    /// Send a goal position, then read back the present position.
    Move {
        #[arg(long)]
        id: u8,

        #[arg(long, value_name = "STEPS")]
        position: u32,
    },

    /// Spin one servo in velocity mode for a while, then stop and relax it.
    Spin(SpinArgs),

    /// Enable or disable torque on one servo.
    Torque {
        #[arg(long)]
        id: u8,

        #[arg(value_enum)]
        state: SwitchState,
    },

    /// Turn the status LED of one servo on or off.
    Led {
        #[arg(long)]
        id: u8,

        #[arg(value_enum)]
        state: SwitchState,
    },

    /// Reboot one servo, clearing latched hardware alarms.
    Reboot {
        #[arg(long)]
        id: u8,
    },

    /// Run a headless simulated servo bus and print its PTY path.
    #[cfg(unix)]
    Vbus(VbusArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Velocity,
    Position,
    ExtendedPosition,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Velocity => OperatingMode::Velocity,
            ModeArg::Position => OperatingMode::Position,
            ModeArg::ExtendedPosition => OperatingMode::ExtendedPosition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SwitchState {
    On,
    Off,
}

#[derive(Debug, ClapArgs)]
struct SpinArgs {
    #[arg(long)]
    id: u8,

    #[arg(long, default_value_t = 250, allow_negative_numbers = true)]
    velocity: i32,

    #[arg(long, default_value_t = 250)]
    limit: u32,

    #[arg(long, default_value_t = 10.0)]
    seconds: f64,
}

#[cfg(unix)]
#[derive(Debug, ClapArgs)]
struct VbusArgs {
    #[arg(long, default_value_t = VBUS_FIRST_SERVO_ID)]
    first_servo_id: u8,

    #[arg(long, default_value_t = VBUS_LAST_SERVO_ID)]
    last_servo_id: u8,
}

type BusClient = XSeries<PacketHandler<SerialPortHandler>>;

fn open_client(port: &str, baud: u32) -> Result<BusClient, Box<dyn std::error::Error>> {
    Ok(XSeries::open(port, baud)?)
}

fn score_port(info: &SerialPortInfo) -> i32 {
    let name = info.port_name.to_ascii_lowercase();
    let mut score = 0i32;

    score += match info.port_type {
        SerialPortType::UsbPort(_) => 40,
        SerialPortType::PciPort => 20,
        SerialPortType::Unknown => 10,
        SerialPortType::BluetoothPort => -30,
    };

    if name.contains("ttyusb")
        || name.contains("ttyacm")
        || name.contains("cu.usb")
        || name.starts_with("com")
    {
        score += 30;
    }
    if name.contains("usb") {
        score += 15;
    }
    if name.contains("bluetooth") {
        score -= 50;
    }

    score
}

fn resolve_port(
    port_arg: Option<String>,
    baud: u32,
) -> Result<(String, bool), Box<dyn std::error::Error>> {
    if let Some(port) = port_arg {
        let trimmed = port.trim();
        if trimmed.is_empty() {
            return Err("port cannot be empty".into());
        }
        return Ok((trimmed.to_string(), false));
    }

    let mut ports = serialport::available_ports()?;
    if ports.is_empty() {
        return Err(
            "no serial ports detected; pass --port explicitly (e.g. --port /dev/ttyUSB0)".into(),
        );
    }

    ports.sort_by(|a, b| {
        score_port(b)
            .cmp(&score_port(a))
            .then_with(|| a.port_name.cmp(&b.port_name))
    });

    let mut attempted = Vec::new();
    for info in ports {
        let port_name = info.port_name;
        match serialport::new(&port_name, baud)
            .timeout(Duration::from_millis(2))
            .open()
        {
            Ok(_) => return Ok((port_name, true)),
            Err(err) => attempted.push(format!("{port_name}: {err}")),
        }
    }

    let details = attempted.join("; ");
    Err(format!(
        "no usable serial ports detected at baud {baud}; pass --port explicitly. Tried: {details}"
    )
    .into())
}

fn run_scan(port: &str, baud: u32, from: u8, to: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    let last = to.min(MAX_ID);

    println!("Scanning ids {from}..={last} on {port} @ {baud} baud");
    let mut found = 0usize;
    for id in from..=last {
        match client.transport.ping(id) {
            Ok(info) => {
                found += 1;
                println!(
                    "id={id} model={} firmware={}",
                    info.model_number, info.firmware
                );
            }
            Err(TransferError::Comm(CommError::RxTimeout)) => {}
            Err(err) => log::warn!("ping failed for id {id}: {err}"),
        }
    }
    println!("Found {found} servo(s)");

    client.close();
    Ok(())
}

fn run_read(port: &str, baud: u32, id: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    let position = client.read_position(id)?;
    let velocity = client.read_velocity(id)?;
    let hardware_error = client.read_hardware_error(id)?;
    client.close();

    println!(
        "id={id} position={position} velocity={velocity} hardware_error=0x{hardware_error:02X}"
    );
    Ok(())
}

fn run_mode(port: &str, baud: u32, id: u8, mode: ModeArg) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    let mode = OperatingMode::from(mode);
    client.set_operating_mode(id, mode)?;
    client.close();

    println!("id={id} operating mode set to {mode:?}");
    Ok(())
}

fn run_move(port: &str, baud: u32, id: u8, position: u32) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    client.write_position(id, position)?;

    thread::sleep(Duration::from_millis(40));
    let present = client.read_position(id)?;
    client.close();

    println!("id={id} commanded_position={position} read_position={present}");
    Ok(())
}

fn run_spin(port: &str, baud: u32, args: SpinArgs) -> Result<(), Box<dyn std::error::Error>> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_in_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_in_handler.store(true, Ordering::Relaxed);
    })?;

    let mut client = open_client(port, baud)?;
    println!(
        "Spinning servo {} at velocity {} for {:.1}s (Ctrl-C stops early)",
        args.id, args.velocity, args.seconds
    );

    let outcome = spin_sequence(&mut client, &args, &stop);

    // the horn must stop and relax even when the sequence failed mid-way
    if let Err(err) = client.write_velocity(args.id, 0) {
        log::warn!("stop command failed for servo {}: {err}", args.id);
    }
    if let Err(err) = client.disable_torque(args.id) {
        log::warn!("torque release failed for servo {}: {err}", args.id);
    }
    client.close();

    outcome?;
    println!("Done.");
    Ok(())
}

fn spin_sequence(
    client: &mut BusClient,
    args: &SpinArgs,
    stop: &AtomicBool,
) -> Result<(), TransferError> {
    client.set_operating_mode(args.id, OperatingMode::Velocity)?;
    client.set_velocity_limit(args.id, args.limit)?;
    client.enable_torque(args.id)?;
    client.write_velocity(args.id, args.velocity)?;

    let start = Instant::now();
    let mut last_report = Instant::now();
    while start.elapsed().as_secs_f64() < args.seconds && !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(50));
        if last_report.elapsed() >= Duration::from_secs(1) {
            let velocity = client.read_velocity(args.id)?;
            println!("present velocity {velocity}");
            last_report = Instant::now();
        }
    }
    Ok(())
}

fn run_torque(
    port: &str,
    baud: u32,
    id: u8,
    state: SwitchState,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    match state {
        SwitchState::On => client.enable_torque(id)?,
        SwitchState::Off => client.disable_torque(id)?,
    }
    client.close();

    println!("id={id} torque {state:?}");
    Ok(())
}

fn run_led(
    port: &str,
    baud: u32,
    id: u8,
    state: SwitchState,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    client.set_led(id, state == SwitchState::On)?;
    client.close();

    println!("id={id} led {state:?}");
    Ok(())
}

fn run_reboot(port: &str, baud: u32, id: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = open_client(port, baud)?;
    client.transport.reboot(id)?;
    println!("id={id} reboot sent");

    thread::sleep(Duration::from_millis(500));
    match client.transport.ping(id) {
        Ok(info) => println!(
            "id={id} back online, model={} firmware={}",
            info.model_number, info.firmware
        ),
        Err(err) => log::warn!("servo {id} has not answered since the reboot: {err}"),
    }

    client.close();
    Ok(())
}

#[cfg(unix)]
fn run_vbus(args: VbusArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.first_servo_id > args.last_servo_id {
        return Err("first-servo-id must be <= last-servo-id".into());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_in_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_in_handler.store(true, Ordering::Relaxed);
    })?;

    let mut port = VirtualUartPort::new()?;
    let mut sim = DxlBusSim::new();
    for id in args.first_servo_id..=args.last_servo_id {
        sim.add_servo(id);
    }

    println!("Simulated servo bus running.");
    println!("Slave device: {}", port.slave_path());
    println!("Servo IDs: {}..={}", args.first_servo_id, args.last_servo_id);
    println!("Press Ctrl-C to stop.");

    let mut buffer: Vec<u8> = Vec::new();
    let mut last_step = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let mut incoming = port.read_port(512);
        let has_io = !incoming.is_empty();
        if has_io {
            buffer.append(&mut incoming);
            for request in frame::extract_frames(&mut buffer) {
                match sim.handle_frame(&request) {
                    Ok(Some(response)) => {
                        let _ = port.write_port(&response);
                    }
                    Ok(None) => {}
                    Err(err) => log::debug!("dropping unusable frame: {err}"),
                }
            }
        }

        let now = Instant::now();
        let dt = (now - last_step).as_secs_f64();
        if dt >= 0.005 {
            sim.step(dt);
            last_step = now;
        }

        if !has_io {
            thread::sleep(Duration::from_millis(2));
        }
    }

    println!("Stopped.");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .without_timestamps()
        .init()
        .unwrap();

    match args.command {
        #[cfg(unix)]
        Command::Vbus(vbus_args) => run_vbus(vbus_args),
        command => {
            let (port, auto_selected) = resolve_port(args.port, args.baud)?;
            if auto_selected {
                println!("Auto-selected serial port: {port}");
            }

            match command {
                Command::Scan { from, to } => run_scan(&port, args.baud, from, to),
                Command::Read { id } => run_read(&port, args.baud, id),
                Command::Mode { id, mode } => run_mode(&port, args.baud, id, mode),
                Command::Move { id, position } => run_move(&port, args.baud, id, position),
                Command::Spin(spin_args) => run_spin(&port, args.baud, spin_args),
                Command::Torque { id, state } => run_torque(&port, args.baud, id, state),
                Command::Led { id, state } => run_led(&port, args.baud, id, state),
                Command::Reboot { id } => run_reboot(&port, args.baud, id),
                #[cfg(unix)]
                Command::Vbus(_) => unreachable!(),
            }
        }
    }
}

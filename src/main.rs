// ThunderBorg command line tool
//
// Usage: thunderborg [--bus N]... [--address 0xNN] [--scan] [--simulate] <command>
// Example: thunderborg motor 1 0.5 --hold-ms 2000
//
// Every command connects, does its work and halts the motors on exit.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::time::{interval, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

use thunderborg::board::find_boards;
use thunderborg::config::{DEFAULT_ADDRESS, DEFAULT_BUSES};
use thunderborg::transport::SimulatedBoard;
use thunderborg::{BatteryLimits, BusAddress, DriverConfig, LedColor, MotorChannel, ThunderBorg, Transport};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "thunderborg", about = "Control a ThunderBorg motor board over I2C")]
struct Cli {
    /// Candidate I2C bus, tried in order (repeatable; default 1 then 0)
    #[arg(long = "bus", global = true)]
    buses: Vec<u8>,

    /// 7-bit board address, e.g. 0x15
    #[arg(long, global = true, value_parser = parse_address)]
    address: Option<u8>,

    /// Sweep the whole address range if the board is not at the expected address
    #[arg(long, global = true)]
    scan: bool,

    /// JSON driver configuration; command line flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-memory board instead of the I2C bus
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Find the board and report where it is
    Probe,
    /// List every ThunderBorg address on the candidate buses
    Find,
    /// Print a JSON status snapshot
    Status,
    /// Print the supply voltage
    Voltage,
    /// Switch both motors off
    Halt,
    /// Drive one motor, then halt
    Motor {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=2))]
        motor: u8,
        /// -1.0 (full reverse) to 1.0 (full forward)
        #[arg(allow_negative_numbers = true)]
        power: f32,
        /// How long to keep driving
        #[arg(long, default_value_t = 1000)]
        hold_ms: u64,
        /// Scale power for the measured battery voltage
        #[arg(long)]
        compensate: bool,
    },
    /// Set both on-board LEDs (components 0.0 to 1.0)
    Led { r: f32, g: f32, b: f32 },
    /// Show or set the LED battery display range
    Limits { minimum: Option<f32>, maximum: Option<f32> },
    /// Move the board to a new I2C address
    SetAddress {
        #[arg(value_parser = parse_address)]
        new_address: u8,
    },
}

fn parse_address(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", text, e))
}

fn load_config(cli: &Cli) -> CliResult<DriverConfig> {
    let mut config = match &cli.config {
        Some(path) => DriverConfig::from_json_file(path)?,
        None => DriverConfig::default(),
    };
    if !cli.buses.is_empty() {
        config.buses = cli.buses.clone();
    }
    if let Some(address) = cli.address {
        config.address = address;
    }
    config.allow_scan |= cli.scan;
    config.validate()?;
    Ok(config)
}

fn open_transport(simulate: bool) -> Box<dyn Transport> {
    if simulate {
        let mut sim = SimulatedBoard::new();
        for bus in DEFAULT_BUSES {
            sim = sim.with_board(BusAddress::new(bus, DEFAULT_ADDRESS));
        }
        return Box::new(sim);
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(thunderborg::transport::LinuxI2c::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No I2C support on this platform, using a simulated board");
        open_transport(true)
    }
}

fn channel(motor: u8) -> MotorChannel {
    match motor {
        2 => MotorChannel::Motor2,
        _ => MotorChannel::Motor1,
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = load_config(&cli)?;
    let mut transport = open_transport(cli.simulate);

    if let CliCommand::Find = cli.command {
        for &bus in &config.buses {
            for address in find_boards(&mut transport, bus) {
                println!("{}", BusAddress::new(bus, address));
            }
        }
        return Ok(());
    }

    let tb = ThunderBorg::connect(transport, config)?;

    match cli.command {
        // Answered before connecting
        CliCommand::Find => {}
        CliCommand::Probe => {
            let handle = tb.handle();
            println!("ThunderBorg at {} (ID 0x{:02X})", handle.location, handle.board_id);
        }
        CliCommand::Status => {
            println!("{}", serde_json::to_string_pretty(&tb.status()?)?);
        }
        CliCommand::Voltage => println!("{:.2} V", tb.read_voltage()?),
        CliCommand::Halt => tb.halt_all()?,
        CliCommand::Motor {
            motor,
            power,
            hold_ms,
            compensate,
        } => {
            let channel = channel(motor);
            let hold = Duration::from_millis(hold_ms);
            let deadline = Instant::now() + hold;
            // Re-send inside the watchdog timeout to keep the motor running
            let mut tick = interval(tb.config().watchdog_tick());

            info!(?channel, power, "Driving for {}ms", hold_ms);
            while Instant::now() < deadline {
                tick.tick().await;
                if compensate {
                    tb.set_motor_compensated(channel, power)?;
                } else {
                    tb.set_motor(channel, power)?;
                }
            }
            tb.halt_all()?;
        }
        CliCommand::Led { r, g, b } => tb.set_led(LedColor::new(r, g, b))?,
        CliCommand::Limits { minimum, maximum } => {
            if let (Some(minimum), Some(maximum)) = (minimum, maximum) {
                tb.set_battery_limits(BatteryLimits { minimum, maximum })?;
            }
            let limits = tb.battery_limits()?;
            println!("{:.2} V to {:.2} V", limits.minimum, limits.maximum);
        }
        CliCommand::SetAddress { new_address } => {
            let handle = tb.set_i2c_address(new_address)?;
            println!("ThunderBorg now at {}", handle.location);
        }
    }

    tb.disconnect()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

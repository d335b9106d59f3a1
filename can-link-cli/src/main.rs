//! CAN Link CLI Application
//!
//! Command-line front end for the can-link library:
//! - `inspect`: load a DBC and print its messages and signal layouts
//! - `record`: decode live traffic to JSON lines until Ctrl-C
//! - `send`: pack one message from signal values and write it
//! - `disable-ecu`: silence the EyeSight camera ECU over ISO-TP

use anyhow::{bail, Context, Result};
use can_link::{
    CanClient, DatabaseSchema, DeviceConfig, DeviceMode, LinuxSocketOps, Message, MessageSchema,
    SocketCanDevice,
};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod config;

use config::AppConfig;

/// CAN Link - Talk to a CAN bus through a DBC
#[derive(Parser, Debug)]
#[command(name = "can-link-cli")]
#[command(about = "Decode, record and send CAN messages over SocketCAN", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Path to DBC file (overrides the config file)
    #[arg(long, value_name = "FILE", global = true)]
    dbc: Option<PathBuf>,

    /// CAN interface (overrides the config file)
    #[arg(short, long, value_name = "IFACE", global = true)]
    interface: Option<String>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the messages and signals of a DBC
    Inspect {
        /// Show the signal layout of one message
        #[arg(short, long, value_name = "NAME")]
        message: Option<String>,
    },

    /// Decode bus traffic to JSON lines until interrupted
    Record {
        /// Output file (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Also write frames with no schema
        #[arg(long)]
        raw: bool,

        /// Stop after this many seconds
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },

    /// Send one message built from SIGNAL=VALUE pairs
    Send {
        /// Message name from the DBC
        message: String,

        /// Physical signal values, e.g. LKAS_Output=-120
        #[arg(value_name = "SIGNAL=VALUE")]
        signals: Vec<String>,

        /// Number of times to send
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between repeats
        #[arg(long, value_name = "MS", default_value_t = 20)]
        interval_ms: u64,
    },

    /// Put the EyeSight ECU in the extended session and disable it
    DisableEcu {
        /// Number of handshake attempts
        #[arg(long)]
        retries: Option<u32>,

        /// Response timeout per attempt
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Link CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using can-link library v{}", can_link::VERSION);

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    if let Some(interface) = &args.interface {
        config.device.interface = interface.clone();
    }

    match &args.command {
        Command::Inspect { message } => inspect(&args, &config, message.as_deref()),
        Command::Record {
            output,
            raw,
            duration,
        } => record(&args, &config, output.clone(), *raw, duration.map(Duration::from_secs)),
        Command::Send {
            message,
            signals,
            repeat,
            interval_ms,
        } => send(&args, &config, message, signals, *repeat, Duration::from_millis(*interval_ms)),
        Command::DisableEcu {
            retries,
            timeout_ms,
        } => disable_ecu(&config, *retries, *timeout_ms),
    }
}

fn load_database(args: &Args, config: &AppConfig) -> Result<DatabaseSchema> {
    let path = args
        .dbc
        .as_ref()
        .or(config.database.dbc.as_ref())
        .context("No DBC file given (use --dbc or [database] dbc in the config)")?;
    DatabaseSchema::from_file(path, &config.database.options)
        .with_context(|| format!("Failed to load DBC: {:?}", path))
}

fn open_client(args: &Args, config: &AppConfig) -> Result<CanClient<SocketCanDevice>> {
    let database = load_database(args, config)?;
    let device = SocketCanDevice::open_with_config(config.device.clone(), Arc::new(LinuxSocketOps::new()))
        .with_context(|| format!("Failed to open {}", config.device.interface))?;
    Ok(CanClient::with_config(device, Arc::new(database), config.client.clone()))
}

/// Print database statistics and either the message list or one message
fn inspect(args: &Args, config: &AppConfig, message: Option<&str>) -> Result<()> {
    let database = load_database(args, config)?;

    println!("═══════════════════════════════════════════════");
    println!("  CAN Link - Signal Database");
    println!("═══════════════════════════════════════════════\n");

    let stats = database.stats();
    println!("  Messages:           {}", stats.num_messages);
    println!("  Signals:            {}", stats.num_signals);
    println!("  Value descriptions: {}", stats.num_value_descriptions);
    println!("  Counters:           {}", stats.num_counters);
    println!("  Checksums:          {}\n", stats.num_checksums);

    match message {
        Some(name) => {
            let schema = database
                .message_by_name(name)
                .with_context(|| format!("Message {} not found in DBC", name))?;
            print_signals(schema);
        }
        None => {
            for schema in database.messages() {
                println!(
                    "  0x{:03X}  {:<32} {:>2} bytes  {:>3} signals",
                    schema.address(),
                    schema.name(),
                    schema.size(),
                    schema.signals().len()
                );
            }
        }
    }
    Ok(())
}

fn print_signals(schema: &MessageSchema) {
    println!(
        "{} (0x{:X}, {} bytes, sent by {})",
        schema.name(),
        schema.address(),
        schema.size(),
        schema.transmitter().unwrap_or("-")
    );
    println!("───────────────────────────────────────────────");
    for signal in schema.signals() {
        println!(
            "  {:<28} {:>3}|{:<2}@{}{}  ({},{})  [{}|{}] {:?}{}",
            signal.name,
            signal.start_bit,
            signal.size,
            if signal.little_endian { 1 } else { 0 },
            if signal.is_signed { '-' } else { '+' },
            signal.factor,
            signal.offset,
            signal.min,
            signal.max,
            signal.unit,
            if signal.is_counter() {
                "  COUNTER"
            } else if signal.is_checksum() {
                "  CHECKSUM"
            } else {
                ""
            }
        );
        if let Some(vd) = &signal.value_description {
            for (raw, label) in &vd.labels {
                println!("      {} = {}", raw, label);
            }
        }
    }
}

/// One line of `record` output
#[derive(Serialize)]
struct RecordLine<'a> {
    timestamp: DateTime<Local>,
    #[serde(flatten)]
    message: &'a Message,
}

/// One undecoded frame of `record --raw` output
#[derive(Serialize)]
struct RawLine {
    timestamp: DateTime<Local>,
    address: u32,
    data: String,
}

fn record(
    args: &Args,
    config: &AppConfig,
    output: Option<PathBuf>,
    raw: bool,
    duration: Option<Duration>,
) -> Result<()> {
    let client = open_client(args, config)?;
    let include_raw = raw || config.record.include_raw;

    let output = output.or_else(|| config.record.output.clone());
    let mut writer: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;
    }

    log::info!("Recording from {} (Ctrl-C to stop)", config.device.interface);
    let start = Instant::now();
    let mut last_flush = Instant::now();
    let mut written = 0usize;

    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| start.elapsed() >= limit) {
            break;
        }
        if !client.enqueue_messages() {
            std::thread::sleep(config.record.idle_sleep());
        }
        if last_flush.elapsed() >= config.record.flush_interval() {
            written += write_queued(&client, &mut writer, include_raw)?;
            last_flush = Instant::now();
        }
    }

    // Drain whatever arrived since the last flush
    written += write_queued(&client, &mut writer, include_raw)?;
    writer.flush()?;
    log::info!("Recorded {} lines", written);
    Ok(())
}

fn write_queued(
    client: &CanClient<SocketCanDevice>,
    writer: &mut dyn Write,
    include_raw: bool,
) -> Result<usize> {
    let now = Local::now();
    let messages = client.get_queued_messages_and_clear_queue();
    let frames = client.get_raw_data_and_clear_queue();
    let mut lines = 0;

    for message in &messages {
        serde_json::to_writer(&mut *writer, &RecordLine { timestamp: now, message })?;
        writeln!(writer)?;
        lines += 1;
    }

    if include_raw {
        let database = client.database();
        for frame in frames.iter().filter(|f| database.message_by_address(f.address()).is_none()) {
            let line = RawLine {
                timestamp: now,
                address: frame.address(),
                data: hex::encode_upper(frame.data()),
            };
            serde_json::to_writer(&mut *writer, &line)?;
            writeln!(writer)?;
            lines += 1;
        }
    }
    Ok(lines)
}

fn send(
    args: &Args,
    config: &AppConfig,
    name: &str,
    assignments: &[String],
    repeat: u32,
    interval: Duration,
) -> Result<()> {
    let values = parse_assignments(assignments)?;
    let client = open_client(args, config)?;
    let message = client
        .create_message(name, &values)
        .with_context(|| format!("Message {} not found in DBC", name))?;

    for key in values.keys() {
        if message.signal(key).is_none() {
            log::warn!("{} has no signal {}, ignoring it", name, key);
        }
    }

    for i in 0..repeat {
        if i > 0 {
            std::thread::sleep(interval);
        }
        let payload = client
            .send_message(&message)
            .with_context(|| format!("Failed to send {}", name))?;
        println!("{} 0x{:X} {}", name, message.address, hex::encode_upper(&payload));
    }
    Ok(())
}

/// Parse `SIGNAL=VALUE` pairs
fn parse_assignments(assignments: &[String]) -> Result<HashMap<String, f64>> {
    let mut values = HashMap::new();
    for assignment in assignments {
        let Some((signal, value)) = assignment.split_once('=') else {
            bail!("Expected SIGNAL=VALUE, got {:?}", assignment);
        };
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", signal, value))?;
        values.insert(signal.trim().to_string(), value);
    }
    Ok(values)
}

fn disable_ecu(config: &AppConfig, retries: Option<u32>, timeout_ms: Option<u64>) -> Result<()> {
    let diagnostics = &config.diagnostics;
    let interface = diagnostics
        .interface
        .clone()
        .unwrap_or_else(|| config.device.interface.clone());
    let device_config = DeviceConfig::new(interface.clone()).with_mode(DeviceMode::IsoTp {
        rx_id: diagnostics.rx_id,
        tx_id: diagnostics.tx_id,
    });

    let device = SocketCanDevice::open_with_config(device_config, Arc::new(LinuxSocketOps::new()))
        .with_context(|| format!("Failed to open ISO-TP socket on {}", interface))?;

    let retries = retries.unwrap_or(diagnostics.retries);
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(diagnostics.timeout_ms));
    device
        .disable_ecu(retries, timeout)
        .with_context(|| format!("Failed to disable ECU on {}", interface))?;

    println!("ECU communication disabled on {}", interface);
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

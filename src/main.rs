// src/main.rs
//
// groundlink command line.
//
//   groundlink listen [--port P] [--baud B] ...    receive telemetry until Ctrl-C
//   groundlink decode <LINE>... [--json]           decode modem lines (stdin when none given)
//   groundlink decode-b64 <BASE64>                 decode a bare payload
//   groundlink encode --address A ... <READING>... build a modem line from readings
//   groundlink ports                               list serial ports

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use groundlink_lib::link::{LinkSession, TelemetrySink};
use groundlink_lib::logging::{init_file_logging, stop_file_logging};
use groundlink_lib::settings::LinkSettings;
use groundlink_lib::sinks::{format_frame, format_reading, ConsoleSink, CsvSink};
use groundlink_lib::telemetry::{
    decode_payload, decode_records, reading_from_values, schema, FrameDecoder,
};
use groundlink_lib::{list_serial_ports, tlog};

#[derive(Debug, Parser)]
#[command(
    name = "groundlink",
    version,
    about = "Ground-station receiver for LoRa rocket telemetry",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Receive telemetry from the modem until Ctrl-C
    Listen {
        /// Serial port of the modem (overrides the settings file)
        #[arg(long)]
        port: Option<String>,

        /// Baud rate (overrides the settings file)
        #[arg(long)]
        baud: Option<u32>,

        /// Settings file [default: <config dir>/groundlink/settings.toml]
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Directory for flight CSV logs (overrides the settings file)
        #[arg(long, value_name = "DIR")]
        csv_dir: Option<PathBuf>,

        /// Do not write a flight CSV log
        #[arg(long)]
        no_csv: bool,

        /// Mirror the console log into a file in this directory
        #[arg(long, value_name = "DIR")]
        log_dir: Option<PathBuf>,

        /// Also print lines that are not telemetry reports
        #[arg(long)]
        show_noise: bool,
    },

    /// Decode modem lines. Reads stdin when no lines are given.
    Decode {
        lines: Vec<String>,

        /// Print frames as JSON
        #[arg(long)]
        json: bool,

        /// Report marker
        #[arg(long, default_value = groundlink_lib::telemetry::DEFAULT_MARKER)]
        marker: String,
    },

    /// Decode a bare base64 payload into sensor readings
    #[command(name = "decode-b64")]
    DecodeB64 { payload: String },

    /// Build a modem line from sensor readings.
    /// Each READING is `<sensor_id>:<v1>,<v2>,...` (e.g. `0:1200.5,1013.2`, `5:2`, `5:APOGEE`, `6`).
    Encode {
        #[arg(long, default_value = "1")]
        address: String,

        #[arg(long, default_value_t = -40, allow_hyphen_values = true)]
        rssi: i32,

        #[arg(long, default_value_t = 10.0, allow_hyphen_values = true)]
        snr: f32,

        #[arg(required = true)]
        readings: Vec<String>,
    },

    /// List serial ports
    Ports,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Listen {
            port,
            baud,
            config,
            csv_dir,
            no_csv,
            log_dir,
            show_noise,
        } => {
            let config_path = config.or_else(LinkSettings::default_path);
            let mut settings = match &config_path {
                Some(path) => LinkSettings::load_or_default(path)?,
                None => LinkSettings::default(),
            };
            if port.is_some() {
                settings.port = port;
            }
            if let Some(baud) = baud {
                settings.baud_rate = baud;
            }
            if let Some(dir) = csv_dir {
                settings.csv_dir = dir;
            }
            if log_dir.is_some() {
                settings.log_dir = log_dir;
            }
            listen(settings, !no_csv, show_noise)
        }
        Command::Decode {
            lines,
            json,
            marker,
        } => decode(FrameDecoder::new(marker), lines, json),
        Command::DecodeB64 { payload } => decode_b64(&payload),
        Command::Encode {
            address,
            rssi,
            snr,
            readings,
        } => encode(&address, rssi, snr, &readings),
        Command::Ports => ports(),
    }
}

fn listen(mut settings: LinkSettings, write_csv: bool, show_noise: bool) -> Result<()> {
    if let Some(dir) = &settings.log_dir {
        init_file_logging(dir)
            .with_context(|| format!("failed to start file logging in {}", dir.display()))?;
    }

    if settings.port.is_none() {
        settings.port = Some(pick_port()?);
    }

    let mut sinks: Vec<Box<dyn TelemetrySink>> =
        vec![Box::new(ConsoleSink::new().with_noise(show_noise))];
    if write_csv {
        let sink = CsvSink::create(&settings.csv_dir)
            .with_context(|| format!("failed to create flight log in {}", settings.csv_dir.display()))?;
        sinks.push(Box::new(sink));
    }

    let mut session = LinkSession::open_serial(settings.session_options(), Box::new(sinks))?;
    tlog!("[main] Listening, press Ctrl-C to stop");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to wait for Ctrl-C")?;

    tlog!("[main] Stopping");
    session.stop();
    let stats = session.stats();
    tlog!(
        "[main] {} frames decoded, {} rejected, {} rejections dropped",
        stats.frames_decoded,
        stats.frames_rejected,
        stats.rejections_dropped
    );
    stop_file_logging();
    Ok(())
}

/// Use the only serial port present; with zero or several, ask for --port
fn pick_port() -> Result<String> {
    let ports = list_serial_ports()?;
    match ports.as_slice() {
        [only] => {
            tlog!("[main] Using {} (only serial port found)", only.port_name);
            Ok(only.port_name.clone())
        }
        [] => bail!("no serial ports found; connect the modem or pass --port"),
        _ => {
            let names: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
            bail!("several serial ports found ({}); choose one with --port", names.join(", "))
        }
    }
}

fn decode(decoder: FrameDecoder, lines: Vec<String>, json: bool) -> Result<()> {
    let lines = if lines.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read stdin")?
    } else {
        lines
    };

    let mut failures = 0usize;
    for line in lines.iter().filter(|l| !l.trim().is_empty()) {
        match decoder.decode_line(line) {
            Ok(frame) if json => println!("{}", serde_json::to_string_pretty(&frame)?),
            Ok(frame) => {
                println!("{}", format_frame(&frame));
                for reading in &frame.readings {
                    println!("  {}", format_reading(reading));
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("error: {}: {}", e, line);
            }
        }
    }

    if failures > 0 {
        bail!("{} line(s) failed to decode", failures);
    }
    Ok(())
}

fn decode_b64(payload: &str) -> Result<()> {
    let bytes = decode_payload(payload)?;
    println!("{} bytes: {}", bytes.len(), hex::encode(&bytes));
    for reading in decode_records(&bytes)? {
        println!("  {}", format_reading(&reading));
    }
    Ok(())
}

fn encode(address: &str, rssi: i32, snr: f32, readings: &[String]) -> Result<()> {
    let readings = readings
        .iter()
        .map(|arg| parse_reading_arg(arg))
        .collect::<Result<Vec<_>>>()?;
    let line = FrameDecoder::default().encode_line(address, &readings, rssi, snr)?;
    println!("{}", line);
    Ok(())
}

/// `<sensor_id>[:<v1>,<v2>,...]`
fn parse_reading_arg(arg: &str) -> Result<groundlink_lib::SensorReading> {
    let (id, values) = arg.split_once(':').unwrap_or((arg, ""));
    let sensor_id: u8 = id
        .trim()
        .parse()
        .with_context(|| format!("invalid sensor id in '{}'", arg))?;
    // Enum sensors also accept their label, e.g. `5:APOGEE`
    if let Some(byte) = schema::lookup(sensor_id).and_then(|s| s.encoding.byte_for_label(values.trim())) {
        return Ok(reading_from_values(sensor_id, &[byte as f32])?);
    }
    let values = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<f32>().with_context(|| format!("invalid value '{}' in '{}'", v, arg)))
        .collect::<Result<Vec<_>>>()?;
    Ok(reading_from_values(sensor_id, &values)?)
}

fn ports() -> Result<()> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for port in ports {
        let mut line = format!("{:<24} {}", port.port_name, port.port_type);
        if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            line.push_str(&format!(" {:04x}:{:04x}", vid, pid));
        }
        if let Some(product) = port.product.or(port.manufacturer) {
            line.push_str(&format!(" {}", product));
        }
        println!("{}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["groundlink", "listen", "--port", "/dev/ttyUSB0", "--no-csv"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Listen { port: Some(ref p), no_csv: true, .. } if p == "/dev/ttyUSB0"
        ));

        let cli = Cli::try_parse_from(["groundlink", "encode", "--rssi", "-70", "0:1,2"]).unwrap();
        assert!(matches!(cli.command, Command::Encode { rssi: -70, .. }));

        let cli = Cli::try_parse_from(["groundlink", "decode-b64", "BQI="]).unwrap();
        assert!(matches!(cli.command, Command::DecodeB64 { .. }));
    }

    #[test]
    fn test_parse_reading_arg() {
        let reading = parse_reading_arg("0:1200.5, 1013.25").unwrap();
        assert_eq!(reading.sensor_name, "Barometer");
        assert_eq!(reading.raw_values, vec![1200.5, 1013.25]);

        let state = parse_reading_arg("5:2").unwrap();
        assert_eq!(state.enum_label.as_deref(), Some("BOOST"));

        let apogee = parse_reading_arg("5:APOGEE").unwrap();
        assert_eq!(apogee.raw_values, vec![5.0]);

        let time = parse_reading_arg("6").unwrap();
        assert!(time.fields.is_empty());

        assert!(parse_reading_arg("x:1").is_err());
        assert!(parse_reading_arg("0:1").is_err());
        assert!(parse_reading_arg("2:north").is_err());
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::extensions::option::OptionExt;
use crate::hardware::uart::DEFAULT_UART_BASE;
use crate::midi::model::{Channel, DataByte};
use crate::midi::registry::model::RegistryLayout;

const DEFAULT_MIDI_DEVICE: &str = "/dev/ttyAMA0";
const DEFAULT_RUMBA_DEVICE: &str = "/dev/ttyACM0";
const DEFAULT_CSV: &str = "csv/default.csv";
const DEFAULT_UPLOAD_CSV: &str = "csv/upload.csv";
const DEFAULT_LISTEN: &str = "0.0.0.0:80";
const DEFAULT_BASE_OFFSET: u8 = 36;
const DEFAULT_CAPACITY: usize = 32;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SSE_INTERVAL_SECS: u64 = 10;
const DEFAULT_QUEUE_DEPTH: usize = 64;

// CLI specific configuration

#[derive(Debug, Default, Parser)]
#[command(name = "midipump", about = "Drives solenoid pumps over a MIDI serial link")]
pub struct Args {
    /// YAML settings file; flags given here take precedence over it.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub midi_device: Option<String>,
    #[arg(long)]
    pub rumba_device: Option<String>,
    /// Log MIDI and RUMBA traffic instead of touching hardware.
    #[arg(long)]
    pub emulate: bool,
    /// Pump table loaded at startup.
    #[arg(long)]
    pub csv: Option<PathBuf>,
    /// Pump table written by uploads and reloaded after stop-all.
    #[arg(long)]
    pub upload_csv: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// MIDI note of pump 0.
    #[arg(long)]
    pub base_offset: Option<u8>,
    #[arg(long)]
    pub capacity: Option<usize>,
    #[arg(long)]
    pub channel: Option<u8>,
    /// Physical address of the MIDI UART registers, e.g. 0x3f201000.
    #[arg(long, value_parser = parse_address)]
    pub uart_base: Option<u64>,
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,
    #[arg(long)]
    pub sse_interval_secs: Option<u64>,
    #[arg(long)]
    pub queue_depth: Option<usize>,
}

fn parse_address(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address {raw:?}: {e}"))
}

// YAML specific configuration

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub midi_device: Option<String>,
    pub rumba_device: Option<String>,
    pub emulate: Option<bool>,
    pub csv: Option<PathBuf>,
    pub upload_csv: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    pub base_offset: Option<u8>,
    pub capacity: Option<usize>,
    pub channel: Option<Channel>,
    pub uart_base: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub sse_interval_secs: Option<u64>,
    pub queue_depth: Option<usize>,
}

pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Settings> {
    let conf_file = std::fs::File::open(path)?;
    Ok(serde_yaml::from_reader(conf_file)?)
}

// Resolved configuration used by the application

#[derive(Debug, Clone)]
pub struct Config {
    pub midi_device: String,
    pub rumba_device: String,
    pub emulate: bool,
    pub csv: PathBuf,
    pub upload_csv: PathBuf,
    pub listen: SocketAddr,
    pub note_base: DataByte,
    pub layout: RegistryLayout,
    pub uart_base: u64,
    pub read_timeout: Duration,
    pub sse_interval: Duration,
    pub queue_depth: usize,
}

impl Config {
    pub fn load(args: Args) -> anyhow::Result<Config> {
        let settings = match &args.config {
            Some(path) => load_from_yaml(path)
                .with_context(|| format!("reading settings from {}", path.display()))?,
            None => Settings::default(),
        };
        Config::resolve(args, settings)
    }

    /// Flag, then settings file, then built-in default.
    pub fn resolve(args: Args, settings: Settings) -> anyhow::Result<Config> {
        let base_offset = args
            .base_offset
            .or(settings.base_offset)
            .unwrap_or(DEFAULT_BASE_OFFSET);
        let note_base = DataByte::from_u8(base_offset)
            .to_result(|| anyhow::anyhow!("base offset {base_offset} is not a MIDI note"))?;

        let channel = match args.channel {
            Some(raw) => Channel::from_u8(raw)
                .to_result(|| anyhow::anyhow!("channel {raw} is outside 0..=15"))?,
            None => settings.channel.unwrap_or_default(),
        };

        let capacity = args
            .capacity
            .or(settings.capacity)
            .unwrap_or(DEFAULT_CAPACITY);
        anyhow::ensure!(capacity > 0, "pump capacity must be at least 1");

        let listen = match args.listen.or(settings.listen) {
            Some(listen) => listen,
            None => DEFAULT_LISTEN.parse()?,
        };

        Ok(Config {
            midi_device: args
                .midi_device
                .or(settings.midi_device)
                .unwrap_or_else(|| DEFAULT_MIDI_DEVICE.to_string()),
            rumba_device: args
                .rumba_device
                .or(settings.rumba_device)
                .unwrap_or_else(|| DEFAULT_RUMBA_DEVICE.to_string()),
            emulate: args.emulate || settings.emulate.unwrap_or(false),
            csv: args
                .csv
                .or(settings.csv)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CSV)),
            upload_csv: args
                .upload_csv
                .or(settings.upload_csv)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_CSV)),
            listen,
            note_base,
            layout: RegistryLayout {
                base_offset,
                capacity,
                channel,
            },
            uart_base: args
                .uart_base
                .or(settings.uart_base)
                .unwrap_or(DEFAULT_UART_BASE),
            read_timeout: Duration::from_millis(
                args.read_timeout_ms
                    .or(settings.read_timeout_ms)
                    .unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            sse_interval: Duration::from_secs(
                args.sse_interval_secs
                    .or(settings.sse_interval_secs)
                    .unwrap_or(DEFAULT_SSE_INTERVAL_SECS)
                    .max(1),
            ),
            queue_depth: args
                .queue_depth
                .or(settings.queue_depth)
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_current_hardware() {
        let config = Config::resolve(Args::default(), Settings::default()).unwrap();
        assert_eq!(config.midi_device, "/dev/ttyAMA0");
        assert_eq!(config.note_base.as_u8(), 36);
        assert_eq!(config.layout.capacity, 32);
        assert_eq!(config.layout.channel.as_u8(), 0);
        assert_eq!(config.uart_base, 0x2020_1000);
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert!(!config.emulate);
    }

    #[test]
    fn flags_override_settings_file() {
        let settings: Settings = serde_yaml::from_str(
            "midi_device: /dev/ttyS0\nbase_offset: 35\ncapacity: 64\nchannel: 2\nemulate: true\n",
        )
        .unwrap();
        let args = Args::parse_from(["midipump", "--base-offset", "36", "--uart-base", "0x3f201000"]);

        let config = Config::resolve(args, settings).unwrap();
        assert_eq!(config.midi_device, "/dev/ttyS0");
        assert_eq!(config.note_base.as_u8(), 36);
        assert_eq!(config.layout.capacity, 64);
        assert_eq!(config.layout.channel.as_u8(), 2);
        assert_eq!(config.uart_base, 0x3f20_1000);
        assert!(config.emulate);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let args = Args::parse_from(["midipump", "--base-offset", "128"]);
        assert!(Config::resolve(args, Settings::default()).is_err());

        let args = Args::parse_from(["midipump", "--channel", "16"]);
        assert!(Config::resolve(args, Settings::default()).is_err());

        assert!(serde_yaml::from_str::<Settings>("channel: 16\n").is_err());
        assert!(serde_yaml::from_str::<Settings>("pumps: 3\n").is_err());
    }
}

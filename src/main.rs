mod configuration;
mod context;
mod extensions;
mod frontend;
mod hardware;
mod midi;
mod rumba;
mod scheduler;
mod worker;

use std::sync::Arc;

use clap::Parser;

use crate::configuration::{Args, Config};
use crate::context::{AppContext, HealthMonitor, TransportState};
use crate::hardware::uart::Pl011Configurator;
use crate::midi::controller::serial::SerialTransport;
use crate::midi::controller::EmulateFlag;
use crate::midi::registry::shared::SharedRegistry;
use crate::midi::registry::source::CsvFile;
use crate::rumba::RumbaLink;
use crate::scheduler::PumpScheduler;
use crate::worker::{MidiOut, OutputSetup};

fn open_link(config: &Config, path: &str, emulate: &EmulateFlag) -> Result<SerialTransport, String> {
    if config.emulate {
        return Ok(SerialTransport::detached(path, emulate.clone()));
    }
    SerialTransport::open(path, config.read_timeout, emulate.clone()).map_err(|e| {
        log::error!("could not open serial port {path}: {e}");
        e.to_string()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load(Args::parse())?;
    let emulate = EmulateFlag::new(config.emulate);
    let health = HealthMonitor::default();

    // Pump table first; a broken startup table leaves the registry empty.
    let registry = SharedRegistry::new(config.layout);
    if let Err(e) = registry.reload(&CsvFile::new(&config.csv)).await {
        log::error!("error reading csv file {}: {e}", config.csv.display());
    }
    if registry.current().is_empty() {
        log::warn!("no pumps loaded, waiting for an upload");
    }

    let (scheduler, queue) = PumpScheduler::make(
        registry,
        Arc::new(CsvFile::new(&config.upload_csv)),
        health.clone(),
        config.queue_depth,
    );

    // MIDI output keeps running without a device; emulate is the way out.
    let midi_link = match open_link(&config, &config.midi_device, &emulate) {
        Ok(link) => {
            health.record_transport(if link.is_open() {
                TransportState::Open
            } else {
                TransportState::Emulated
            });
            link
        }
        Err(reason) => {
            health.record_transport(TransportState::Failed(reason));
            SerialTransport::detached(&config.midi_device, emulate.clone())
        }
    };
    let midi_out = MidiOut::start(
        midi_link,
        Box::new(Pl011Configurator::new(config.uart_base)),
        queue,
        OutputSetup {
            note_base: config.note_base,
            emulate: emulate.clone(),
            health: health.clone(),
        },
    );

    let rumba = open_link(&config, &config.rumba_device, &emulate)
        .ok()
        .map(RumbaLink::start);

    let ctx = Arc::new(AppContext {
        scheduler,
        emulate,
        health,
        upload_csv: config.upload_csv.clone(),
        rumba,
        sse_interval: config.sse_interval,
    });

    let server = frontend::start(config.listen, ctx).await?;

    tokio::select! {
        _ = server => log::error!("http front end stopped"),
        _ = midi_out.0 => log::error!("midi output stopped"),
        _ = tokio::signal::ctrl_c() => log::info!("shutting down"),
    }

    Ok(())
}

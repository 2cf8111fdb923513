use tokio::task::spawn_blocking;
use tokio::task::JoinHandle;

use crate::context::{HealthMonitor, UartState};
use crate::hardware::BaudRateConfigurator;
use crate::midi::controller::{EmulateFlag, SerialWriter};
use crate::midi::model::{encode, reset_frames, DataByte};
use crate::scheduler::{EventsQueue, NoteEvent, OutputEvent};

pub type WorkerConfigurator = Box<dyn BaudRateConfigurator + Send + Sync + 'static>;

pub struct OutputSetup {
    pub note_base: DataByte,
    pub emulate: EmulateFlag,
    pub health: HealthMonitor,
}

/// MidiOut holds the only thread allowed to write to the MIDI link. Device
/// access blocks, so it runs on the blocking pool, not a runtime worker.
pub struct MidiOut(pub JoinHandle<()>);

impl MidiOut {
    pub fn start<W>(
        mut writer: W,
        configurator: WorkerConfigurator,
        events: EventsQueue,
        setup: OutputSetup,
    ) -> MidiOut
    where
        W: SerialWriter + Send + 'static,
    {
        MidiOut(spawn_blocking(move || {
            let health = setup.health;

            if setup.emulate.is_enabled() {
                health.record_uart(UartState::Skipped);
            } else {
                match configurator.configure_baud_rate() {
                    Ok(()) => health.record_uart(UartState::Configured),
                    Err(e) => {
                        log::error!("midi baud rate left at hardware default: {e}");
                        health.record_uart(UartState::Failed(e.to_string()));
                    }
                }
                for frame in reset_frames(setup.note_base) {
                    write_logged(&mut writer, &frame, &health);
                }
            }

            while let Ok(event) = events.0.recv_blocking() {
                match event {
                    OutputEvent::Note(note) => {
                        let bytes: [u8; 3] = encode(&note.note, note.turning_on).into();
                        log_note(&note, &bytes, setup.emulate.is_enabled());
                        write_logged(&mut writer, &bytes, &health);
                    }
                    OutputEvent::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::info!("midi output stopped");
        }))
    }
}

// The only record per note; an emulating transport stays silent.
fn log_note(event: &NoteEvent, bytes: &[u8], emulated: bool) {
    log::info!(
        "{}note {:02} {} \tduration {} ms{}",
        if emulated { "emulate: " } else { "" },
        event.note.pitch.as_u8(),
        if event.turning_on { "on" } else { "off" },
        event.note.duration.as_millis(),
        if emulated {
            format!(", would write {bytes:02x?}")
        } else {
            String::new()
        }
    );
}

// Not retried: the pump state stays as if the bytes went out.
fn write_logged<W: SerialWriter>(writer: &mut W, bytes: &[u8], health: &HealthMonitor) {
    match writer.write(bytes) {
        Ok(()) => health.record_write(),
        Err(e) => {
            log::error!("could not write to midi link: {e}");
            health.record_write_error(e.to_string());
        }
    }
}

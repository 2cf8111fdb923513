use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::context::{HealthMonitor, ReloadState};
use crate::extensions::option::OptionExt;
use crate::midi::registry::model::{LoadError, Note, PumpRegistry, PumpStatus};
use crate::midi::registry::shared::SharedRegistry;
use crate::midi::registry::source::PumpSource;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("No pump with id {0}")]
    UnknownPump(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteEvent {
    pub note: Note,
    pub turning_on: bool,
}

#[derive(Debug)]
pub enum OutputEvent {
    Note(NoteEvent),
    /// Answered once every event queued before it has been written.
    Flush(oneshot::Sender<()>),
}

/// Consumer end of the fan-in channel. Exactly one worker drains it.
pub struct EventsQueue(pub Receiver<OutputEvent>);

pub struct PumpScheduler {
    registry: SharedRegistry,
    events: Sender<OutputEvent>,
    refresh: Arc<dyn PumpSource>,
    cancel: watch::Sender<u64>,
    health: HealthMonitor,
}

impl PumpScheduler {
    /// `refresh` is the table reloaded after a stop-all and on upload.
    pub fn make(
        registry: SharedRegistry,
        refresh: Arc<dyn PumpSource>,
        health: HealthMonitor,
        queue_depth: usize,
    ) -> (PumpScheduler, EventsQueue) {
        let (events, receiver) = bounded(queue_depth.max(1));
        let (cancel, _) = watch::channel(0);
        let scheduler = PumpScheduler {
            registry,
            events,
            refresh,
            cancel,
            health,
        };
        (scheduler, EventsQueue(receiver))
    }

    /// Plays every pump of the current table concurrently and returns once
    /// every "off" has been written.
    pub async fn trigger_all(&self) -> usize {
        let registry = self.registry.current();
        let activations: Vec<JoinHandle<()>> = (0..registry.len())
            .map(|index| {
                tokio::spawn(activate(
                    registry.clone(),
                    index,
                    self.events.clone(),
                    self.cancel.subscribe(),
                ))
            })
            .collect();

        let mut completed = 0;
        for activation in activations {
            match activation.await {
                Ok(()) => completed += 1,
                Err(e) => log::error!("pump activation failed: {e}"),
            }
        }
        self.flush().await;
        completed
    }

    pub async fn trigger_all_start(&self) -> usize {
        let registry = self.registry.current();
        for pump in registry.pumps() {
            pump.claim();
            send(&self.events, pump.note, true).await;
        }
        registry.len()
    }

    /// Closes every pump, then refreshes the table from the upload file.
    pub async fn trigger_all_stop(&self) -> Result<usize, LoadError> {
        let registry = self.registry.current();
        for pump in registry.pumps() {
            send(&self.events, pump.note, false).await;
            pump.force_inactive();
        }
        self.flush().await;
        self.reload().await
    }

    /// Opens one pump and returns without waiting for it.
    pub async fn trigger_single(&self, id: u32) -> Result<(), SchedulerError> {
        let registry = self.registry.current();
        let pump = registry
            .find(id)
            .to_result(|| SchedulerError::UnknownPump(id))?;
        pump.claim();
        send(&self.events, pump.note, true).await;
        Ok(())
    }

    /// Wakes every running activation so it closes its pump now.
    pub fn cancel(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
        log::info!("cancelled running pump activations");
    }

    pub async fn reload(&self) -> Result<usize, LoadError> {
        match self.registry.reload(self.refresh.as_ref()).await {
            Ok(pumps) => {
                self.health.record_reload(ReloadState::Loaded { pumps });
                Ok(pumps)
            }
            Err(e) => {
                log::error!("error reading pump table {}: {e}", self.refresh.describe());
                self.health.record_reload(ReloadState::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> Vec<PumpStatus> {
        self.registry.snapshot()
    }

    /// Waits until the output worker has written everything queued so far.
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.events.send(OutputEvent::Flush(done)).await.is_ok() {
            let _ = written.await;
        }
    }
}

/// One pump activation: on, hold for the pump's duration, off. The task
/// keeps the table it was started from even if a reload happens meanwhile,
/// and clears `active` only while it still owns the pump.
async fn activate(
    registry: Arc<PumpRegistry>,
    index: usize,
    events: Sender<OutputEvent>,
    mut cancelled: watch::Receiver<u64>,
) {
    let pump = &registry.pumps()[index];

    let token = pump.claim();
    send(&events, pump.note, true).await;

    tokio::select! {
        _ = tokio::time::sleep(pump.note.duration) => {}
        Ok(()) = cancelled.changed() => {
            log::info!("pump {} cut short", pump.note.id);
        }
    }

    send(&events, pump.note, false).await;
    if !pump.release(token) {
        log::debug!("pump {} taken over, leaving its flag alone", pump.note.id);
    }
}

async fn send(events: &Sender<OutputEvent>, note: Note, turning_on: bool) {
    let event = OutputEvent::Note(NoteEvent { note, turning_on });
    if let Err(e) = events.send(event).await {
        log::error!("midi output is gone, dropping {:?}", e.into_inner());
    }
}

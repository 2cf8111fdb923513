use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::midi::controller::EmulateFlag;
use crate::midi::registry::model::PumpStatus;
use crate::rumba::RumbaLink;
use crate::scheduler::PumpScheduler;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum UartState {
    #[default]
    Pending,
    Configured,
    Skipped,
    Failed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TransportState {
    #[default]
    Pending,
    Open,
    Emulated,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadState {
    Loaded { pumps: usize },
    Failed { reason: String },
}

/// What went wrong with the hardware path, as seen by status pollers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Health {
    pub uart: UartState,
    pub transport: TransportState,
    pub writes: u64,
    pub write_errors: u64,
    pub last_error: Option<String>,
    pub last_reload: Option<ReloadState>,
}

#[derive(Clone, Default)]
pub struct HealthMonitor(Arc<Mutex<Health>>);

impl HealthMonitor {
    fn update<F: FnOnce(&mut Health)>(&self, f: F) {
        match self.0.lock() {
            Ok(mut health) => f(&mut *health),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    pub fn snapshot(&self) -> Health {
        match self.0.lock() {
            Ok(health) => health.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn record_uart(&self, state: UartState) {
        self.update(|h| h.uart = state)
    }

    pub fn record_transport(&self, state: TransportState) {
        self.update(|h| h.transport = state)
    }

    pub fn record_write(&self) {
        self.update(|h| h.writes += 1)
    }

    pub fn record_write_error(&self, error: String) {
        self.update(|h| {
            h.write_errors += 1;
            h.last_error = Some(error);
        })
    }

    pub fn record_reload(&self, state: ReloadState) {
        self.update(|h| h.last_reload = Some(state))
    }
}

#[derive(Debug, Serialize)]
pub struct AppStatus {
    pub pumps: Vec<PumpStatus>,
    pub health: Health,
    pub emulate: bool,
}

/// Everything the request handlers need, built once in `main`.
pub struct AppContext {
    pub scheduler: PumpScheduler,
    pub emulate: EmulateFlag,
    pub health: HealthMonitor,
    pub upload_csv: PathBuf,
    pub rumba: Option<RumbaLink>,
    pub sse_interval: Duration,
}

impl AppContext {
    pub fn status(&self) -> AppStatus {
        AppStatus {
            pumps: self.scheduler.snapshot(),
            health: self.health.snapshot(),
            emulate: self.emulate.is_enabled(),
        }
    }
}

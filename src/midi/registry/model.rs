use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::midi::model::{Channel, DataByte};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Reading pump table failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed pump table row {row}: {reason}")]
    Malformed { row: usize, reason: String },
    #[error("Pump table holds {rows} rows, capacity is {capacity}")]
    CapacityExceeded { rows: usize, capacity: usize },
    #[error("Pump {id} on row {row} maps past the highest MIDI note")]
    PitchOutOfRange { row: usize, id: u32 },
}

/// Immutable part of a pump: what gets sent and for how long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Note {
    pub id: u32,
    pub pitch: DataByte,
    pub channel: Channel,
    pub duration: Duration,
}

const ACTIVE_BIT: u64 = 1;

/// Ownership of one activation of a pump. Only the holder of the latest
/// token may close the pump's `active` flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivationToken(u64);

#[derive(Debug)]
pub struct Pump {
    pub note: Note,
    // Activation generation shifted left by one, `ACTIVE_BIT` in the low bit.
    state: AtomicU64,
}

impl Pump {
    pub fn new(note: Note) -> Pump {
        Pump {
            note,
            state: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) & ACTIVE_BIT != 0
    }

    /// Starts a new activation, taking the flag from whoever held it.
    pub fn claim(&self) -> ActivationToken {
        self.take_over(true)
    }

    /// Closes the pump regardless of the running activation, which then
    /// no longer owns the flag.
    pub fn force_inactive(&self) {
        self.take_over(false);
    }

    /// Clears `active` only if `token` still owns the pump. Returns whether
    /// it did.
    pub fn release(&self, token: ActivationToken) -> bool {
        let owned = (token.0 << 1) | ACTIVE_BIT;
        self.state
            .compare_exchange(owned, token.0 << 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_over(&self, active: bool) -> ActivationToken {
        let bit = if active { ACTIVE_BIT } else { 0 };
        let next = |state: u64| ((state >> 1).wrapping_add(1) << 1) | bit;
        // The closure never returns None, so both arms carry the old state.
        let previous = match self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| Some(next(state)))
        {
            Ok(state) | Err(state) => state,
        };
        ActivationToken(next(previous) >> 1)
    }

    pub fn status(&self) -> PumpStatus {
        PumpStatus {
            id: self.note.id,
            pitch: self.note.pitch,
            channel: self.note.channel,
            duration_ms: self.note.duration.as_millis() as u64,
            active: self.is_active(),
        }
    }
}

/// Read-only view of one pump, served to status pollers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PumpStatus {
    pub id: u32,
    pub pitch: DataByte,
    pub channel: Channel,
    pub duration_ms: u64,
    pub active: bool,
}

/// Settings every load of the pump table is validated against.
#[derive(Clone, Copy, Debug)]
pub struct RegistryLayout {
    pub base_offset: u8,
    pub capacity: usize,
    pub channel: Channel,
}

#[derive(Debug, Default)]
pub struct PumpRegistry {
    pumps: Vec<Pump>,
}

impl PumpRegistry {
    pub fn new(notes: Vec<Note>) -> PumpRegistry {
        PumpRegistry {
            pumps: notes.into_iter().map(Pump::new).collect(),
        }
    }

    /// Validates raw `(pump_index, duration_ms)` rows into a registry.
    pub fn from_rows(rows: &[(u32, u64)], layout: &RegistryLayout) -> Result<Self, LoadError> {
        if rows.len() > layout.capacity {
            return Err(LoadError::CapacityExceeded {
                rows: rows.len(),
                capacity: layout.capacity,
            });
        }

        let notes = rows
            .iter()
            .enumerate()
            .map(|(row, &(id, duration_ms))| {
                let pitch = u8::try_from(id)
                    .ok()
                    .and_then(|id| layout.base_offset.checked_add(id))
                    .and_then(DataByte::from_u8)
                    .ok_or(LoadError::PitchOutOfRange { row: row + 1, id })?;
                Ok::<Note, LoadError>(Note {
                    id,
                    pitch,
                    channel: layout.channel,
                    duration: Duration::from_millis(duration_ms),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PumpRegistry::new(notes))
    }

    pub fn pumps(&self) -> &[Pump] {
        &self.pumps
    }

    pub fn len(&self) -> usize {
        self.pumps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    pub fn find(&self, id: u32) -> Option<&Pump> {
        self.pumps.iter().find(|pump| pump.note.id == id)
    }

    pub fn snapshot(&self) -> Vec<PumpStatus> {
        self.pumps.iter().map(Pump::status).collect()
    }
}

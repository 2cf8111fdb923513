use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::midi::controller::{SerialWriter, TransportError};

/// Keeps every write with the time it happened.
#[derive(Clone, Default)]
pub struct Recording {
    writes: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
}

impl Recording {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.timed_writes().into_iter().map(|(_, w)| w).collect()
    }

    pub fn timed_writes(&self) -> Vec<(Instant, Vec<u8>)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Only the 3-byte note commands, in write order.
    pub fn notes(&self) -> Vec<(Instant, [u8; 3])> {
        self.timed_writes()
            .into_iter()
            .filter_map(|(at, w)| <[u8; 3]>::try_from(w.as_slice()).ok().map(|n| (at, n)))
            .collect()
    }
}

impl SerialWriter for Recording {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push((Instant::now(), bytes.to_vec()));
        }
        Ok(())
    }
}

pub struct AlwaysFails;

impl SerialWriter for AlwaysFails {
    fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Io {
            path: "stub".to_string(),
            source: std::io::Error::from_raw_os_error(libc::EIO),
        })
    }
}

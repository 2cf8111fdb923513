pub mod serial;
#[cfg(test)]
pub mod stubs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial device {0} is not open")]
    NotOpen(String),
    #[error("Serial device {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Byte sink for an outgoing serial link. Not safe for concurrent writers;
/// exactly one task owns each writer.
pub trait SerialWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Process-wide switch redirecting hardware writes to the log.
#[derive(Clone, Debug, Default)]
pub struct EmulateFlag(Arc<AtomicBool>);

impl EmulateFlag {
    pub fn new(enabled: bool) -> EmulateFlag {
        EmulateFlag(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        let previous = self.0.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            log::warn!("emulate mode {}", if enabled { "enabled" } else { "disabled" });
        }
    }
}

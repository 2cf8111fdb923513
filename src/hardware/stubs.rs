use std::sync::atomic::{AtomicUsize, Ordering};

use crate::hardware::{BaudRateConfigurator, HardwareError};

pub struct AlwaysConfigured {
    calls: AtomicUsize,
}

impl AlwaysConfigured {
    pub fn new() -> AlwaysConfigured {
        AlwaysConfigured {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BaudRateConfigurator for AlwaysConfigured {
    fn configure_baud_rate(&self) -> Result<(), HardwareError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MappingFails;

impl BaudRateConfigurator for MappingFails {
    fn configure_baud_rate(&self) -> Result<(), HardwareError> {
        Err(HardwareError::Map {
            base: crate::hardware::uart::DEFAULT_UART_BASE,
            source: std::io::Error::from_raw_os_error(libc::EPERM),
        })
    }
}

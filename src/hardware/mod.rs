#[cfg(test)]
pub mod stubs;
pub mod uart;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("Opening {path} failed: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Mapping uart registers at {base:#x} failed: {source}")]
    Map {
        base: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Puts the MIDI UART on the MIDI baud rate before any byte is written.
pub trait BaudRateConfigurator {
    fn configure_baud_rate(&self) -> Result<(), HardwareError>;
}

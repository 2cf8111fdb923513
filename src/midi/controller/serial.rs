use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::midi::controller::{EmulateFlag, SerialWriter, TransportError};

const MAX_DECISECONDS: u128 = u8::MAX as u128;

/// Baud code applied through termios; the UART clock setup turns it into
/// the rate the receiver expects.
const LINK_BAUD: libc::speed_t = libc::B115200;

/// Owns the single open handle to a serial device.
pub struct SerialTransport {
    path: String,
    device: Option<File>,
    emulate: EmulateFlag,
}

impl SerialTransport {
    /// Opens `path` non-blocking, applies raw 8N1 line discipline, then
    /// switches the descriptor to blocking.
    pub fn open(
        path: &str,
        read_timeout: Duration,
        emulate: EmulateFlag,
    ) -> Result<SerialTransport, TransportError> {
        let io_err = |source| TransportError::Io {
            path: path.to_string(),
            source,
        };

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(io_err)?;

        apply_line_discipline(device.as_raw_fd(), read_timeout).map_err(io_err)?;
        set_blocking(device.as_raw_fd()).map_err(io_err)?;

        log::info!("opened serial device {path}");
        Ok(SerialTransport {
            path: path.to_string(),
            device: Some(device),
            emulate,
        })
    }

    /// Transport with no device behind it. Writes fail unless emulating.
    pub fn detached(path: &str, emulate: EmulateFlag) -> SerialTransport {
        SerialTransport {
            path: path.to_string(),
            device: None,
            emulate,
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }
}

impl SerialWriter for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        // Callers log what an emulated write would have carried.
        if self.emulate.is_enabled() {
            return Ok(());
        }

        let device = self
            .device
            .as_mut()
            .ok_or_else(|| TransportError::NotOpen(self.path.clone()))?;
        log::debug!("writing {bytes:02x?} to {}", self.path);
        device.write_all(bytes).map_err(|source| TransportError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// `(VMIN, VTIME)` for a read timeout. Zero blocks until at least one byte
/// arrives; anything else waits up to the timeout in deciseconds, 1..=255.
pub fn posix_timeout_values(read_timeout: Duration) -> (u8, u8) {
    if read_timeout.is_zero() {
        return (1, 0);
    }
    let deciseconds = (read_timeout.as_millis() / 100).clamp(1, MAX_DECISECONDS);
    (0, deciseconds as u8)
}

fn apply_line_discipline(fd: RawFd, read_timeout: Duration) -> std::io::Result<()> {
    let (vmin, vtime) = posix_timeout_values(read_timeout);

    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    termios.c_iflag = libc::IGNPAR;
    termios.c_cflag = libc::CS8 | libc::CREAD | libc::CLOCAL | LINK_BAUD;
    termios.c_cc[libc::VMIN] = vmin;
    termios.c_cc[libc::VTIME] = vtime;

    let applied = unsafe {
        libc::cfsetispeed(&mut termios, LINK_BAUD) == 0
            && libc::cfsetospeed(&mut termios, LINK_BAUD) == 0
            && libc::tcsetattr(fd, libc::TCSANOW, &termios) == 0
    };
    if applied {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn set_blocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_blocks_for_one_byte() {
        assert_eq!(posix_timeout_values(Duration::ZERO), (1, 0));
    }

    #[test]
    fn timeout_is_clamped_to_deciseconds() {
        assert_eq!(posix_timeout_values(Duration::from_millis(10)), (0, 1));
        assert_eq!(posix_timeout_values(Duration::from_millis(250)), (0, 2));
        assert_eq!(posix_timeout_values(Duration::from_secs(5)), (0, 50));
        assert_eq!(posix_timeout_values(Duration::from_secs(60)), (0, 255));
    }

    #[test]
    fn emulated_writes_never_touch_a_device() {
        let mut transport = SerialTransport::detached("/dev/null-midi", EmulateFlag::new(true));
        assert!(!transport.is_open());
        assert!(transport.write(&[0x90, 36, 0x7F]).is_ok());
    }

    #[test]
    fn emulate_flag_is_read_on_every_write() {
        let emulate = EmulateFlag::new(true);
        let mut transport = SerialTransport::detached("/dev/null-midi", emulate.clone());
        assert!(transport.write(&[0x90, 36, 0x7F]).is_ok());

        emulate.set(false);
        assert!(matches!(
            transport.write(&[0x80, 36, 0x7F]),
            Err(TransportError::NotOpen(_))
        ));
    }

    #[test]
    fn missing_device_fails_to_open() {
        let result = SerialTransport::open(
            "/nonexistent/ttyMIDI",
            Duration::from_secs(5),
            EmulateFlag::default(),
        );
        assert!(matches!(result, Err(TransportError::Io { .. })));
    }
}

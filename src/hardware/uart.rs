use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::hardware::{BaudRateConfigurator, HardwareError};

/// Raspberry Pi 1 PL011 base. Later boards move the peripheral window.
pub const DEFAULT_UART_BASE: u64 = 0x2020_1000;

const PAGE_SIZE: usize = 4096;
const MEM_DEVICE: &str = "/dev/mem";

pub const UARTFR: usize = 0x18;
pub const IBRD: usize = 0x24;
pub const FBRD: usize = 0x28;
pub const LCRH: usize = 0x2C;
pub const UARTCR: usize = 0x30;

/// 31250 baud with the UART clock the board is booted with.
pub const MIDI_DIVISOR: u32 = 6;
pub const MIDI_FRACTIONAL: u32 = 0;
/// 8 data bits, FIFO enabled, no parity, one stop bit.
pub const LINE_CONTROL_8N1: u32 = 0x70;
/// UART enable, transmit enable, receive enable.
pub const CONTROL_ENABLED: u32 = 0x0301;
pub const CONTROL_DISABLED: u32 = 0x00;

// The mapping is shared by the whole process.
static CONFIGURE_LOCK: Mutex<()> = Mutex::new(());

/// 32-bit register window addressed by byte offset.
pub trait RegisterSpace {
    fn read(&self, offset: usize) -> u32;
    fn write(&mut self, offset: usize, value: u32);
}

/// One page of physical memory mapped through `/dev/mem`.
pub struct MappedPage {
    base: NonNull<u32>,
}

impl MappedPage {
    pub fn open(physical_base: u64) -> Result<MappedPage, HardwareError> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(MEM_DEVICE)
            .map_err(|source| HardwareError::Open {
                path: MEM_DEVICE.to_string(),
                source,
            })?;

        let offset = libc::off_t::try_from(physical_base).map_err(|_| HardwareError::Map {
            base: physical_base,
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        })?;

        // The descriptor can be closed once the mapping exists.
        let mapped = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                offset,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(HardwareError::Map {
                base: physical_base,
                source: std::io::Error::last_os_error(),
            });
        }

        NonNull::new(mapped as *mut u32)
            .map(|base| MappedPage { base })
            .ok_or(HardwareError::Map {
                base: physical_base,
                source: std::io::Error::from_raw_os_error(libc::EFAULT),
            })
    }

    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset < PAGE_SIZE,
            "register offset {offset:#x} outside mapped page"
        );
        unsafe { self.base.as_ptr().add(offset / 4) }
    }
}

impl RegisterSpace for MappedPage {
    fn read(&self, offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile(self.register(offset)) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        unsafe { std::ptr::write_volatile(self.register(offset), value) }
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, PAGE_SIZE);
        }
    }
}

/// Named view over the PL011 registers the configurator touches.
pub struct UartRegisters<S: RegisterSpace> {
    space: S,
}

impl<S: RegisterSpace> UartRegisters<S> {
    pub fn new(space: S) -> UartRegisters<S> {
        UartRegisters { space }
    }

    pub fn divisor(&self) -> u32 {
        self.space.read(IBRD)
    }

    pub fn flags(&self) -> u32 {
        self.space.read(UARTFR)
    }

    pub fn set_divisor(&mut self, value: u32) {
        self.space.write(IBRD, value)
    }

    pub fn set_fractional(&mut self, value: u32) {
        self.space.write(FBRD, value)
    }

    pub fn set_line_control(&mut self, value: u32) {
        self.space.write(LCRH, value)
    }

    pub fn set_control(&mut self, value: u32) {
        self.space.write(UARTCR, value)
    }

    /// Reprograms the UART for MIDI. The UART must be disabled while the
    /// baud registers change.
    pub fn program_midi_baud(&mut self) {
        let _guard = match CONFIGURE_LOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        log::info!("uart divisor before reconfiguration: {}", self.divisor());
        log::debug!("uart flags before reconfiguration: {:#06x}", self.flags());

        self.set_control(CONTROL_DISABLED);
        self.set_divisor(MIDI_DIVISOR);
        self.set_fractional(MIDI_FRACTIONAL);
        self.set_line_control(LINE_CONTROL_8N1);
        self.set_control(CONTROL_ENABLED);

        log::info!("uart divisor after reconfiguration: {}", self.divisor());
    }

    #[cfg(test)]
    pub fn into_inner(self) -> S {
        self.space
    }
}

/// Configures the PL011 behind the MIDI serial port through `/dev/mem`.
pub struct Pl011Configurator {
    base: u64,
}

impl Pl011Configurator {
    pub fn new(base: u64) -> Pl011Configurator {
        Pl011Configurator { base }
    }
}

impl BaudRateConfigurator for Pl011Configurator {
    fn configure_baud_rate(&self) -> Result<(), HardwareError> {
        let mut registers = UartRegisters::new(MappedPage::open(self.base)?);
        registers.program_midi_baud();
        Ok(())
    }
}

//! serial-flash bootloader client.
//!
//! Programs firmware images into microcontrollers running a bootloader that
//! speaks the serial-flash protocol (rp2040_serial_bootloader, picowota),
//! over a serial port or TCP socket.

use std::convert::TryFrom;
use std::io::{Read, Write};

#[macro_use]
extern crate log;

#[cfg(feature = "structopt")]
extern crate structopt;

pub mod protocol;
use protocol::{Command, DeviceInfo};

pub mod elf;
pub mod image;
pub mod program;
pub mod transport;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

pub use elf::{load_elf, parse_elf, FlashRegion};
pub use image::Image;
pub use program::{align_up, ProgressReport, State};
pub use transport::Transport;

/// Default number of sync attempts before giving up
pub const SYNC_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command}: short write ({written} of {expected} bytes)")]
    ShortWrite {
        command: &'static str,
        written: usize,
        expected: usize,
    },

    #[error("{command}: received error response")]
    DeviceError { command: &'static str },

    #[error("{command}: received unexpected response {marker:02x?}")]
    UnexpectedResponse {
        command: &'static str,
        marker: protocol::Tag,
    },

    #[error("not synced")]
    NotSynced,

    #[error("CRC mismatch: 0x{device:08x} vs 0x{host:08x}")]
    CrcMismatch { device: u32, host: u32 },

    #[error("image load address too low: 0x{addr:08x} < 0x{flash_base:08x}")]
    AddressTooLow { addr: u32, flash_base: u32 },

    #[error("image of {len} bytes doesn't fit in flash at 0x{addr:08x} (flash 0x{flash_base:08x}..0x{flash_end:08x})")]
    ImageTooLarge {
        addr: u32,
        len: usize,
        flash_base: u32,
        flash_end: u64,
    },

    #[error("invalid device info: {0}")]
    InvalidDeviceInfo(String),

    #[error("elf error: {0}")]
    Elf(#[from] object::read::Error),

    #[error("not an ELF file")]
    NotElf,

    #[error("no flash-resident sections in ELF image")]
    EmptyImage,

    #[error("address 0x{0:x} out of 32-bit range")]
    AddressOverflow(u64),

    #[error("{stage}: {source}")]
    Stage {
        stage: State,
        #[source]
        source: Box<Error>,
    },

    #[cfg(feature = "linux")]
    #[error("serial port error: {0}")]
    Serial(#[from] serial_core::Error),

    #[error("invalid target '{0}'")]
    InvalidTarget(String),
}

impl Error {
    /// Attach the stage in which an error occurred
    pub(crate) fn stage(self, stage: State) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Strip any stage context, returning the underlying error
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            e => e,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Number of attempts to synchronise with the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub sync_attempts: usize,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_attempts: SYNC_ATTEMPTS,
            timeout_ms: 1000,
        }
    }
}

/// Length field for a request covering `len` bytes
pub(crate) fn request_len(len: usize) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| Error::AddressOverflow(len as u64))
}

/// Bootloader session over port `P`
pub struct Programmer<P> {
    state: State,
    options: Options,
    port: P,
}

impl<P> Programmer<P>
where
    P: Read + Write,
{
    /// Create a new programmer instance
    pub fn new(port: P, options: Options) -> Self {
        Self {
            state: State::Init,
            options,
            port,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Release the underlying port
    pub fn into_inner(self) -> P {
        self.port
    }

    /// Execute a single command on the port
    pub fn execute<C: Command>(&mut self, command: &C) -> Result<C::Response, Error> {
        command.execute(&mut self.port)
    }

    /// Fetch device flash geometry
    pub fn info(&mut self) -> Result<DeviceInfo, Error> {
        self.execute(&protocol::Info)
    }

    /// Read device memory into `data`
    pub fn read_mem(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Error> {
        let resp = self.execute(&protocol::ReadMem {
            addr,
            len: request_len(data.len())?,
        })?;
        data.copy_from_slice(&resp);
        Ok(())
    }

    /// Device-side word checksum of a region
    pub fn checksum(&mut self, addr: u32, len: u32) -> Result<u32, Error> {
        self.execute(&protocol::Checksum { addr, len })
    }

    /// Device-side CRC-32 of a region
    pub fn crc(&mut self, addr: u32, len: u32) -> Result<u32, Error> {
        self.execute(&protocol::Crc { addr, len })
    }

    /// Check that device memory at `addr` matches `data`
    pub fn verify_crc(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let device = self.crc(addr, request_len(data.len())?)?;
        let host = protocol::crc32(data);

        if device != host {
            return Err(Error::CrcMismatch { device, host });
        }

        Ok(())
    }

    /// Jump to code at `addr`. The bootloader will not respond after this.
    pub fn go(&mut self, addr: u32) -> Result<(), Error> {
        info!("Jumping to 0x{:08x}", addr);
        self.execute(&protocol::Go { addr })
    }
}

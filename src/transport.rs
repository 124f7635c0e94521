//! Byte stream transports: serial port or TCP socket

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[cfg(feature = "linux")]
use linux_embedded_hal::Serial;

use crate::Error;

/// Prefix selecting a TCP target, e.g. `tcp:192.168.4.1:4242`
pub const TCP_PREFIX: &str = "tcp:";

/// Where to find the bootloader
#[derive(Clone, PartialEq, Debug)]
pub enum Target {
    Serial(String),
    Tcp(String),
}

impl Target {
    pub fn parse(target: &str) -> Result<Self, Error> {
        if let Some(addr) = target.strip_prefix(TCP_PREFIX) {
            if addr.is_empty() {
                return Err(Error::InvalidTarget(target.to_string()));
            }
            Ok(Target::Tcp(addr.to_string()))
        } else if target.is_empty() {
            Err(Error::InvalidTarget(target.to_string()))
        } else {
            Ok(Target::Serial(target.to_string()))
        }
    }
}

/// An open connection to the bootloader
pub enum Transport {
    #[cfg(feature = "linux")]
    Serial(Serial),
    Tcp(TcpStream),
}

impl Transport {
    /// Connect to `target`, applying `timeout` to every read.
    ///
    /// A zero timeout disables the read deadline for TCP targets.
    pub fn open(target: &str, baud: usize, timeout: Duration) -> Result<Self, Error> {
        match Target::parse(target)? {
            Target::Tcp(addr) => Self::tcp(&addr, timeout),
            #[cfg(feature = "linux")]
            Target::Serial(path) => Ok(Transport::Serial(crate::linux::open_serial(
                path, baud, timeout,
            )?)),
            #[cfg(not(feature = "linux"))]
            Target::Serial(path) => {
                let _ = baud;
                Err(Error::InvalidTarget(path))
            }
        }
    }

    /// Connect to a TCP bridge (e.g. picowota over WiFi)
    pub fn tcp(addr: &str, timeout: Duration) -> Result<Self, Error> {
        debug!("Connecting to {}", addr);

        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let deadline = if timeout.as_millis() == 0 {
            None
        } else {
            Some(timeout)
        };
        stream.set_read_timeout(deadline)?;

        Ok(Transport::Tcp(stream))
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "linux")]
            Transport::Serial(s) => s.0.read(buf),
            Transport::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "linux")]
            Transport::Serial(s) => s.0.write(buf),
            Transport::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(feature = "linux")]
            Transport::Serial(s) => s.0.flush(),
            Transport::Tcp(s) => s.flush(),
        }
    }
}

//! Bootloader command protocol
//!
//! Every request starts with a 4-byte ASCII opcode followed by little-endian
//! `u32` arguments. Every response (other than to [`Sync`] and [`Go`]) starts
//! with either [`RESPONSE_OK`] or [`RESPONSE_ERR`].

use std::io::{self, Read, Write};

use crate::Error;

/// 4-byte ASCII opcode or response marker
pub type Tag = [u8; 4];

pub const OPCODE_SYNC: Tag = *b"SYNC";
pub const OPCODE_READ: Tag = *b"READ";
pub const OPCODE_CSUM: Tag = *b"CSUM";
pub const OPCODE_CRC: Tag = *b"CRCC";
pub const OPCODE_ERASE: Tag = *b"ERAS";
pub const OPCODE_WRITE: Tag = *b"WRIT";
pub const OPCODE_SEAL: Tag = *b"SEAL";
pub const OPCODE_GO: Tag = *b"GOGO";
pub const OPCODE_INFO: Tag = *b"INFO";

/// Sync response from rp2040_serial_bootloader
pub const RESPONSE_SYNC: Tag = *b"PICO";
/// Sync response from picowota
pub const RESPONSE_SYNC_WOTA: Tag = *b"WOTA";

pub const RESPONSE_OK: Tag = *b"OKOK";
pub const RESPONSE_ERR: Tag = *b"ERR!";

pub const MARKER_LEN: usize = 4;

/// Maximum number of bytes drained from the port while looking for a sync response
pub const SYNC_DRAIN_LEN: usize = 4096;

const SYNC_RESPONSES: [Tag; 2] = [RESPONSE_SYNC, RESPONSE_SYNC_WOTA];

/// A single bootloader request / response exchange
pub trait Command {
    /// Decoded response fields
    type Response;

    /// Command name used in errors and logs
    const NAME: &'static str;

    /// Issue the command on `port` and decode the response
    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<Self::Response, Error>;
}

/// Device capabilities returned by [`Info`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceInfo {
    pub flash_base: u32,
    pub flash_size: u32,
    pub erase_unit: u32,
    pub write_unit: u32,
    pub max_chunk: u32,
}

/// Host-side replica of the device `CSUM` algorithm.
///
/// Sums little-endian words, zero-padding the final word.
pub fn checksum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |acc, word| {
        let mut b = [0u8; 4];
        b[..word.len()].copy_from_slice(word);
        acc.wrapping_add(u32::from_le_bytes(b))
    })
}

/// CRC-32 (IEEE) as computed by the device for `CRCC`, `WRIT` and `SEAL`
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Synchronise with the bootloader
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Sync;

impl Command for Sync {
    type Response = ();
    const NAME: &'static str = "SYNC";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<(), Error> {
        send(port, &OPCODE_SYNC, Self::NAME)?;

        // The device may have stale output queued, so drain what's there
        // and only look at the tail
        let mut resp = [0u8; SYNC_DRAIN_LEN];
        let n = read_at_least(port, &mut resp, MARKER_LEN)?;
        trace!("SYNC rx: {:02x?}", &resp[..n]);

        if SYNC_RESPONSES.iter().any(|m| resp[..n].ends_with(m)) {
            debug!("Received sync response");
            Ok(())
        } else {
            Err(Error::NotSynced)
        }
    }
}

/// Fetch flash geometry
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Info;

impl Command for Info {
    type Response = DeviceInfo;
    const NAME: &'static str = "INFO";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<DeviceInfo, Error> {
        let resp = transact(port, &request(OPCODE_INFO, &[]), MARKER_LEN + 4 * 5, Self::NAME)?;

        Ok(DeviceInfo {
            flash_base: le_u32(&resp, 4),
            flash_size: le_u32(&resp, 8),
            erase_unit: le_u32(&resp, 12),
            write_unit: le_u32(&resp, 16),
            max_chunk: le_u32(&resp, 20),
        })
    }
}

/// Read `len` bytes of device memory from `addr`
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ReadMem {
    pub addr: u32,
    pub len: u32,
}

impl Command for ReadMem {
    type Response = Vec<u8>;
    const NAME: &'static str = "READ";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<Vec<u8>, Error> {
        let req = request(OPCODE_READ, &[self.addr, self.len]);
        let mut resp = transact(port, &req, MARKER_LEN + self.len as usize, Self::NAME)?;

        Ok(resp.split_off(MARKER_LEN))
    }
}

/// Word checksum of a region, see [`checksum`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Checksum {
    pub addr: u32,
    pub len: u32,
}

impl Command for Checksum {
    type Response = u32;
    const NAME: &'static str = "CSUM";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<u32, Error> {
        let req = request(OPCODE_CSUM, &[self.addr, self.len]);
        let resp = transact(port, &req, MARKER_LEN + 4, Self::NAME)?;

        Ok(le_u32(&resp, 4))
    }
}

/// CRC-32 of a region
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Crc {
    pub addr: u32,
    pub len: u32,
}

impl Command for Crc {
    type Response = u32;
    const NAME: &'static str = "CRCC";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<u32, Error> {
        let req = request(OPCODE_CRC, &[self.addr, self.len]);
        let resp = transact(port, &req, MARKER_LEN + 4, Self::NAME)?;

        Ok(le_u32(&resp, 4))
    }
}

/// Erase a region, `len` should be a multiple of the device erase unit
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Erase {
    pub addr: u32,
    pub len: u32,
}

impl Command for Erase {
    type Response = ();
    const NAME: &'static str = "ERAS";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<(), Error> {
        let req = request(OPCODE_ERASE, &[self.addr, self.len]);
        transact(port, &req, MARKER_LEN, Self::NAME)?;

        Ok(())
    }
}

/// Write `data` at `addr`, checking the CRC of the stored bytes reported by the device
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct WriteMem<'a> {
    pub addr: u32,
    pub data: &'a [u8],
}

impl<'a> Command for WriteMem<'a> {
    type Response = ();
    const NAME: &'static str = "WRIT";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<(), Error> {
        let mut req = request(OPCODE_WRITE, &[self.addr, self.data.len() as u32]);
        req.extend_from_slice(self.data);

        let resp = transact(port, &req, MARKER_LEN + 4, Self::NAME)?;

        let device = le_u32(&resp, 4);
        let host = crc32(self.data);
        if device != host {
            return Err(Error::CrcMismatch { device, host });
        }

        Ok(())
    }
}

/// Mark the image covering `addr..addr+len` as complete
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Seal {
    pub addr: u32,
    pub len: u32,
    pub crc: u32,
}

impl Seal {
    /// Build a seal covering all of `data` written at `addr`
    pub fn new(addr: u32, data: &[u8]) -> Self {
        Self {
            addr,
            len: data.len() as u32,
            crc: crc32(data),
        }
    }
}

impl Command for Seal {
    type Response = ();
    const NAME: &'static str = "SEAL";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<(), Error> {
        let req = request(OPCODE_SEAL, &[self.addr, self.len, self.crc]);
        transact(port, &req, MARKER_LEN, Self::NAME)?;

        Ok(())
    }
}

/// Jump to `addr`. No response is expected, the bootloader stops responding.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Go {
    pub addr: u32,
}

impl Command for Go {
    type Response = ();
    const NAME: &'static str = "GOGO";

    fn execute<P: Read + Write>(&self, port: &mut P) -> Result<(), Error> {
        send(port, &request(OPCODE_GO, &[self.addr]), Self::NAME)
    }
}

fn request(opcode: Tag, args: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MARKER_LEN + args.len() * 4);
    buf.extend_from_slice(&opcode);
    for a in args {
        buf.extend_from_slice(&a.to_le_bytes());
    }
    buf
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

fn transact<P: Read + Write>(
    port: &mut P,
    req: &[u8],
    response_len: usize,
    command: &'static str,
) -> Result<Vec<u8>, Error> {
    send(port, req, command)?;
    read_response(port, response_len, command)
}

/// Write a complete request, failing if the port stops accepting bytes
fn send<W: Write>(port: &mut W, req: &[u8], command: &'static str) -> Result<(), Error> {
    debug!("{} request ({} bytes)", command, req.len());
    trace!("{} tx: {:02x?}", command, &req[..req.len().min(16)]);

    let mut written = 0;
    while written < req.len() {
        match port.write(&req[written..]) {
            Ok(0) => {
                return Err(Error::ShortWrite {
                    command,
                    written,
                    expected: req.len(),
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }

    port.flush()?;

    Ok(())
}

/// Read until at least `min` bytes are in `buf`, returning the number read
fn read_at_least<R: Read>(port: &mut R, buf: &mut [u8], min: usize) -> Result<usize, Error> {
    let mut n = 0;

    while n < min {
        match port.read(&mut buf[n..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "port closed while awaiting response",
                )
                .into())
            }
            Ok(r) => n += r,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(n)
}

/// Read a `len` byte response, including the leading marker.
///
/// The marker is checked as soon as it has arrived, so an error response
/// returns without waiting for the rest of the response.
pub(crate) fn read_response<R: Read>(
    port: &mut R,
    len: usize,
    command: &'static str,
) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; len];
    let mut total = 0;
    let mut checked = false;
    let mut at_least = MARKER_LEN;

    while total < len {
        total += read_at_least(port, &mut buf[total..], at_least)?;
        at_least = len - total;

        if !checked && total >= MARKER_LEN {
            let mut marker = [0u8; MARKER_LEN];
            marker.copy_from_slice(&buf[..MARKER_LEN]);

            if marker == RESPONSE_ERR {
                debug!("{} received error response", command);
                return Err(Error::DeviceError { command });
            } else if marker != RESPONSE_OK {
                debug!("{} received unexpected response: {:02x?}", command, marker);
                return Err(Error::UnexpectedResponse { command, marker });
            }

            checked = true;
        }
    }

    debug!("{} response ok ({} bytes)", command, len);

    Ok(buf)
}

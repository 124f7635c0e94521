//! Test ports: a scripted byte stream and a simulated bootloader

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::ops::Range;

use crate::protocol::*;

/// Port replaying canned reads and capturing writes
pub struct ScriptedPort {
    rx: VecDeque<Vec<u8>>,
    pub tx: Vec<u8>,
    write_limit: Option<usize>,
}

impl ScriptedPort {
    /// Each entry is returned by a separate call to `read`
    pub fn new(reads: Vec<Vec<u8>>) -> Self {
        Self {
            rx: reads.into(),
            tx: vec![],
            write_limit: None,
        }
    }

    /// Accept at most `limit` written bytes, then report zero-length writes
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunk = match self.rx.pop_front() {
            Some(c) => c,
            None => return Ok(0),
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.rx.push_front(chunk.split_off(n));
        }

        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.write_limit {
            Some(limit) => buf.len().min(limit - self.tx.len()),
            None => buf.len(),
        };
        self.tx.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Requests decoded by [`MockDevice`]
#[derive(Clone, PartialEq, Debug)]
pub enum Request {
    Sync,
    Info,
    Read { addr: u32, len: u32 },
    Checksum { addr: u32, len: u32 },
    Crc { addr: u32, len: u32 },
    Erase { addr: u32, len: u32 },
    Write { addr: u32, len: u32 },
    Seal { addr: u32, len: u32, crc: u32 },
    Go { addr: u32 },
}

/// Simulated bootloader with a flash array
pub struct MockDevice {
    pub info: DeviceInfo,
    flash: Vec<u8>,
    /// Every request received, in order
    pub log: Vec<Request>,
    /// Report a wrong CRC for written data
    pub corrupt_write_crc: bool,
    /// Respond with an error to this opcode
    pub fail: Option<Tag>,
    /// Number of sync requests to answer with a non-sync response
    pub sync_failures: usize,
    /// Output queued ahead of the first sync response
    pub stale: Vec<u8>,
    /// Maximum bytes returned per read, 0 for no limit
    pub read_chunk: usize,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl Default for MockDevice {
    fn default() -> Self {
        let info = DeviceInfo {
            flash_base: 0x1000_0000,
            flash_size: 0x20_0000,
            erase_unit: 4096,
            write_unit: 256,
            max_chunk: 2048,
        };

        Self {
            info,
            flash: vec![0u8; info.flash_size as usize],
            log: vec![],
            corrupt_write_crc: false,
            fail: None,
            sync_failures: 0,
            stale: vec![],
            read_chunk: 0,
            rx: vec![],
            tx: VecDeque::new(),
        }
    }
}

impl MockDevice {
    /// Flash contents at `addr`
    pub fn memory(&self, addr: u32, len: u32) -> &[u8] {
        let r = self.region(addr, len).expect("region outside flash");
        &self.flash[r]
    }

    fn region(&self, addr: u32, len: u32) -> Option<Range<usize>> {
        let base = self.info.flash_base as u64;
        let start = addr as u64;
        let end = start + len as u64;

        if start < base || end > base + self.info.flash_size as u64 {
            return None;
        }

        Some((start - base) as usize..(end - base) as usize)
    }

    fn respond(&mut self, data: &[u8]) {
        self.tx.extend(data.iter());
    }

    fn ok(&mut self, payload: &[u8]) {
        self.respond(&RESPONSE_OK);
        self.respond(payload);
    }

    /// Length of the complete command at the head of `rx`, if available
    fn pending_len(&self) -> Option<usize> {
        if self.rx.len() < MARKER_LEN {
            return None;
        }

        let len = match &self.rx[..4] {
            b"SYNC" | b"INFO" => 4,
            b"GOGO" => 8,
            b"READ" | b"CSUM" | b"CRCC" | b"ERAS" => 12,
            b"SEAL" => 16,
            b"WRIT" if self.rx.len() >= 12 => 12 + arg(&self.rx, 1) as usize,
            b"WRIT" => return None,
            _ => self.rx.len(),
        };

        if self.rx.len() >= len {
            Some(len)
        } else {
            None
        }
    }

    fn process(&mut self) {
        while let Some(len) = self.pending_len() {
            let cmd: Vec<u8> = self.rx.drain(..len).collect();
            self.handle(&cmd);
        }
    }

    fn handle(&mut self, cmd: &[u8]) {
        let mut opcode = [0u8; 4];
        opcode.copy_from_slice(&cmd[..4]);

        let req = match &opcode {
            b"SYNC" => Request::Sync,
            b"INFO" => Request::Info,
            b"GOGO" => Request::Go { addr: arg(cmd, 0) },
            b"READ" => Request::Read { addr: arg(cmd, 0), len: arg(cmd, 1) },
            b"CSUM" => Request::Checksum { addr: arg(cmd, 0), len: arg(cmd, 1) },
            b"CRCC" => Request::Crc { addr: arg(cmd, 0), len: arg(cmd, 1) },
            b"ERAS" => Request::Erase { addr: arg(cmd, 0), len: arg(cmd, 1) },
            b"WRIT" => Request::Write { addr: arg(cmd, 0), len: arg(cmd, 1) },
            b"SEAL" => Request::Seal { addr: arg(cmd, 0), len: arg(cmd, 1), crc: arg(cmd, 2) },
            _ => {
                self.respond(&RESPONSE_ERR);
                return;
            }
        };
        self.log.push(req.clone());

        if self.fail == Some(opcode) {
            self.respond(&RESPONSE_ERR);
            return;
        }

        match req {
            Request::Sync if self.sync_failures > 0 => {
                self.sync_failures -= 1;
                self.respond(b"BUSY");
            }
            Request::Sync => {
                let stale = std::mem::take(&mut self.stale);
                self.respond(&stale);
                self.respond(&RESPONSE_SYNC);
            }
            Request::Info => {
                let i = self.info;
                let mut payload = vec![];
                for v in &[i.flash_base, i.flash_size, i.erase_unit, i.write_unit, i.max_chunk] {
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                self.ok(&payload);
            }
            Request::Go { .. } => (),
            Request::Read { addr, len } => match self.region(addr, len) {
                Some(r) => {
                    let data = self.flash[r].to_vec();
                    self.ok(&data);
                }
                None => self.respond(&RESPONSE_ERR),
            },
            Request::Checksum { addr, len } => match self.region(addr, len) {
                Some(r) => {
                    let sum = checksum(&self.flash[r]);
                    self.ok(&sum.to_le_bytes());
                }
                None => self.respond(&RESPONSE_ERR),
            },
            Request::Crc { addr, len } => match self.region(addr, len) {
                Some(r) => {
                    let crc = crc32(&self.flash[r]);
                    self.ok(&crc.to_le_bytes());
                }
                None => self.respond(&RESPONSE_ERR),
            },
            Request::Erase { addr, len } => match self.region(addr, len) {
                Some(r) => {
                    self.flash[r].iter_mut().for_each(|b| *b = 0xff);
                    self.ok(&[]);
                }
                None => self.respond(&RESPONSE_ERR),
            },
            Request::Write { addr, len } => match self.region(addr, len) {
                Some(r) => {
                    self.flash[r.clone()].copy_from_slice(&cmd[12..]);
                    let mut crc = crc32(&self.flash[r]);
                    if self.corrupt_write_crc {
                        crc ^= 1;
                    }
                    self.ok(&crc.to_le_bytes());
                }
                None => self.respond(&RESPONSE_ERR),
            },
            Request::Seal { addr, len, crc } => match self.region(addr, len) {
                Some(r) if crc32(&self.flash[r.clone()]) == crc => self.ok(&[]),
                _ => self.respond(&RESPONSE_ERR),
            },
        }
    }
}

fn arg(cmd: &[u8], index: usize) -> u32 {
    let offset = 4 + index * 4;
    let mut b = [0u8; 4];
    b.copy_from_slice(&cmd[offset..offset + 4]);
    u32::from_le_bytes(b)
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = buf.len().min(self.tx.len());
        if self.read_chunk > 0 {
            n = n.min(self.read_chunk);
        }

        for (b, v) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *b = v;
        }

        Ok(n)
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rx.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

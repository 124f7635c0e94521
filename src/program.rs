//! Image programming sequence
//!
//! `Sync -> QueryInfo -> ValidateBounds -> Erase -> Write -> Seal -> Done`,
//! stopping at the first failure. Jumping to the new image is left to the caller.

use std::fmt;
use std::io::{Read, Write};
use std::sync::mpsc::SyncSender;

use crate::protocol::{self, DeviceInfo, Erase, Seal, WriteMem};
use crate::{Error, Image, Programmer};

/// Programming stages
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Sync,
    QueryInfo,
    ValidateBounds,
    Erase,
    Write,
    Seal,
    Done,
}

impl State {
    /// Human readable stage description for progress display
    pub fn label(&self) -> &'static str {
        match self {
            State::Init => "Initialising",
            State::Sync => "Synchronising",
            State::QueryInfo => "Querying device info",
            State::ValidateBounds => "Checking image bounds",
            State::Erase => "Erasing",
            State::Write => "Writing",
            State::Seal => "Finalising",
            State::Done => "Done",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Init => "init",
            State::Sync => "sync",
            State::QueryInfo => "info",
            State::ValidateBounds => "bounds",
            State::Erase => "erase",
            State::Write => "write",
            State::Seal => "seal",
            State::Done => "done",
        };
        f.write_str(s)
    }
}

/// Progress event emitted while programming
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ProgressReport {
    pub stage: State,
    pub progress: usize,
    pub max: usize,
}

/// Optional progress sink, dropped (and thus closed) when programming returns
struct Reporter(Option<SyncSender<ProgressReport>>);

impl Reporter {
    fn report(&self, stage: State, progress: usize, max: usize) {
        if let Some(tx) = &self.0 {
            // A consumer that has gone away doesn't stop programming
            if tx.send(ProgressReport { stage, progress, max }).is_err() {
                trace!("Progress receiver closed");
            }
        }
    }
}

/// Round `value` up to a multiple of `to`, which must be a power of two
pub fn align_up(value: u64, to: u64) -> u64 {
    (value + (to - 1)) & !(to - 1)
}

/// Check the geometry reported by the device is usable
pub fn validate_info(info: &DeviceInfo) -> Result<(), Error> {
    let units = [
        ("erase unit", info.erase_unit),
        ("write unit", info.write_unit),
        ("max chunk", info.max_chunk),
    ];

    for (name, v) in units.iter() {
        if !v.is_power_of_two() {
            return Err(Error::InvalidDeviceInfo(format!(
                "{} {} is not a power of two",
                name, v
            )));
        }
    }

    // Chunks are padded to whole write units
    if info.max_chunk < info.write_unit {
        return Err(Error::InvalidDeviceInfo(format!(
            "max chunk {} is smaller than write unit {}",
            info.max_chunk, info.write_unit
        )));
    }

    // Application region sizes need not be powers of two
    if info.flash_size == 0 {
        return Err(Error::InvalidDeviceInfo("flash size is zero".to_string()));
    }

    if info.flash_base as u64 + info.flash_size as u64 > 1u64 << 32 {
        return Err(Error::InvalidDeviceInfo(format!(
            "flash 0x{:08x} + 0x{:x} exceeds the 32-bit address space",
            info.flash_base, info.flash_size
        )));
    }

    Ok(())
}

/// Check `len` bytes at `addr` lie within device flash
pub fn check_bounds(addr: u32, len: usize, info: &DeviceInfo) -> Result<(), Error> {
    if addr < info.flash_base {
        return Err(Error::AddressTooLow {
            addr,
            flash_base: info.flash_base,
        });
    }

    let flash_end = info.flash_base as u64 + info.flash_size as u64;
    if addr as u64 + len as u64 > flash_end {
        return Err(Error::ImageTooLarge {
            addr,
            len,
            flash_base: info.flash_base,
            flash_end,
        });
    }

    Ok(())
}

impl<P> Programmer<P>
where
    P: Read + Write,
{
    /// Synchronise with the bootloader, retrying up to `options.sync_attempts` times
    pub fn sync(&mut self) -> Result<(), Error> {
        self.sync_with(&Reporter(None))
    }

    fn sync_with(&mut self, progress: &Reporter) -> Result<(), Error> {
        self.state = State::Sync;
        let attempts = self.options.sync_attempts.max(1);

        for i in 0..attempts {
            progress.report(State::Sync, i, attempts);
            let r = self.execute(&protocol::Sync);
            progress.report(State::Sync, i + 1, attempts);

            match r {
                Ok(()) => {
                    info!("Bootloader synchronised");
                    return Ok(());
                }
                Err(Error::NotSynced) => {
                    warn!("Sync attempt {}/{} failed", i + 1, attempts);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NotSynced)
    }

    /// Erase, write and seal `image`.
    ///
    /// Progress events are sent to `progress` if provided, the sender is
    /// dropped on return to signal completion.
    pub fn program(
        &mut self,
        image: &Image,
        progress: Option<SyncSender<ProgressReport>>,
    ) -> Result<(), Error> {
        let progress = Reporter(progress);
        let base = image.base_address();

        self.sync_with(&progress).map_err(|e| e.stage(State::Sync))?;

        self.state = State::QueryInfo;
        progress.report(State::QueryInfo, 0, 1);
        let info = self.info();
        progress.report(State::QueryInfo, 1, 1);
        let info = info.map_err(|e| e.stage(State::QueryInfo))?;

        info!(
            "Flash 0x{:08x} size 0x{:x}, erase unit {}, write unit {}, max chunk {}",
            info.flash_base, info.flash_size, info.erase_unit, info.write_unit, info.max_chunk
        );

        self.state = State::ValidateBounds;
        validate_info(&info).map_err(|e| e.stage(State::ValidateBounds))?;

        let padded_len = align_up(image.len() as u64, info.write_unit as u64) as usize;
        check_bounds(base, padded_len, &info).map_err(|e| e.stage(State::ValidateBounds))?;

        let erase_unit = info.erase_unit as usize;
        let erase_len = align_up(padded_len as u64, erase_unit as u64) as usize;
        if base as u64 + erase_len as u64 > 1u64 << 32 {
            return Err(Error::AddressOverflow(base as u64 + erase_len as u64)
                .stage(State::ValidateBounds));
        }
        if base % info.erase_unit != 0 {
            warn!(
                "Image base 0x{:08x} is not aligned to erase unit {}",
                base, info.erase_unit
            );
        }

        let mut data = image.bytes().to_vec();
        data.resize(padded_len, 0);

        // Erase one unit at a time so no single command runs long enough
        // for the transport to time out
        self.state = State::Erase;
        info!("Erasing {} bytes at 0x{:08x}", erase_len, base);
        progress.report(State::Erase, 0, erase_len);

        for start in (0..erase_len).step_by(erase_unit) {
            let end = start + erase_unit;
            let r = self.execute(&Erase {
                addr: base + start as u32,
                len: info.erase_unit,
            });
            progress.report(State::Erase, end, erase_len);
            r.map_err(|e| e.stage(State::Erase))?;
        }

        self.state = State::Write;
        info!("Writing {} bytes at 0x{:08x}", data.len(), base);
        progress.report(State::Write, 0, data.len());

        let max_chunk = info.max_chunk as usize;
        for (i, chunk) in data.chunks(max_chunk).enumerate() {
            let start = i * max_chunk;
            let r = self.execute(&WriteMem {
                addr: base + start as u32,
                data: chunk,
            });
            progress.report(State::Write, start + chunk.len(), data.len());
            r.map_err(|e| e.stage(State::Write))?;
        }

        self.state = State::Seal;
        progress.report(State::Seal, 0, 1);
        let seal = Seal::new(base, &data);
        debug!("Sealing {} bytes, crc 0x{:08x}", seal.len, seal.crc);
        let r = self.execute(&seal);
        progress.report(State::Seal, 1, 1);
        r.map_err(|e| e.stage(State::Seal))?;

        self.state = State::Done;
        info!("Programmed {} bytes at 0x{:08x}", data.len(), base);

        Ok(())
    }
}

#[macro_use]
extern crate log;

use std::fs::File;
use std::io::Read;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread;
use std::time::Duration;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use serial_flash::{load_elf, FlashRegion, Image, Options, Programmer, ProgressReport, State, Transport};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to, or tcp:HOST:PORT
    #[structopt(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Program an ELF or raw binary image, then jump to it
    Program {
        /// Image to program, ELF files are detected automatically
        #[structopt(parse(from_os_str))]
        file: PathBuf,

        /// Load address for raw binary images
        #[structopt(long, parse(try_from_str = parse_u32))]
        base: Option<u32>,

        /// Start of flash when selecting ELF segments
        #[structopt(long, default_value = "0x10000000", parse(try_from_str = parse_u64))]
        flash_base: u64,

        /// Size of flash when selecting ELF segments
        #[structopt(long, default_value = "0x200000", parse(try_from_str = parse_u64))]
        flash_size: u64,

        /// Do not jump to the image after programming
        #[structopt(long)]
        no_go: bool,
    },
    /// Show device flash geometry
    Info,
    /// Hex dump device memory
    Read {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
    },
    /// Device word checksum of a region
    Checksum {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
    },
    /// Device CRC-32 of a region
    Crc {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        len: u32,
    },
    /// Jump to an address
    Go {
        #[structopt(parse(try_from_str = parse_u32))]
        addr: u32,
    },
    /// Check the bootloader responds
    Sync,
}

fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_u64(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> Result<()> {
    info!("Connecting to {}", o.port);

    let timeout = Duration::from_millis(o.options.timeout_ms as u64);
    let port = Transport::open(&o.port, o.baud, timeout)
        .with_context(|| format!("Error connecting to {}", o.port))?;

    let mut p = Programmer::new(port, o.options.clone());

    if let Operation::Program {
        file,
        base,
        flash_base,
        flash_size,
        no_go,
    } = &o.operation
    {
        let region = FlashRegion {
            base: *flash_base,
            size: *flash_size,
        };
        let image = load_image(file, *base, region)?;
        info!(
            "Loaded {} image at 0x{:08x}",
            bytefmt::format(image.len() as u64),
            image.base_address()
        );

        program(&mut p, &image)?;

        if !*no_go {
            p.go(image.base_address())
                .context("Error starting image")?;
        }

        return Ok(());
    }

    p.sync().context("Error connecting to bootloader")?;

    match o.operation {
        Operation::Info => {
            let i = p.info()?;
            println!(
                "Flash:       0x{:08x} - 0x{:08x} ({})",
                i.flash_base,
                i.flash_base as u64 + i.flash_size as u64,
                bytefmt::format(i.flash_size as u64)
            );
            println!("Erase unit:  {}", bytefmt::format(i.erase_unit as u64));
            println!("Write unit:  {}", bytefmt::format(i.write_unit as u64));
            println!("Max chunk:   {}", bytefmt::format(i.max_chunk as u64));
        }
        Operation::Read { addr, len } => {
            let mut data = vec![0u8; len as usize];
            p.read_mem(addr, &mut data)
                .with_context(|| format!("Error reading 0x{:08x}", addr))?;

            for (i, line) in data.chunks(16).enumerate() {
                println!("{:08x}: {}", addr as usize + i * 16, hex::encode(line));
            }
        }
        Operation::Checksum { addr, len } => {
            println!("0x{:08x}", p.checksum(addr, len)?);
        }
        Operation::Crc { addr, len } => {
            println!("0x{:08x}", p.crc(addr, len)?);
        }
        Operation::Go { addr } => p.go(addr)?,
        Operation::Sync => info!("Bootloader connected!"),
        Operation::Program { .. } => (),
    }

    Ok(())
}

fn is_elf(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut f = File::open(path).with_context(|| format!("Error opening {}", path.display()))?;

    Ok(f.read_exact(&mut magic).is_ok() && &magic == b"\x7fELF")
}

fn load_image(path: &Path, base: Option<u32>, region: FlashRegion) -> Result<Image> {
    if is_elf(path)? {
        if base.is_some() {
            warn!("Ignoring --base for ELF image");
        }
        return load_elf(path, |addr, size| region.contains(addr, size))
            .with_context(|| format!("Error loading ELF {}", path.display()));
    }

    let base = base.context("--base is required for binary images")?;
    Image::load_bin(path, base).with_context(|| format!("Error loading {}", path.display()))
}

fn program<P: Read + std::io::Write>(p: &mut Programmer<P>, image: &Image) -> Result<()> {
    let (tx, rx) = sync_channel(16);
    let renderer = thread::spawn(move || render(rx));

    let r = p.program(image, Some(tx));

    // Sender is dropped by program, so the renderer exits
    if renderer.join().is_err() {
        warn!("Progress renderer panicked");
    }

    r.context("Programming failed")
}

fn render(rx: Receiver<ProgressReport>) {
    let style = ProgressStyle::default_bar()
        .template("{msg:24} [{bar:40}] {pos}/{len}")
        .progress_chars("=> ");

    let mut current: Option<(State, ProgressBar)> = None;

    for r in rx.iter() {
        let stage_changed = match &current {
            Some((stage, _)) => *stage != r.stage,
            None => true,
        };

        if stage_changed {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }

            let bar = ProgressBar::new(r.max as u64);
            bar.set_style(style.clone());
            bar.set_message(r.stage.label());
            current = Some((r.stage, bar));
        }

        if let Some((_, bar)) = &current {
            bar.set_length(r.max as u64);
            bar.set_position(r.progress as u64);
        }
    }

    if let Some((_, bar)) = current {
        bar.finish();
    }
}

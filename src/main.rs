#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_bootloader::crc::SoftCrc;
use stm32_bootloader::launch::EntryDescriptor;
use stm32_bootloader::protect::ProtectionMode;
use stm32_bootloader::sim::{SimFlash, SimLed, SimSystem};
use stm32_bootloader::{linux, Bootloader, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    #[structopt(subcommand)]
    op: Operation,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Serve the bootloader protocol on the port against a simulated STM32F429
    Simulate {
        /// Application image to preload at the application base
        #[structopt(long)]
        image: Option<PathBuf>,

        /// Start the resident application instead of the command loop
        #[structopt(long)]
        boot: bool,
    },
    /// Read the bootloader version
    Version,
    /// List the supported command codes
    Help,
    /// Read the MCU chip ID
    ChipId,
    /// Read the flash read protection level
    Rdp,
    /// Jump to an address
    Go {
        #[structopt(parse(try_from_str = parse_int::parse::<u32>))]
        address: u32,
    },
    /// Erase sectors, or the whole bank with sector 0xFF
    Erase {
        #[structopt(parse(try_from_str = parse_int::parse::<u8>))]
        sector: u8,
        #[structopt(parse(try_from_str = parse_int::parse::<u8>), default_value = "1")]
        count: u8,
    },
    /// Write a file into device memory
    Write {
        #[structopt(parse(try_from_str = parse_int::parse::<u32>))]
        address: u32,
        file: PathBuf,
    },
    /// Protect sectors (bit n selects sector n)
    Protect {
        #[structopt(parse(try_from_str = parse_int::parse::<u16>))]
        sectors: u16,
        /// Protection mode: `write` or `read-write`
        #[structopt(long, default_value = "write", parse(try_from_str = parse_mode))]
        mode: ProtectionMode,
    },
    /// Remove all sector protection
    Unprotect,
    /// Read the sector protection state
    ProtectionStatus,
}

fn parse_mode(s: &str) -> Result<ProtectionMode, String> {
    match s {
        "write" => Ok(ProtectionMode::WriteOnly),
        "read-write" => Ok(ProtectionMode::ReadWrite),
        _ => Err(format!("unknown protection mode '{}'", s)),
    }
}

fn exit_on_transfer(entry: EntryDescriptor) -> ! {
    info!(
        "Simulated target left the bootloader: sp={:x?} entry={:#010x}",
        entry.stack_pointer, entry.entry_point
    );
    std::process::exit(0)
}

fn simulate(o: &Args, image: &Option<PathBuf>, boot: bool) -> anyhow::Result<()> {
    let mut flash = SimFlash::new();

    if let Some(path) = image {
        let data = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
        info!(
            "Loading {} image at {:#010x}",
            bytefmt::format(data.len() as u64),
            o.options.app_base
        );
        flash.load(o.options.app_base, &data);
    }

    let port = linux::open(&o.port, o.baud).context("opening serial port")?;

    let mut bl = Bootloader::new(
        port,
        flash,
        SoftCrc::new(),
        SimLed::default(),
        SimSystem::with_handler(exit_on_transfer),
        o.options.clone(),
    );

    info!("Simulated bootloader listening on {}", o.port);

    match bl.boot(!boot) {
        Ok(never) => match never {},
        Err(e) => Err(e).context("bootloader stopped"),
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Operation::Simulate { image, boot } = &o.op {
        return simulate(&o, image, *boot);
    }

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .context("connecting to serial port")?;

    match &o.op {
        Operation::Simulate { .. } => unreachable!(),
        Operation::Version => {
            let v = p.version()?;
            info!("Bootloader version: {}.{}", v >> 4, v & 0x0F);
        }
        Operation::Help => {
            let cmds = p.help()?;
            info!("Supported commands: {:02x?}", cmds);
        }
        Operation::ChipId => {
            info!("Chip ID: {:#05x}", p.chip_id()?);
        }
        Operation::Rdp => {
            info!("RDP level: {:#04x}", p.rdp_level()?);
        }
        Operation::Go { address } => {
            let s = p.go(*address)?;
            info!("Go {:#010x}: {:?}", address, s);
        }
        Operation::Erase { sector, count } => {
            let s = p.erase(*sector, *count)?;
            if s != 0 {
                bail!("erase failed with status {:#04x}", s);
            }
            info!("Erase complete");
        }
        Operation::Write { address, file } => {
            let data = std::fs::read(file).with_context(|| format!("reading {:?}", file))?;
            info!(
                "Writing {} to {:#010x}",
                bytefmt::format(data.len() as u64),
                address
            );

            let pb = ProgressBar::new(data.len() as u64);
            pb.set_style(ProgressStyle::default_bar().template("{bar:40} {bytes}/{total_bytes}"));

            let s = p.write_memory(*address, &data, |n| pb.inc(n as u64))?;
            pb.finish();

            if s != 0 {
                bail!("write failed with status {:#04x}", s);
            }
            info!("Write complete");
        }
        Operation::Protect { sectors, mode } => {
            let s = p.enable_protection(*sectors, *mode)?;
            info!("Protect {:#05x} ({:?}): status {:#04x}", sectors, mode, s);
        }
        Operation::Unprotect => {
            let s = p.disable_protection()?;
            info!("Unprotect: status {:#04x}", s);
        }
        Operation::ProtectionStatus => {
            let s = p.protection_status()?;
            info!(
                "Sector protection: {:#05x}, mode: {}",
                s & 0x0FFF,
                if s & 0x8000 != 0 { "read-write" } else { "write" }
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::from_iter_safe(argv).unwrap()
    }

    #[test]
    fn test_protect_binary_mask() {
        let a = args(&["stm32-bootloader", "protect", "0b1111", "--mode", "read-write"]);
        match a.op {
            Operation::Protect { sectors, mode } => {
                assert_eq!(sectors, 0x000F);
                assert_eq!(mode, ProtectionMode::ReadWrite);
            }
            op => panic!("unexpected operation {:?}", op),
        }
    }

    #[test]
    fn test_integer_prefixes() {
        let a = args(&["stm32-bootloader", "erase", "0o17", "0x2"]);
        match a.op {
            Operation::Erase { sector, count } => {
                assert_eq!(sector, 15);
                assert_eq!(count, 2);
            }
            op => panic!("unexpected operation {:?}", op),
        }

        let a = args(&["stm32-bootloader", "--app-base", "0x0800_C000", "go", "536870912"]);
        assert_eq!(a.options.app_base, 0x0800_C000);
        match a.op {
            Operation::Go { address } => assert_eq!(address, 0x2000_0000),
            op => panic!("unexpected operation {:?}", op),
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(Args::from_iter_safe(&["stm32-bootloader", "erase", "0x100"]).is_err());
        assert!(Args::from_iter_safe(&["stm32-bootloader", "protect", "0x10000"]).is_err());
    }
}

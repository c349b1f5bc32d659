#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use avr_uart_loader::{Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Operation,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Check a bootloader is listening
    Whoami,

    /// Print signature, page size and boot section start
    Info,

    /// Print the board specific help text
    Help,

    /// Read flash into a file
    Read {
        /// Start address, must be page aligned
        #[structopt(long, default_value = "0", parse(try_from_str = parse_number))]
        address: u32,

        /// Number of bytes to read, defaults to everything below the boot section
        #[structopt(long, parse(try_from_str = parse_number))]
        length: Option<u32>,

        /// Output file
        #[structopt(long)]
        file: PathBuf,
    },

    /// Program a binary image
    Write {
        /// Start address, must be page aligned
        #[structopt(long, default_value = "0", parse(try_from_str = parse_number))]
        address: u32,

        /// Raw binary image
        #[structopt(long)]
        file: PathBuf,

        /// Skip reading the image back
        #[structopt(long)]
        no_verify: bool,

        /// Start the application once done
        #[structopt(long)]
        exit: bool,
    },

    /// Compare flash against a binary image
    Verify {
        /// Start address, must be page aligned
        #[structopt(long, default_value = "0", parse(try_from_str = parse_number))]
        address: u32,

        /// Raw binary image
        #[structopt(long)]
        file: PathBuf,
    },

    /// Print a single page as hex
    Dump {
        /// Address within the page
        #[structopt(long, default_value = "0", parse(try_from_str = parse_number))]
        address: u32,
    },

    /// Leave the bootloader and start the application
    Exit,
}

fn parse_number(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn progress_bar(len: usize, action: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:8} [{bar:40}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("=> "),
    );
    pb.set_message(action);
    pb
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .map_err(|e| anyhow!("Error connecting to serial port {}: {:?}", o.port, e))?;

    info!("Connecting to bootloader");

    let device = p
        .init()
        .context("Error connecting to bootloader")?;

    info!("Bootloader connected!");

    match o.command {
        Operation::Whoami => println!("Bootloader found"),
        Operation::Info => {
            println!("Signature:    {}", hex::encode(&device.signature));
            println!("Page size:    {} bytes", device.page_size);
            println!("Boot section: 0x{:05x}", device.boot_start);
            println!(
                "Application:  {}",
                bytefmt::format(device.boot_start as u64)
            );
        }
        Operation::Help => {
            let text = p.help()?;
            println!("{}", String::from_utf8_lossy(&text));
        }
        Operation::Read {
            address,
            length,
            file,
        } => {
            let len = length.unwrap_or(device.boot_start.saturating_sub(address)) as usize;

            let pb = progress_bar(len, "Reading");
            let data = p.read_image(address, len, |n| pb.set_position(n as u64))?;
            pb.finish();

            fs::write(&file, &data)
                .with_context(|| format!("Error writing {}", file.display()))?;
            info!("Read {} to {}", bytefmt::format(len as u64), file.display());
        }
        Operation::Write {
            address,
            file,
            no_verify,
            exit,
        } => {
            let data = fs::read(&file)
                .with_context(|| format!("Error reading {}", file.display()))?;
            info!("Writing {} from {}", bytefmt::format(data.len() as u64), file.display());

            let pb = progress_bar(data.len(), "Writing");
            p.write_image(address, &data, |n| pb.set_position(n as u64))?;
            pb.finish();

            if !no_verify {
                let pb = progress_bar(data.len(), "Verifying");
                p.verify_image(address, &data, |n| pb.set_position(n as u64))?;
                pb.finish();
            }

            if exit {
                p.exit()?;
            }
        }
        Operation::Verify { address, file } => {
            let data = fs::read(&file)
                .with_context(|| format!("Error reading {}", file.display()))?;

            let pb = progress_bar(data.len(), "Verifying");
            p.verify_image(address, &data, |n| pb.set_position(n as u64))?;
            pb.finish();

            info!("Flash matches {}", file.display());
        }
        Operation::Dump { address } => {
            let page = device.page_size as u32;
            let base = p.set_address(address)?;
            let mut data = vec![0u8; page as usize];
            let sum = p.read_page(&mut data)?;

            for (i, line) in data.chunks(16).enumerate() {
                println!("{:05x}: {}", base + i as u32 * 16, hex::encode(line));
            }
            println!("checksum: {:02x}", sum);
        }
        Operation::Exit => p.exit()?,
    }

    Ok(())
}

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};

mod array;
mod bitmap;
mod classify;
mod error;
mod logger;
mod mount;
mod progress;
mod scrub;
mod sparsify;
mod update;
mod volume;
mod walk;

use error::Error;
use logger::Logger;
use volume::Volume;

#[derive(Debug, Parser)]
#[clap(name = "zbfree", version)]
struct Args {
    /// Report only, do not modify the volume
    #[clap(short = 'n', long, global = true)]
    dry_run: bool,

    /// Set verbosity of the output (can be used multiple times)
    #[clap(short, long, global = true, parse(from_occurrences))]
    verbose: u32,

    /// Log file
    #[clap(short, long, global = true, parse(from_os_str), value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Print the summaries as JSON
    #[clap(long, global = true)]
    json: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Turn allocated all-zero blocks of the named files into holes
    Sparsify {
        /// Drive path
        #[clap(parse(from_os_str), value_name = "DRIVE")]
        drive: PathBuf,

        /// Files to sparsify, as paths inside the volume
        #[clap(value_name = "FILE", required = true)]
        files: Vec<String>,
    },

    /// Overwrite every unallocated block with the fill byte
    Scrub {
        /// Drive path
        #[clap(parse(from_os_str), value_name = "DRIVE")]
        drive: PathBuf,

        /// Fill byte, decimal or 0x-prefixed (0-255)
        #[clap(short, long, value_name = "VAL", default_value = "0", parse(try_from_str = parse_fill))]
        fill: u8,
    },
}

fn main()
{
    let args = Args::parse();

    let mut log_file = None;

    // Create the log file in rw mode.

    if let Some(path) = &args.log_file {
        let f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .open(path);

        log_file = match f {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("error: {}: {}", &path.display(), &e);
                None
            }
        };
    }

    let mut logger = Logger::new(args.verbose, log_file);

    if let Err(e) = run(&args, &mut logger) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args, logger: &mut Logger) -> anyhow::Result<()>
{
    match &args.command {
        Command::Sparsify { drive, files } => {
            let state = mount::check_mount_state(drive)
                .with_context(|| drive.display().to_string())?;
            if state.mounted {
                bail!("{}: {}", drive.display(), Error::Mounted);
            }

            let mut vol = open_volume(drive, args.dry_run)?;

            for file in files {
                logger.logln(1, &format!("processing {}", file));

                let mut record = match vol.resolve_path(file) {
                    Ok(v) => v,
                    Err(e) => {
                        eprintln!("error: {}: {:#}", file, anyhow::Error::from(e));
                        continue;
                    }
                };

                match sparsify::sparsify_file(&mut vol, &mut record, args.dry_run, logger) {
                    Ok(stats) => print_sparsify_summary(file, &stats, args.json),
                    Err(e) => {
                        eprintln!("error: {}: {:#}", file, anyhow::Error::from(e));
                        continue;
                    }
                }
            }

            vol.close().with_context(|| drive.display().to_string())?;
        }

        Command::Scrub { drive, fill } => {
            let state = mount::check_mount_state(drive)
                .with_context(|| drive.display().to_string())?;
            if state.mounted && !state.read_only {
                bail!("{}: {}", drive.display(), Error::MountedRw);
            }

            let mut vol = open_volume(drive, args.dry_run)?;

            let stats = scrub::scrub_volume(&mut vol, *fill, args.dry_run, logger)
                .with_context(|| drive.display().to_string())?;

            vol.close().with_context(|| drive.display().to_string())?;

            print_scrub_summary(&stats, args.json);
        }
    }

    Ok(())
}

/// Opens the drive and loads the volume metadata.
/// A dry run never writes, so the drive itself is opened read-only.
fn open_volume(drive: &PathBuf, dry_run: bool) -> anyhow::Result<Volume<File>>
{
    let file = OpenOptions::new()
        .create(false)
        .read(true)
        .write(!dry_run)
        .open(drive)
        .with_context(|| drive.display().to_string())?;

    let vol = Volume::open(file).with_context(|| drive.display().to_string())?;

    Ok(vol)
}

fn print_sparsify_summary(file: &str, stats: &sparsify::SparsifyStats, json: bool)
{
    if json {
        println!(
            "{}",
            serde_json::json!({
                "file": file,
                "freed": stats.freed,
                "scanned": stats.scanned,
                "total": stats.total,
            })
        );
    } else {
        println!("{}: {}/{}/{}", file, stats.freed, stats.scanned, stats.total);
    }
}

fn print_scrub_summary(stats: &scrub::ScrubStats, json: bool)
{
    if json {
        match serde_json::to_string(stats) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("error: {}", e),
        }
    } else {
        println!("{}/{}/{}", stats.modified, stats.free, stats.total_blocks);
    }
}

/// Parses a fill byte, accepting decimal and 0x-prefixed hexadecimal.
fn parse_fill(raw: &str) -> Result<u8, String>
{
    let (digits, radix) = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (raw, 10),
    };

    match u16::from_str_radix(digits, radix) {
        Ok(v) if v <= 0xff => Ok(v as u8),
        Ok(_) => Err("fill value must be 0-255".to_owned()),
        Err(_) => Err(format!("invalid fill value: {}", raw)),
    }
}

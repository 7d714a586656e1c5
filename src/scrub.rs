use std::io::{Read, Seek, Write};

use serde::Serialize;

use crate::classify::is_uniform;
use crate::error::Result;
use crate::logger::Logger;
use crate::progress::Progress;
use crate::update::scrub_free_block;
use crate::volume::Volume;
use crate::walk::FreeScanner;


/// Final tallies of one free-space scrub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ScrubStats {
    /// Free blocks that had to be overwritten.
    pub modified: u64,
    /// Free blocks visited.
    pub free: u64,
    /// Size of the volume, in blocks.
    pub total_blocks: u64,
}


/// Overwrites every unallocated block that does not already uniformly hold
/// `fill` with one block's worth of it. Allocation metadata is not touched.
///
/// The progress total is the free-block counter captured before the scan
/// starts; it is deliberately not re-read while scanning. Dry-run mode
/// reports identical tallies without writing.
pub fn scrub_volume<D: Read + Write + Seek>(
    vol: &mut Volume<D>,
    fill: u8,
    dry_run: bool,
    logger: &mut Logger,
) -> Result<ScrubStats>
{
    let block_size = vol.block_size() as usize;
    let mut progress = Progress::new(vol.free_blocks() as u64);
    let mut last_tenths = -1;

    let fill_block = vec![fill; block_size];
    let mut buf = vec![u8::default(); block_size];
    let mut scanner = FreeScanner::new(vol);

    let mut modified = 0;

    while let Some(addr) = scanner.next_free(vol) {
        progress.advance();

        if progress.tenths() != last_tenths {
            logger.status(1, &format!("\r{:4.1}%", progress.percent()));
            last_tenths = progress.tenths();
        }

        vol.read_block(addr, &mut buf)?;

        if !is_uniform(&buf, fill) {
            modified += 1;
            scrub_free_block(vol, addr, &fill_block, dry_run)?;
        }
    }

    logger.status(1, "\n");

    Ok(ScrubStats {
        modified,
        free: progress.visited(),
        total_blocks: vol.total_blocks() as u64,
    })
}

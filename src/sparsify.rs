use std::io::{Read, Seek, Write};

use serde::Serialize;

use crate::classify::is_uniform;
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::progress::Progress;
use crate::update::free_file_block;
use crate::volume::{FileRecord, Volume};
use crate::walk::FileWalker;


/// Final tallies of one sparsification run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SparsifyStats {
    /// Blocks released back to the free pool.
    pub freed: u64,
    /// Logical positions visited.
    pub scanned: u64,
    /// Logical positions the file covers.
    pub total: u64,
}


/// Turns every allocated, all-zero data block of `record` into a hole.
///
/// The walk classifies first and mutates after: candidate blocks are
/// collected over a full pass, so an aborted walk leaves the file's
/// metadata completely untouched. When anything was freed, the file record
/// is written back and the dirty bitmap and superblock are flushed before
/// returning. Dry-run mode reports identical tallies without mutating.
pub fn sparsify_file<D: Read + Write + Seek>(
    vol: &mut Volume<D>,
    record: &mut FileRecord,
    dry_run: bool,
    logger: &mut Logger,
) -> Result<SparsifyStats>
{
    if !record.inode.is_regular() {
        return Err(Error::InvalidFileRecord("not a regular file".to_owned()));
    }

    let block_size = vol.block_size();
    let mut walker = FileWalker::new(&record.inode, block_size)?;
    let mut progress = Progress::new(walker.positions());
    let mut last_tenths = -1;

    let mut buf = vec![u8::default(); block_size as usize];
    let mut matches = Vec::new();

    while let Some(pos) = walker.next_position(vol)? {
        progress.advance();

        if progress.tenths() != last_tenths {
            logger.status(1, &format!("\r{:4.1}%", progress.percent()));
            last_tenths = progress.tenths();
        }

        // Holes count toward the total but are never read.
        if let Some(addr) = pos.addr {
            vol.read_block(addr, &mut buf)?;

            if is_uniform(&buf, 0) {
                matches.push(pos);
            }
        }
    }

    logger.status(1, "\n");

    let mut freed = 0;
    for pos in &matches {
        if free_file_block(vol, record, pos, dry_run) {
            freed += 1;
        }
    }

    if freed > 0 && !dry_run {
        vol.write_inode(record.ino, &record.inode)?;
        vol.flush()?;
    }

    Ok(SparsifyStats {
        freed,
        scanned: progress.visited(),
        total: progress.total(),
    })
}

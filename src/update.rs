use std::io::{Read, Seek, Write};

use crate::error::Result;
use crate::volume::{DirtyKind, FileRecord, Volume};
use crate::walk::{FilePosition, Placement};


/// Releases one classified-as-empty file block back to the free pool.
///
/// The bitmap bit, both free counters and the file record change together;
/// everything happens in the volume's buffers, so no partially-applied state
/// is ever observable. The block's content is not rewritten: the caller has
/// already established that it uniformly holds the fill value.
///
/// Returns `false` (and applies nothing) when the position is a hole or its
/// bitmap bit is already clear, so a caller can never double-free a block.
/// In dry-run mode the same answer is computed but nothing is mutated.
pub fn free_file_block<D: Read + Write + Seek>(
    vol: &mut Volume<D>,
    record: &mut FileRecord,
    pos: &FilePosition,
    dry_run: bool,
) -> bool
{
    let addr = match pos.addr {
        Some(v) => v,
        None => return false,
    };

    if !vol.bitmap_test(addr) {
        return false;
    }

    if dry_run {
        return true;
    }

    vol.bitmap_clear(addr);
    vol.group_free_increment(addr);
    vol.volume_free_increment();

    // The inode counts blocks of 512 bytes.
    let sectors = (vol.block_size() / 512) as u32;
    record.inode.i_blocks -= sectors;

    // Direct blocks need to be zeroed in the inode; indirect positions are
    // represented by the walk skipping them from now on.
    if let Placement::Direct(slot) = pos.placement {
        record.inode.i_block[slot] = 0;
    }

    vol.mark_dirty(DirtyKind::Bitmap);
    vol.mark_dirty(DirtyKind::Superblock);

    true
}


/// Overwrites one unallocated block with the prepared fill pattern.
/// `fill_block` must be one full block of the fill byte. No allocation
/// metadata changes; re-scrubbing an already-uniform block is a no-op from
/// the caller's point of view.
pub fn scrub_free_block<D: Read + Write + Seek>(
    vol: &mut Volume<D>,
    addr: u32,
    fill_block: &[u8],
    dry_run: bool,
) -> Result<()>
{
    debug_assert!(!vol.bitmap_test(addr));

    if dry_run {
        return Ok(());
    }

    vol.write_block(addr, fill_block)
}

use std::io::{Read, Seek, Write};

use crate::error::{Error, Result};
use crate::volume::layout::{Inode, DIND_SLOT, DIRECT_SLOTS, IND_SLOT, TIND_SLOT};
use crate::volume::Volume;


/// Where a logical position's address is recorded.
/// Freeing a `Direct` position also requires rewriting the inode slot;
/// an `Indirect` position only receives bitmap and counter changes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Direct(usize),
    Indirect,
}


/// One logical block position of a file.
/// `addr` is `None` for positions that are already holes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FilePosition {
    pub index: u64,
    pub addr: Option<u32>,
    pub placement: Placement,
}


/// Walks a file's logical block positions in increasing order, resolving
/// single, double and triple indirection on demand.
///
/// The walker is pumped: each call to [`FileWalker::next_position`] borrows
/// the volume just long enough to read whatever indirection block the next
/// position needs. One block per indirection level is cached, so a
/// sequential walk reads each indirection block exactly once.
#[derive(Debug)]
pub struct FileWalker {
    roots: [u32; 15],
    positions: u64,
    next_index: u64,
    entries_per_block: u64,
    cache: [Option<CachedBlock>; 3],
}

#[derive(Debug)]
struct CachedBlock {
    addr: u32,
    entries: Vec<u32>,
}

impl FileWalker {
    /// Prepares a walk over `inode`. Refuses inodes whose block list does
    /// not use the direct/indirect scheme.
    pub fn new(inode: &Inode, block_size: u64) -> Result<Self>
    {
        let flags = inode.flags();

        if flags.has_extents() {
            return Err(Error::InvalidFileRecord("extent-mapped inode".to_owned()));
        }
        if flags.has_inline_data() {
            return Err(Error::InvalidFileRecord("inode with inline data".to_owned()));
        }

        Ok(Self {
            roots: inode.i_block,
            positions: (inode.size() + block_size - 1) / block_size,
            next_index: 0,
            entries_per_block: block_size / 4,
            cache: [None, None, None],
        })
    }

    /// The number of logical positions this walk covers.
    pub fn positions(&self) -> u64
    {
        self.positions
    }

    /// Produces the next logical position, or `None` at the end of the file.
    pub fn next_position<D: Read + Write + Seek>(
        &mut self,
        vol: &mut Volume<D>,
    ) -> Result<Option<FilePosition>>
    {
        if self.next_index >= self.positions {
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;

        let (addr, placement) = self.resolve(index, vol)?;

        Ok(Some(FilePosition {
            index,
            addr: if addr == 0 { None } else { Some(addr) },
            placement,
        }))
    }

    fn resolve<D: Read + Write + Seek>(
        &mut self,
        index: u64,
        vol: &mut Volume<D>,
    ) -> Result<(u32, Placement)>
    {
        if index < DIRECT_SLOTS as u64 {
            return Ok((self.roots[index as usize], Placement::Direct(index as usize)));
        }

        let epb = self.entries_per_block;
        let mut i = index - DIRECT_SLOTS as u64;

        let (root_slot, depth) = if i < epb {
            (IND_SLOT, 1)
        } else {
            i -= epb;
            if i < epb * epb {
                (DIND_SLOT, 2)
            } else {
                i -= epb * epb;
                (TIND_SLOT, 3)
            }
        };

        let mut cur = self.roots[root_slot];

        for level in 0..depth {
            // A zero pointer makes the whole subtree holes; nothing to read.
            if cur == 0 {
                return Ok((0, Placement::Indirect));
            }

            let divisor = epb.pow((depth - 1 - level) as u32);
            let step = ((i / divisor) % epb) as usize;

            let entries = self.cached_entries(cur, level, vol)?;
            cur = entries[step];
        }

        Ok((cur, Placement::Indirect))
    }

    /// Returns the address entries of the indirection block `addr`, reading
    /// it through `vol` unless the per-level cache already holds it.
    fn cached_entries<D: Read + Write + Seek>(
        &mut self,
        addr: u32,
        level: usize,
        vol: &mut Volume<D>,
    ) -> Result<&[u32]>
    {
        let cached = self.cache[level].as_ref().map(|c| c.addr);

        if cached != Some(addr) {
            let mut buf = vec![u8::default(); vol.block_size() as usize];

            vol.read_block(addr, &mut buf).map_err(|e| match e {
                Error::BlockRead { addr, source } => Error::IterationAborted { addr, source },
                other => other,
            })?;

            let entries = buf
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();

            self.cache[level] = Some(CachedBlock { addr, entries });
        }

        match &self.cache[level] {
            Some(cached) => Ok(&cached.entries),
            None => unreachable!(),
        }
    }
}


/// Scans the volume for unallocated block addresses, in increasing order.
/// Derived from the bitmap state buffered at open time.
#[derive(Debug)]
pub struct FreeScanner {
    next: u32,
    end: u32,
}

impl FreeScanner {
    pub fn new<D: Read + Write + Seek>(vol: &Volume<D>) -> Self
    {
        Self {
            next: vol.first_data_block(),
            end: vol.total_blocks(),
        }
    }

    /// Produces the next free block address, or `None` once the volume is
    /// exhausted.
    pub fn next_free<D: Read + Write + Seek>(&mut self, vol: &Volume<D>) -> Option<u32>
    {
        while self.next < self.end {
            let addr = self.next;
            self.next += 1;

            if !vol.bitmap_test(addr) {
                return Some(addr);
            }
        }

        None
    }
}


#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::volume::layout::Inode;
    use crate::volume::testutil::ImageBuilder;
    use super::{FilePosition, FileWalker, FreeScanner, Placement};

    fn blocks(n: usize, byte: u8) -> Vec<Option<Vec<u8>>>
    {
        (0..n).map(|_| Some(vec![byte; 1024])).collect()
    }

    #[test]
    fn direct_only()
    {
        let mut img = ImageBuilder::new(64);
        let (_, addrs) = img.add_file("f", &blocks(3, 1));
        let mut vol = img.build_volume();

        let record = vol.resolve_path("f").unwrap();
        let mut walker = FileWalker::new(&record.inode, vol.block_size()).unwrap();

        assert_eq!(walker.positions(), 3);

        for i in 0..3 {
            let pos = walker.next_position(&mut vol).unwrap().unwrap();
            assert_eq!(
                pos,
                FilePosition {
                    index: i,
                    addr: Some(addrs[i as usize]),
                    placement: Placement::Direct(i as usize),
                }
            );
        }

        assert!(walker.next_position(&mut vol).unwrap().is_none());
    }

    #[test]
    fn holes_are_yielded_without_addresses()
    {
        let mut img = ImageBuilder::new(64);
        let slots = vec![Some(vec![1; 1024]), None, Some(vec![2; 1024])];
        let (_, addrs) = img.add_file("f", &slots);
        let mut vol = img.build_volume();

        let record = vol.resolve_path("f").unwrap();
        let mut walker = FileWalker::new(&record.inode, vol.block_size()).unwrap();

        let first = walker.next_position(&mut vol).unwrap().unwrap();
        assert_eq!(first.addr, Some(addrs[0]));

        let hole = walker.next_position(&mut vol).unwrap().unwrap();
        assert_eq!(hole.index, 1);
        assert_eq!(hole.addr, None);
        assert_eq!(hole.placement, Placement::Direct(1));

        let last = walker.next_position(&mut vol).unwrap().unwrap();
        assert_eq!(last.addr, Some(addrs[2]));
    }

    #[test]
    fn single_indirect_positions()
    {
        let mut img = ImageBuilder::new(64);
        let (_, addrs) = img.add_file("f", &blocks(14, 3));
        let mut vol = img.build_volume();

        let record = vol.resolve_path("f").unwrap();
        let mut walker = FileWalker::new(&record.inode, vol.block_size()).unwrap();

        let mut seen = Vec::new();
        while let Some(pos) = walker.next_position(&mut vol).unwrap() {
            seen.push(pos);
        }

        assert_eq!(seen.len(), 14);
        assert_eq!(seen[11].placement, Placement::Direct(11));
        assert_eq!(seen[12].placement, Placement::Indirect);
        assert_eq!(seen[13].placement, Placement::Indirect);
        assert_eq!(seen[12].addr, Some(addrs[12]));
        assert_eq!(seen[13].addr, Some(addrs[13]));
    }

    #[test]
    fn double_indirect_positions()
    {
        let count = 12 + 256 + 5;
        let mut img = ImageBuilder::new(count as u32 + 24);
        let (_, addrs) = img.add_file("f", &blocks(count, 9));
        let mut vol = img.build_volume();

        let record = vol.resolve_path("f").unwrap();
        let mut walker = FileWalker::new(&record.inode, vol.block_size()).unwrap();

        let mut seen = Vec::new();
        while let Some(pos) = walker.next_position(&mut vol).unwrap() {
            seen.push(pos);
        }

        assert_eq!(seen.len(), count);
        for (i, pos) in seen.iter().enumerate() {
            assert_eq!(pos.index, i as u64);
            assert_eq!(pos.addr, Some(addrs[i]));
        }
        assert_eq!(seen[count - 1].placement, Placement::Indirect);
    }

    #[test]
    fn zero_indirect_root_is_a_hole_subtree()
    {
        let mut vol = ImageBuilder::new(64).build_volume();

        // 20 positions, no block pointers at all: everything is a hole and
        // nothing is read from the volume.
        let inode = Inode {
            i_mode: 0x81a4,
            i_size: 20 * 1024,
            ..Inode::default()
        };
        let mut walker = FileWalker::new(&inode, vol.block_size()).unwrap();

        let mut count = 0;
        while let Some(pos) = walker.next_position(&mut vol).unwrap() {
            assert_eq!(pos.addr, None);
            count += 1;
        }

        assert_eq!(count, 20);
    }

    #[test]
    fn empty_file_has_no_positions()
    {
        let mut vol = ImageBuilder::new(64).build_volume();
        let inode = Inode {
            i_mode: 0x81a4,
            ..Inode::default()
        };

        let mut walker = FileWalker::new(&inode, vol.block_size()).unwrap();

        assert_eq!(walker.positions(), 0);
        assert!(walker.next_position(&mut vol).unwrap().is_none());
    }

    #[test]
    fn unreadable_indirection_block_aborts()
    {
        let mut vol = ImageBuilder::new(64).build_volume();

        let mut i_block = [0u32; 15];
        for slot in i_block.iter_mut().take(12) {
            *slot = 20;
        }
        // Point the single-indirect root past the end of the image.
        i_block[12] = 4096;

        let inode = Inode {
            i_mode: 0x81a4,
            i_size: 13 * 1024,
            i_block,
            ..Inode::default()
        };
        let mut walker = FileWalker::new(&inode, vol.block_size()).unwrap();

        for _ in 0..12 {
            walker.next_position(&mut vol).unwrap();
        }

        let res = walker.next_position(&mut vol);
        assert!(matches!(res, Err(Error::IterationAborted { addr: 4096, .. })));
    }

    #[test]
    fn walker_restarts_from_scratch()
    {
        let mut img = ImageBuilder::new(64);
        let (_, addrs) = img.add_file("f", &blocks(14, 5));
        let mut vol = img.build_volume();
        let record = vol.resolve_path("f").unwrap();

        let collect = |vol: &mut _| {
            let mut walker = FileWalker::new(&record.inode, 1024).unwrap();
            let mut seen = Vec::new();
            while let Some(pos) = walker.next_position(vol).unwrap() {
                seen.push(pos.addr);
            }
            seen
        };

        let first = collect(&mut vol);
        let second = collect(&mut vol);

        assert_eq!(first, second);
        assert_eq!(first[13], Some(addrs[13]));
    }

    #[test]
    fn refuses_extent_mapped_inode()
    {
        let inode = Inode {
            i_mode: 0x81a4,
            i_flags: 0x80000,
            ..Inode::default()
        };

        let res = FileWalker::new(&inode, 1024);

        assert!(matches!(res, Err(Error::InvalidFileRecord(_))));
    }

    #[test]
    fn free_scanner_ascending()
    {
        let mut img = ImageBuilder::new(16);
        img.add_file("f", &blocks(2, 1));
        let first_free = img.first_free();
        let vol = img.build_volume();

        let mut scanner = FreeScanner::new(&vol);
        let mut seen = Vec::new();
        while let Some(addr) = scanner.next_free(&vol) {
            seen.push(addr);
        }

        let expected: Vec<u32> = (first_free..16).collect();
        assert_eq!(seen, expected);
        assert_eq!(seen.len() as u64, vol.count_free_bitmap_bits());
    }

    #[test]
    fn free_scanner_empty_volume_region()
    {
        let mut img = ImageBuilder::new(12);
        img.add_file("f", &blocks(2, 1));
        let vol = img.build_volume();

        // Blocks 1..=9 are metadata, 10 and 11 hold the file: nothing free.
        let mut scanner = FreeScanner::new(&vol);
        assert!(scanner.next_free(&vol).is_none());
    }
}

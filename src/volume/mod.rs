#![allow(dead_code)]
use std::io::{Read, Seek, SeekFrom, Write};

use bincode::Options;

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::walk::FileWalker;

pub mod layout;
#[cfg(test)]
pub mod testutil;

use layout::{
    codec,
    DirEntryHeader,
    GroupDescriptor,
    IncompatFeatures,
    Inode,
    RoCompatFeatures,
    State,
    SuperBlock,
    DIR_ENTRY_HEADER_SIZE,
    EXT2_MAGIC,
    GROUP_DESC_SIZE,
    INODE_STRUCT_SIZE,
    ROOT_INO,
    SUPERBLOCK_OFFSET,
};


/// Metadata record of one file, obtained through [`Volume::resolve_path`].
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub ino: u32,
    pub inode: Inode,
}


/// Buffered metadata structures that can be marked for write-back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirtyKind {
    Bitmap,
    Superblock,
}


/// An opened filesystem volume.
///
/// The superblock, the group descriptor table and every group's block bitmap
/// are buffered in memory at open time. All metadata mutations go to the
/// buffers; [`Volume::flush`] writes the dirty structures back in one batch,
/// so a mutation is either fully visible on disk or not at all.
#[derive(Debug)]
pub struct Volume<D> {
    disk: D,
    sb: SuperBlock,
    groups: Vec<GroupDescriptor>,
    bitmaps: Vec<Bitmap>,
    block_size: u64,
    dirty_bitmap: bool,
    dirty_super: bool,
}

impl<D: Read + Write + Seek> Volume<D> {
    /// Loads and validates the volume metadata from `disk`.
    pub fn open(mut disk: D) -> Result<Self>
    {
        disk.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))
            .map_err(|e| Error::Open(e.to_string()))?;
        let sb: SuperBlock = codec()
            .deserialize_from(&mut disk)
            .map_err(|e| Error::Open(e.to_string()))?;

        check_superblock(&sb)?;

        let block_size = sb.block_size();
        let group_count = sb.group_count();

        // The descriptor table lives in the block after the superblock.
        let gdt_offset = (sb.s_first_data_block as u64 + 1) * block_size;
        let mut table = vec![u8::default(); group_count as usize * GROUP_DESC_SIZE];
        disk.seek(SeekFrom::Start(gdt_offset))
            .map_err(|e| Error::Open(e.to_string()))?;
        disk.read_exact(&mut table)
            .map_err(|e| Error::Open(e.to_string()))?;

        let mut groups = Vec::with_capacity(group_count as usize);
        for i in 0..group_count as usize {
            let desc: GroupDescriptor = codec()
                .deserialize(&table[i * GROUP_DESC_SIZE..])
                .map_err(|e| Error::Open(e.to_string()))?;
            groups.push(desc);
        }

        let mut bitmaps = Vec::with_capacity(groups.len());
        for desc in &groups {
            disk.seek(SeekFrom::Start(desc.bg_block_bitmap as u64 * block_size))
                .map_err(|e| Error::Open(e.to_string()))?;
            let bmp = Bitmap::from_reader(&mut disk, block_size as usize)
                .map_err(|e| Error::Open(e.to_string()))?;
            bitmaps.push(bmp);
        }

        Ok(Self {
            disk,
            sb,
            groups,
            bitmaps,
            block_size,
            dirty_bitmap: false,
            dirty_super: false,
        })
    }

    pub fn block_size(&self) -> u64
    {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32
    {
        self.sb.s_blocks_count
    }

    pub fn first_data_block(&self) -> u32
    {
        self.sb.s_first_data_block
    }

    pub fn free_blocks(&self) -> u32
    {
        self.sb.s_free_blocks_count
    }

    pub fn group_free_blocks(&self, addr: u32) -> u16
    {
        let (group, _) = self.locate(addr);

        self.groups[group].bg_free_blocks_count
    }

    /// Reads one full block into `buf`.
    pub fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>
    {
        debug_assert_eq!(buf.len() as u64, self.block_size);

        self.disk
            .seek(SeekFrom::Start(addr as u64 * self.block_size))
            .map_err(|source| Error::BlockRead { addr, source })?;
        self.disk
            .read_exact(buf)
            .map_err(|source| Error::BlockRead { addr, source })?;

        Ok(())
    }

    /// Writes one full block from `buf`.
    pub fn write_block(&mut self, addr: u32, buf: &[u8]) -> Result<()>
    {
        debug_assert_eq!(buf.len() as u64, self.block_size);

        self.disk
            .seek(SeekFrom::Start(addr as u64 * self.block_size))
            .map_err(|source| Error::BlockWrite { addr, source })?;
        self.disk
            .write_all(buf)
            .map_err(|source| Error::BlockWrite { addr, source })?;

        Ok(())
    }

    pub fn bitmap_test(&self, addr: u32) -> bool
    {
        let (group, bit) = self.locate(addr);

        self.bitmaps[group].test(bit)
    }

    pub fn bitmap_clear(&mut self, addr: u32)
    {
        let (group, bit) = self.locate(addr);

        self.bitmaps[group].clear(bit);
    }

    pub fn bitmap_set(&mut self, addr: u32)
    {
        let (group, bit) = self.locate(addr);

        self.bitmaps[group].set(bit);
    }

    /// Bumps the free-block counter of the group containing `addr`.
    pub fn group_free_increment(&mut self, addr: u32)
    {
        let (group, _) = self.locate(addr);

        self.groups[group].bg_free_blocks_count += 1;
    }

    pub fn volume_free_increment(&mut self)
    {
        self.sb.s_free_blocks_count += 1;
    }

    pub fn volume_free_decrement(&mut self)
    {
        self.sb.s_free_blocks_count -= 1;
    }

    /// Counts the unset bits across all buffered group bitmaps. The free
    /// counters must agree with this after every completed run.
    pub fn count_free_bitmap_bits(&self) -> u64
    {
        let mut total = 0;

        for (group, bmp) in self.bitmaps.iter().enumerate() {
            total += bmp.count_unset(self.group_bits(group));
        }

        total
    }

    pub fn mark_dirty(&mut self, kind: DirtyKind)
    {
        match kind {
            DirtyKind::Bitmap => self.dirty_bitmap = true,
            DirtyKind::Superblock => self.dirty_super = true,
        }
    }

    /// Reads the inode record for `ino`.
    pub fn read_inode(&mut self, ino: u32) -> Result<Inode>
    {
        let offset = self.inode_offset(ino)?;
        let addr = (offset / self.block_size) as u32;

        let mut buf = [u8::default(); INODE_STRUCT_SIZE];
        self.disk
            .seek(SeekFrom::Start(offset))
            .map_err(|source| Error::BlockRead { addr, source })?;
        self.disk
            .read_exact(&mut buf)
            .map_err(|source| Error::BlockRead { addr, source })?;

        let inode = codec()
            .deserialize(&buf)
            .map_err(|e| Error::InvalidFileRecord(e.to_string()))?;

        Ok(inode)
    }

    /// Writes the inode record for `ino` back to disk. Only the 128-byte
    /// base record is touched; any extra inode space is left as it was.
    pub fn write_inode(&mut self, ino: u32, inode: &Inode) -> Result<()>
    {
        let offset = self.inode_offset(ino)?;
        let addr = (offset / self.block_size) as u32;

        let raw = codec()
            .serialize(inode)
            .map_err(|e| Error::InvalidFileRecord(e.to_string()))?;
        self.disk
            .seek(SeekFrom::Start(offset))
            .map_err(|source| Error::BlockWrite { addr, source })?;
        self.disk
            .write_all(&raw)
            .map_err(|source| Error::BlockWrite { addr, source })?;

        Ok(())
    }

    /// Resolves a path, relative to the volume root, to a file record.
    pub fn resolve_path(&mut self, path: &str) -> Result<FileRecord>
    {
        let mut ino = ROOT_INO;

        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let inode = self.read_inode(ino)?;

            if !inode.is_directory() {
                return Err(Error::PathNotFound(path.to_owned()));
            }

            ino = match self.lookup_dir(&inode, comp)? {
                Some(v) => v,
                None => return Err(Error::PathNotFound(path.to_owned())),
            };
        }

        let inode = self.read_inode(ino)?;

        Ok(FileRecord { ino, inode })
    }

    /// Writes all dirty buffered metadata back to disk.
    pub fn flush(&mut self) -> Result<()>
    {
        if self.dirty_bitmap {
            for group in 0..self.groups.len() {
                let addr = self.groups[group].bg_block_bitmap as u64;
                self.disk
                    .seek(SeekFrom::Start(addr * self.block_size))
                    .map_err(Error::Flush)?;
                self.disk
                    .write_all(self.bitmaps[group].as_bytes())
                    .map_err(Error::Flush)?;
            }

            self.dirty_bitmap = false;
        }

        if self.dirty_super {
            let raw = codec()
                .serialize(&self.sb)
                .map_err(|e| Error::Flush(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            self.disk
                .seek(SeekFrom::Start(SUPERBLOCK_OFFSET))
                .map_err(Error::Flush)?;
            self.disk.write_all(&raw).map_err(Error::Flush)?;

            let mut table = Vec::with_capacity(self.groups.len() * GROUP_DESC_SIZE);
            for desc in &self.groups {
                let raw = codec()
                    .serialize(desc)
                    .map_err(|e| Error::Flush(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
                table.extend_from_slice(&raw);
            }

            let gdt_offset = (self.sb.s_first_data_block as u64 + 1) * self.block_size;
            self.disk
                .seek(SeekFrom::Start(gdt_offset))
                .map_err(Error::Flush)?;
            self.disk.write_all(&table).map_err(Error::Flush)?;

            self.dirty_super = false;
        }

        Ok(())
    }

    /// Flushes any remaining dirty metadata and gives the disk handle back.
    pub fn close(mut self) -> Result<D>
    {
        self.flush()?;

        Ok(self.disk)
    }

    /// Maps a block address to its group number and in-group bitmap bit.
    fn locate(&self, addr: u32) -> (usize, u64)
    {
        debug_assert!(addr >= self.sb.s_first_data_block && addr < self.sb.s_blocks_count);

        let rel = (addr - self.sb.s_first_data_block) as u64;
        let per_group = self.sb.s_blocks_per_group as u64;

        ((rel / per_group) as usize, rel % per_group)
    }

    /// The number of bitmap bits actually covering blocks in `group`.
    /// The last group usually covers fewer blocks than a full group.
    fn group_bits(&self, group: usize) -> u64
    {
        let data_blocks = (self.sb.s_blocks_count - self.sb.s_first_data_block) as u64;
        let per_group = self.sb.s_blocks_per_group as u64;
        let start = group as u64 * per_group;

        (data_blocks - start).min(per_group)
    }

    fn inode_offset(&self, ino: u32) -> Result<u64>
    {
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(Error::InvalidFileRecord(format!("inode {} out of range", ino)));
        }

        let group = ((ino - 1) / self.sb.s_inodes_per_group) as usize;
        let index = ((ino - 1) % self.sb.s_inodes_per_group) as u64;
        let table = self.groups[group].bg_inode_table as u64;

        Ok(table * self.block_size + index * self.sb.inode_size())
    }

    /// Scans a directory's data blocks for an entry named `name`.
    fn lookup_dir(&mut self, dir: &Inode, name: &str) -> Result<Option<u32>>
    {
        let mut walker = FileWalker::new(dir, self.block_size)?;
        let mut buf = vec![u8::default(); self.block_size as usize];

        while let Some(pos) = walker.next_position(self)? {
            let addr = match pos.addr {
                Some(v) => v,
                None => continue,
            };

            self.read_block(addr, &mut buf)?;

            let mut off = 0;
            while off + DIR_ENTRY_HEADER_SIZE <= buf.len() {
                let head: DirEntryHeader = codec()
                    .deserialize(&buf[off..])
                    .map_err(|e| Error::InvalidFileRecord(e.to_string()))?;

                let rec_len = head.rec_len as usize;
                let name_end = off + DIR_ENTRY_HEADER_SIZE + head.name_len as usize;
                if rec_len < DIR_ENTRY_HEADER_SIZE
                    || off + rec_len > buf.len()
                    || name_end > buf.len()
                {
                    return Err(Error::InvalidFileRecord(format!(
                        "corrupt directory entry in block {}",
                        addr
                    )));
                }

                if head.inode != 0
                    && &buf[off + DIR_ENTRY_HEADER_SIZE..name_end] == name.as_bytes()
                {
                    return Ok(Some(head.inode));
                }

                off += rec_len;
            }
        }

        Ok(None)
    }
}


/// Validates that a superblock describes a volume this tool can safely
/// mutate. The policy errs on the side of refusal: anything that would make
/// the buffered bitmap and counter model diverge from what other tooling
/// expects on disk is rejected.
fn check_superblock(sb: &SuperBlock) -> Result<()>
{
    if sb.s_magic != EXT2_MAGIC {
        return Err(Error::Open(format!("bad magic: {:#06x}", sb.s_magic)));
    }
    if sb.s_log_block_size > 6 {
        return Err(Error::Open(format!(
            "unsupported block size log: {}",
            sb.s_log_block_size
        )));
    }
    if sb.s_blocks_per_group == 0 || sb.s_inodes_per_group == 0 {
        return Err(Error::Open("zero blocks or inodes per group".to_owned()));
    }
    if sb.s_first_data_block >= sb.s_blocks_count {
        return Err(Error::Open(format!(
            "first data block {} is out of range",
            sb.s_first_data_block
        )));
    }

    let state = State(sb.s_state);
    if state.has_unknown() {
        return Err(Error::Open(format!("unknown `s_state` flags: {:#06x}", state.0)));
    }
    // NOTE: the presence of the `valid` flag is not checked.
    // NOTE: the presence of the `orphan` flag is ignored.
    if state.has_error() {
        return Err(Error::Open("errors present in the filesystem".to_owned()));
    }

    if sb.s_rev_level > 1 {
        return Err(Error::Open(format!("unknown revision level: {}", sb.s_rev_level)));
    }

    // --- dynamic revision level only ---

    if sb.dynamic_rev() {
        let incompat = IncompatFeatures(sb.s_feature_incompat);
        let ro_compat = RoCompatFeatures(sb.s_feature_ro_compat);

        if incompat.has_unknown() {
            return Err(Error::Open(format!(
                "unknown `s_feature_incompat` flags: {:#010x}",
                incompat.get_unknown()
            )));
        }
        if incompat.has_compression() {
            return Err(Error::Open("unsupported feature: compression".to_owned()));
        }
        if incompat.has_recover() {
            return Err(Error::Open(
                "filesystem needs journal recovery: run fsck first".to_owned(),
            ));
        }
        if incompat.has_journal_dev() {
            return Err(Error::Open("filesystem has an external journal device".to_owned()));
        }
        if incompat.has_meta_bg() {
            return Err(Error::Open("unsupported feature: meta_bg".to_owned()));
        }
        if incompat.has_64bit() {
            return Err(Error::Open("unsupported feature: 64bit".to_owned()));
        }
        if incompat.has_mmp() {
            return Err(Error::Open("unsupported feature: mmp".to_owned()));
        }
        if incompat.has_dirdata() {
            return Err(Error::Open("unsupported feature: dirdata".to_owned()));
        }
        if incompat.has_csum_seed() {
            return Err(Error::Open("unsupported feature: csum_seed".to_owned()));
        }
        if incompat.has_encrypt() {
            return Err(Error::Open("filesystem has encrypted blocks".to_owned()));
        }

        if ro_compat.has_unknown() {
            return Err(Error::Open(format!(
                "unknown `s_feature_ro_compat` flags: {:#010x}",
                ro_compat.get_unknown()
            )));
        }
        if ro_compat.has_gdt_csum() || ro_compat.has_metadata_csum() {
            // Checksums cannot be re-sealed after mutating the bitmaps.
            return Err(Error::Open("unsupported feature: metadata checksums".to_owned()));
        }
        if ro_compat.has_bigalloc() {
            return Err(Error::Open("unsupported feature: bigalloc".to_owned()));
        }
        if ro_compat.has_quota() {
            return Err(Error::Open("unsupported feature: quota".to_owned()));
        }
        if ro_compat.has_readonly() {
            return Err(Error::Open("filesystem is marked as read-only".to_owned()));
        }
        if ro_compat.has_shared_blocks() {
            return Err(Error::Open("filesystem has shared blocks".to_owned()));
        }
    }

    Ok(())
}

//! Builds small, valid volume images in memory for tests.
//!
//! Fixed geometry: 1024-byte blocks, one block group, 32 inodes.
//! Block 0 is the boot block, 1 the superblock, 2 the descriptor table,
//! 3 the block bitmap, 4 the inode bitmap, 5..=8 the inode table, 9 the
//! root directory. File data is allocated from block 10 upwards.

use std::io::Cursor;

use bincode::Options;

use crate::bitmap::Bitmap;
use crate::volume::layout::{
    codec,
    DirEntryHeader,
    GroupDescriptor,
    Inode,
    SuperBlock,
    DIR_ENTRY_HEADER_SIZE,
    EXT2_MAGIC,
    ROOT_INO,
};
use crate::volume::Volume;

pub const BS: usize = 1024;
const INODE_COUNT: u32 = 32;
const INODE_SIZE: usize = 128;
const ITABLE_BLOCK: u32 = 5;
const ROOT_DIR_BLOCK: u32 = 9;
const FIRST_ALLOC: u32 = 10;
const ENTRIES_PER_BLOCK: usize = BS / 4;

pub struct ImageBuilder {
    total_blocks: u32,
    image: Vec<u8>,
    bitmap: Vec<u8>,
    inode_bitmap: Vec<u8>,
    next_block: u32,
    next_ino: u32,
    root_entries: Vec<(String, u32)>,
}

impl ImageBuilder {
    pub fn new(total_blocks: u32) -> Self
    {
        assert!(total_blocks > FIRST_ALLOC && total_blocks <= 8192);

        let mut builder = Self {
            total_blocks,
            image: vec![0; total_blocks as usize * BS],
            bitmap: vec![0; BS],
            inode_bitmap: vec![0; BS],
            next_block: FIRST_ALLOC,
            next_ino: 11,
            root_entries: Vec::new(),
        };

        // Metadata blocks 1..=9; bit index is `addr - first_data_block`.
        for addr in 1..=ROOT_DIR_BLOCK {
            builder.mark_block_used(addr);
        }
        for ino in 1..=ROOT_INO {
            builder.inode_bitmap[(ino as usize - 1) / 8] |= 1 << ((ino - 1) % 8);
        }

        builder
    }

    /// The first block address that `build` leaves unallocated.
    pub fn first_free(&self) -> u32
    {
        self.next_block
    }

    /// Fills an (unallocated) block with a byte pattern, simulating stale
    /// content left behind in free space.
    pub fn scribble(&mut self, addr: u32, byte: u8)
    {
        let start = addr as usize * BS;
        self.image[start..start + BS].fill(byte);
    }

    /// Adds a regular file to the root directory. Each slot is one logical
    /// block position: `Some(content)` allocates a block, `None` is a hole.
    /// Returns the inode number and the per-slot block addresses (0 = hole).
    pub fn add_file(&mut self, name: &str, slots: &[Option<Vec<u8>>]) -> (u32, Vec<u32>)
    {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inode_bitmap[(ino as usize - 1) / 8] |= 1 << ((ino - 1) % 8);

        let mut addrs = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(content) => {
                    let addr = self.alloc_block();
                    self.write_content(addr, content);
                    addrs.push(addr);
                }
                None => addrs.push(0),
            }
        }

        let mut i_block = [0u32; 15];
        let mut meta_blocks = 0u32;

        for (i, addr) in addrs.iter().take(12).enumerate() {
            i_block[i] = *addr;
        }

        if addrs.len() > 12 {
            let end = addrs.len().min(12 + ENTRIES_PER_BLOCK);
            let single = self.alloc_block();
            meta_blocks += 1;
            self.write_addr_block(single, &addrs[12..end]);
            i_block[12] = single;
        }

        if addrs.len() > 12 + ENTRIES_PER_BLOCK {
            let rest = addrs[12 + ENTRIES_PER_BLOCK..].to_vec();
            assert!(rest.len() <= ENTRIES_PER_BLOCK * ENTRIES_PER_BLOCK);

            let mut leaves = Vec::new();
            for chunk in rest.chunks(ENTRIES_PER_BLOCK) {
                let leaf = self.alloc_block();
                meta_blocks += 1;
                self.write_addr_block(leaf, chunk);
                leaves.push(leaf);
            }

            let double = self.alloc_block();
            meta_blocks += 1;
            self.write_addr_block(double, &leaves);
            i_block[13] = double;
        }

        let data_blocks = addrs.iter().filter(|&&a| a != 0).count() as u32;
        let inode = Inode {
            i_mode: 0x81a4,
            i_size: (slots.len() * BS) as u32,
            i_links_count: 1,
            i_blocks: (data_blocks + meta_blocks) * (BS as u32 / 512),
            i_block,
            ..Inode::default()
        };
        self.write_inode(ino, &inode);

        self.root_entries.push((name.to_owned(), ino));

        (ino, addrs)
    }

    pub fn build(mut self) -> Cursor<Vec<u8>>
    {
        // Root directory: ".", ".." and every added file.
        let mut entries = vec![(".".to_owned(), ROOT_INO), ("..".to_owned(), ROOT_INO)];
        entries.append(&mut self.root_entries.clone());
        self.write_dir_block(ROOT_DIR_BLOCK, &entries);

        let root = Inode {
            i_mode: 0x41ed,
            i_size: BS as u32,
            i_links_count: 2,
            i_blocks: BS as u32 / 512,
            i_block: {
                let mut b = [0u32; 15];
                b[0] = ROOT_DIR_BLOCK;
                b
            },
            ..Inode::default()
        };
        self.write_inode(ROOT_INO, &root);

        let free_blocks =
            Bitmap::from_bytes(&self.bitmap).count_unset(self.total_blocks as u64 - 1) as u32;
        let free_inodes = INODE_COUNT - self.next_ino + 1;

        let sb = SuperBlock {
            s_inodes_count: INODE_COUNT,
            s_blocks_count: self.total_blocks,
            s_free_blocks_count: free_blocks,
            s_free_inodes_count: free_inodes,
            s_first_data_block: 1,
            s_log_block_size: 0,
            s_blocks_per_group: 8192,
            s_frags_per_group: 8192,
            s_inodes_per_group: INODE_COUNT,
            s_magic: EXT2_MAGIC,
            s_state: 1,
            s_errors: 1,
            s_rev_level: 1,
            s_first_ino: 11,
            s_inode_size: INODE_SIZE as u16,
            ..SuperBlock::default()
        };
        let raw = codec().serialize(&sb).unwrap();
        self.image[BS..BS + raw.len()].copy_from_slice(&raw);

        let desc = GroupDescriptor {
            bg_block_bitmap: 3,
            bg_inode_bitmap: 4,
            bg_inode_table: ITABLE_BLOCK,
            bg_free_blocks_count: free_blocks as u16,
            bg_free_inodes_count: free_inodes as u16,
            bg_used_dirs_count: 1,
            ..GroupDescriptor::default()
        };
        let raw = codec().serialize(&desc).unwrap();
        self.image[2 * BS..2 * BS + raw.len()].copy_from_slice(&raw);

        self.image[3 * BS..4 * BS].copy_from_slice(&self.bitmap);
        self.image[4 * BS..5 * BS].copy_from_slice(&self.inode_bitmap);

        Cursor::new(self.image)
    }

    pub fn build_volume(self) -> Volume<Cursor<Vec<u8>>>
    {
        Volume::open(self.build()).unwrap()
    }

    fn alloc_block(&mut self) -> u32
    {
        let addr = self.next_block;
        assert!(addr < self.total_blocks, "test image out of blocks");
        self.next_block += 1;
        self.mark_block_used(addr);

        addr
    }

    fn mark_block_used(&mut self, addr: u32)
    {
        let bit = (addr - 1) as usize;
        self.bitmap[bit / 8] |= 1 << (bit % 8);
    }

    fn write_content(&mut self, addr: u32, content: &[u8])
    {
        assert!(content.len() <= BS);
        let start = addr as usize * BS;
        self.image[start..start + content.len()].copy_from_slice(content);
    }

    fn write_addr_block(&mut self, addr: u32, entries: &[u32])
    {
        assert!(entries.len() <= ENTRIES_PER_BLOCK);
        let start = addr as usize * BS;
        for (i, entry) in entries.iter().enumerate() {
            self.image[start + i * 4..start + i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }
    }

    fn write_inode(&mut self, ino: u32, inode: &Inode)
    {
        let raw = codec().serialize(inode).unwrap();
        let start = ITABLE_BLOCK as usize * BS + (ino as usize - 1) * INODE_SIZE;
        self.image[start..start + raw.len()].copy_from_slice(&raw);
    }

    fn write_dir_block(&mut self, addr: u32, entries: &[(String, u32)])
    {
        let start = addr as usize * BS;
        let mut off = 0;

        for (i, (name, ino)) in entries.iter().enumerate() {
            let name_len = name.len();
            let rec_len = if i + 1 == entries.len() {
                BS - off
            } else {
                DIR_ENTRY_HEADER_SIZE + (name_len + 3) / 4 * 4
            };

            let head = DirEntryHeader {
                inode: *ino,
                rec_len: rec_len as u16,
                name_len: name_len as u8,
                file_type: 0,
            };
            let raw = codec().serialize(&head).unwrap();

            self.image[start + off..start + off + raw.len()].copy_from_slice(&raw);
            self.image
                [start + off + DIR_ENTRY_HEADER_SIZE..start + off + DIR_ENTRY_HEADER_SIZE + name_len]
                .copy_from_slice(name.as_bytes());

            off += rec_len;
        }

        assert!(off <= BS);
    }
}

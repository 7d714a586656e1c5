#![allow(dead_code)]
use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::array::Array;

pub const EXT2_MAGIC: u16 = 0xef53;
pub const ROOT_INO: u32 = 2;
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const GROUP_DESC_SIZE: usize = 32;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const INODE_STRUCT_SIZE: usize = 128;
pub const DIRECT_SLOTS: usize = 12;
pub const IND_SLOT: usize = 12;
pub const DIND_SLOT: usize = 13;
pub const TIND_SLOT: usize = 14;
pub const N_BLOCKS: usize = 15;
pub const DIR_ENTRY_HEADER_SIZE: usize = 8;

/// Little-endian, fixed-width field encoding, matching the on-disk layout.
pub fn codec() -> impl Options
{
    DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}


/// The Ext2/3 superblock structure, up to the end of the Ext3 fields.
/// Source: https://elixir.bootlin.com/linux/latest/source/fs/ext2/ext2.h
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuperBlock {
    pub s_inodes_count: u32,         // Inodes count
    pub s_blocks_count: u32,         // Blocks count
    pub s_r_blocks_count: u32,       // Reserved blocks count
    pub s_free_blocks_count: u32,    // Free blocks count
    pub s_free_inodes_count: u32,    // Free inodes count
    pub s_first_data_block: u32,     // First Data Block
    pub s_log_block_size: u32,       // Block size
    pub s_log_frag_size: u32,        // Fragment size
    pub s_blocks_per_group: u32,     // # Blocks per group
    pub s_frags_per_group: u32,      // # Fragments per group
    pub s_inodes_per_group: u32,     // # Inodes per group
    pub s_mtime: u32,                // Mount time
    pub s_wtime: u32,                // Write time
    pub s_mnt_count: u16,            // Mount count
    pub s_max_mnt_count: u16,        // Maximal mount count
    pub s_magic: u16,                // Magic signature
    pub s_state: u16,                // File system state
    pub s_errors: u16,               // Behaviour when detecting errors
    pub s_minor_rev_level: u16,      // minor revision level
    pub s_lastcheck: u32,            // time of last check
    pub s_checkinterval: u32,        // max. time between checks
    pub s_creator_os: u32,           // OS
    pub s_rev_level: u32,            // Revision level
    pub s_def_resuid: u16,           // Default uid for reserved blocks
    pub s_def_resgid: u16,           // Default gid for reserved blocks
    // --- EXT2_DYNAMIC_REV ---
    pub s_first_ino: u32,         // First non-reserved inode
    pub s_inode_size: u16,        // size of inode structure
    pub s_block_group_nr: u16,    // block group # of this superblock
    pub s_feature_compat: u32,    // compatible feature set
    pub s_feature_incompat: u32,  // incompatible feature set
    pub s_feature_ro_compat: u32, // readonly-compatible feature set
    pub s_uuid: [u8; 16],         // 128-bit uuid for volume
    /// Type char[16].
    pub s_volume_name: [u8; 16], // volume name
    /// Type char[64].
    pub s_last_mounted: Array<u8, 64>, // directory where last mounted
    pub s_algorithm_usage_bitmap: u32, // For compression
    // --- EXT2_FEATURE_COMPAT_DIR_PREALLOC ---
    pub s_prealloc_blocks: u8,     // Nr of blocks to try to preallocate
    pub s_prealloc_dir_blocks: u8, // Nr to preallocate for dirs
    pub s_padding1: u16,
    // --- End of Ext2 superblock ---
    // --- EXT3_FEATURE_COMPAT_HAS_JOURNAL ---
    pub s_journal_uuid: [u8; 16], // uuid of journal superblock
    pub s_journal_inum: u32,      // inode number of journal file
    pub s_journal_dev: u32,       // device number of journal file
    pub s_last_orphan: u32,       // start of list of inodes to delete
    pub s_hash_seed: [u32; 4],    // HTREE hash seed
    pub s_def_hash_version: u8,   // Default hash version to use
    pub s_reserved_char_pad: u8,
    pub s_reserved_word_pad: u16,
    pub s_default_mount_opts: u32,
    pub s_first_meta_bg: u32, // First metablock block group
    // --- End of Ext3 superblock ---
    pub s_reserved: Array<u32, 190>, // Padding to the end of the block
}

impl SuperBlock {
    /// 2 ^ (10 + s_log_block_size)
    pub fn block_size(&self) -> u64
    {
        1024u64 << self.s_log_block_size
    }

    pub fn dynamic_rev(&self) -> bool
    {
        self.s_rev_level >= 1
    }

    pub fn inode_size(&self) -> u64
    {
        if self.dynamic_rev() && self.s_inode_size != 0 {
            self.s_inode_size as u64
        } else {
            GOOD_OLD_INODE_SIZE as u64
        }
    }

    pub fn group_count(&self) -> u64
    {
        let data_blocks = (self.s_blocks_count - self.s_first_data_block) as u64;
        let per_group = self.s_blocks_per_group as u64;

        (data_blocks + per_group - 1) / per_group
    }
}


/// The Ext2 group descriptor structure.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub bg_block_bitmap: u32,       // Blocks bitmap block
    pub bg_inode_bitmap: u32,       // Inodes bitmap block
    pub bg_inode_table: u32,        // Inodes table block
    pub bg_free_blocks_count: u16,  // Free blocks count
    pub bg_free_inodes_count: u16,  // Free inodes count
    pub bg_used_dirs_count: u16,    // Directories count
    pub bg_pad: u16,
    pub bg_reserved: [u8; 12],
}


/// The Ext2 inode structure (the 128-byte base record).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inode {
    pub i_mode: u16,              // File mode
    pub i_uid: u16,               // Low 16 bits of Owner Uid
    pub i_size: u32,              // Size in bytes
    pub i_atime: u32,             // Access time
    pub i_ctime: u32,             // Creation time
    pub i_mtime: u32,             // Modification time
    pub i_dtime: u32,             // Deletion Time
    pub i_gid: u16,               // Low 16 bits of Group Id
    pub i_links_count: u16,       // Links count
    pub i_blocks: u32,            // Blocks count, in 512-byte sectors
    pub i_flags: u32,             // File flags
    pub i_osd1: u32,              // OS dependent 1
    pub i_block: [u32; N_BLOCKS], // Pointers to blocks
    pub i_generation: u32,        // File version (for NFS)
    pub i_file_acl: u32,          // File ACL
    pub i_dir_acl: u32,           // Directory ACL
    pub i_faddr: u32,             // Fragment address
    pub i_osd2: [u8; 12],         // OS dependent 2
}

impl Inode {
    pub fn size(&self) -> u64
    {
        self.i_size as u64
    }

    pub fn is_regular(&self) -> bool
    {
        self.i_mode & 0xf000 == 0x8000
    }

    pub fn is_directory(&self) -> bool
    {
        self.i_mode & 0xf000 == 0x4000
    }

    pub fn flags(&self) -> InodeFlags
    {
        InodeFlags(self.i_flags)
    }
}


/// Inode flags (i_flags). Only the flags that change how the block list is
/// to be interpreted are of interest here.
#[derive(Copy, Clone, Debug)]
pub struct InodeFlags(pub u32);

impl InodeFlags {
    pub fn has_extents(&self)     -> bool { self.0 & 0x80000 != 0 }
    pub fn has_inline_data(&self) -> bool { self.0 & 0x10000000 != 0 }
}


/// Fixed-size head of a linked directory entry; the name bytes follow it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntryHeader {
    pub inode: u32,    // Inode number, 0 = unused entry
    pub rec_len: u16,  // Directory entry length
    pub name_len: u8,  // Name length
    pub file_type: u8,
}


/// State of the file system (s_state).
#[derive(Copy, Clone, Debug)]
pub struct State(pub u16);

impl State {
    pub fn has_valid(&self)  -> bool { self.0 & 0x1 != 0 }
    pub fn has_error(&self)  -> bool { self.0 & 0x2 != 0 }
    pub fn has_orphan(&self) -> bool { self.0 & 0x4 != 0 }

    pub fn get_unknown(&self) -> u16
    {
        (self.0 >> 3) << 3
    }

    pub fn has_unknown(&self) -> bool
    {
        self.get_unknown() != 0
    }
}


/// Incompatible features (s_feature_incompat).
#[derive(Copy, Clone, Debug)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub fn has_compression(&self) -> bool { self.0 & 0x00001 != 0 }
    pub fn has_filetype(&self)    -> bool { self.0 & 0x00002 != 0 }
    pub fn has_recover(&self)     -> bool { self.0 & 0x00004 != 0 }
    pub fn has_journal_dev(&self) -> bool { self.0 & 0x00008 != 0 }
    pub fn has_meta_bg(&self)     -> bool { self.0 & 0x00010 != 0 }
    // 0x00020 missing.
    pub fn has_extents(&self)     -> bool { self.0 & 0x00040 != 0 }
    pub fn has_64bit(&self)       -> bool { self.0 & 0x00080 != 0 }
    pub fn has_mmp(&self)         -> bool { self.0 & 0x00100 != 0 }
    pub fn has_flex_bg(&self)     -> bool { self.0 & 0x00200 != 0 }
    pub fn has_ea_inode(&self)    -> bool { self.0 & 0x00400 != 0 }
    // 0x00800 missing.
    pub fn has_dirdata(&self)     -> bool { self.0 & 0x01000 != 0 }
    pub fn has_csum_seed(&self)   -> bool { self.0 & 0x02000 != 0 }
    pub fn has_largedir(&self)    -> bool { self.0 & 0x04000 != 0 }
    pub fn has_inline_data(&self) -> bool { self.0 & 0x08000 != 0 }
    pub fn has_encrypt(&self)     -> bool { self.0 & 0x10000 != 0 }
    pub fn has_casefold(&self)    -> bool { self.0 & 0x20000 != 0 }

    pub fn get_unknown(&self) -> u32
    {
        ((self.0 >> 18) << 18) | (self.0 & 0x00020) | (self.0 & 0x00800)
    }

    pub fn has_unknown(&self) -> bool
    {
        self.get_unknown() != 0
    }
}


/// Read-only compatible features (s_feature_ro_compat).
/// Unknown bits here still matter: this tool writes.
#[derive(Copy, Clone, Debug)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub fn has_sparse_super(&self)  -> bool { self.0 & 0x00001 != 0 }
    pub fn has_large_file(&self)    -> bool { self.0 & 0x00002 != 0 }
    pub fn has_btree_dir(&self)     -> bool { self.0 & 0x00004 != 0 }
    pub fn has_huge_file(&self)     -> bool { self.0 & 0x00008 != 0 }
    pub fn has_gdt_csum(&self)      -> bool { self.0 & 0x00010 != 0 }
    pub fn has_dir_nlink(&self)     -> bool { self.0 & 0x00020 != 0 }
    pub fn has_extra_isize(&self)   -> bool { self.0 & 0x00040 != 0 }
    pub fn has_quota(&self)         -> bool { self.0 & 0x00100 != 0 }
    pub fn has_bigalloc(&self)      -> bool { self.0 & 0x00200 != 0 }
    pub fn has_metadata_csum(&self) -> bool { self.0 & 0x00400 != 0 }
    pub fn has_readonly(&self)      -> bool { self.0 & 0x01000 != 0 }
    pub fn has_project(&self)       -> bool { self.0 & 0x02000 != 0 }
    pub fn has_shared_blocks(&self) -> bool { self.0 & 0x04000 != 0 }
    pub fn has_verity(&self)        -> bool { self.0 & 0x08000 != 0 }

    pub fn get_unknown(&self) -> u32
    {
        ((self.0 >> 17) << 17) | (self.0 & 0x00080) | (self.0 & 0x00800) | (self.0 & 0x10000)
    }

    pub fn has_unknown(&self) -> bool
    {
        self.get_unknown() != 0
    }
}

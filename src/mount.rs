use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};


/// Whether (and how) a device is currently mounted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MountState {
    pub mounted: bool,
    pub read_only: bool,
}

/// Looks the device up in the kernel mount table.
/// Sparsification must refuse any mount; scrubbing tolerates a read-only
/// mount, so both facts are reported.
pub fn check_mount_state(device: &Path) -> Result<MountState>
{
    let table = fs::read_to_string("/proc/mounts")
        .or_else(|_| fs::read_to_string("/proc/self/mounts"))
        .map_err(Error::MountStateUnknown)?;

    let device = fs::canonicalize(device).unwrap_or_else(|_| PathBuf::from(device));

    Ok(parse_mount_state(&table, &device))
}

fn parse_mount_state(table: &str, device: &Path) -> MountState
{
    let mut state = MountState::default();

    for line in table.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        if Path::new(fields[0]) != device {
            continue;
        }

        let read_only = fields[3].split(',').any(|opt| opt == "ro");

        if state.mounted {
            // A single read-write mount makes the whole device read-write.
            state.read_only = state.read_only && read_only;
        } else {
            state.mounted = true;
            state.read_only = read_only;
        }
    }

    state
}

//! Mount table snapshot and path-to-volume resolution

use std::path::{Path, PathBuf};

use crate::error::ScanError;
use crate::models::Volume;

/// Block size used when the mount point cannot be stat'ed
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// One row of the host mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub device: String,
    pub file_system: String,
    /// Known block size; `None` means stat the mount point on demand
    pub block_size: Option<u32>,
}

impl MountEntry {
    /// Create a mount entry with a fixed block size
    pub fn new(
        mount_point: impl Into<PathBuf>,
        device: impl Into<String>,
        file_system: impl Into<String>,
        block_size: u32,
    ) -> Self {
        Self {
            mount_point: mount_point.into(),
            device: device.into(),
            file_system: file_system.into(),
            block_size: Some(block_size),
        }
    }
}

/// Maps absolute paths to the volume that contains them.
///
/// The mount table is captured once; a mount added afterwards is not seen
/// until a new resolver is built.
#[derive(Debug, Clone)]
pub struct VolumeResolver {
    /// Longest mount point first
    mounts: Vec<MountEntry>,
}

impl VolumeResolver {
    /// Build a resolver from explicit mount rows.
    ///
    /// When the same mount point appears twice the earlier row wins.
    pub fn new(mut mounts: Vec<MountEntry>) -> Self {
        mounts.sort_by_key(|m| std::cmp::Reverse(m.mount_point.as_os_str().len()));
        Self { mounts }
    }

    /// Snapshot the host's current mount table
    pub fn from_system() -> Result<Self, ScanError> {
        let mounts = system_mounts()?;
        if mounts.is_empty() {
            return Err(ScanError::io_error(None, "Mount table is empty"));
        }
        log::debug!("Loaded {} mount points", mounts.len());
        Ok(Self::new(mounts))
    }

    /// The most specific mount containing `path`, compared by path components
    pub fn find_mount(&self, path: &Path) -> Option<&MountEntry> {
        self.mounts.iter().find(|m| path.starts_with(&m.mount_point))
    }

    /// Describe the volume containing `path`; ids are left for the store to assign
    pub fn resolve(&self, path: &Path, seen_timestamp: i64) -> Result<Volume, ScanError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::path::absolute(path).map_err(|e| ScanError::from_io(path, &e))?
        };

        let mount = self
            .find_mount(&path)
            .ok_or_else(|| ScanError::mount_not_found(path.clone()))?;

        let block_size = mount
            .block_size
            .map(u64::from)
            .unwrap_or_else(|| stat_block_size(&mount.mount_point));

        Ok(Volume {
            id: 0,
            mount_point: mount.mount_point.to_string_lossy().into_owned(),
            device: non_empty(&mount.device, "none"),
            file_system: non_empty(&mount.file_system, "unknown"),
            block_size: normalize_block_size(block_size),
            first_seen_timestamp: seen_timestamp,
            last_seen_timestamp: seen_timestamp,
        })
    }
}

/// Parse `/proc/self/mounts` formatted text
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let file_system = fields.next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                device: unescape_mount_field(device),
                file_system: file_system.to_string(),
                block_size: None,
            })
        })
        .collect()
}

/// Decode the kernel's octal escapes (`\040` for space and friends)
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Round up to a power of two; 0 means unknown
fn normalize_block_size(raw: u64) -> u32 {
    if raw == 0 {
        return DEFAULT_BLOCK_SIZE;
    }
    u32::try_from(raw.next_power_of_two()).unwrap_or(1 << 31)
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(unix)]
fn stat_block_size(mount_point: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(mount_point)
        .map(|m| m.blksize())
        .unwrap_or(0)
}

#[cfg(not(unix))]
fn stat_block_size(_mount_point: &Path) -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn system_mounts() -> Result<Vec<MountEntry>, ScanError> {
    let source = "/proc/self/mounts";
    let text = std::fs::read_to_string(source).map_err(|e| ScanError::from_io(source, &e))?;
    let mut mounts = parse_mount_table(&text);
    // later mounts shadow earlier ones on the same point
    mounts.reverse();
    Ok(mounts)
}

#[cfg(not(target_os = "linux"))]
fn system_mounts() -> Result<Vec<MountEntry>, ScanError> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    Ok(disks
        .list()
        .iter()
        .map(|disk| MountEntry {
            mount_point: disk.mount_point().to_path_buf(),
            device: disk.name().to_string_lossy().into_owned(),
            file_system: disk.file_system().to_string_lossy().into_owned(),
            block_size: None,
        })
        .collect())
}

//! Mount table reading and mount operations.

use std::path::Path;

use veil_common::{VeilError, VeilResult};

/// One line of a process's mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Mount source, usually a block device or a pseudo name like `tmpfs`.
    pub device: String,
    /// Where it is mounted.
    pub mountpoint: String,
    /// Filesystem type.
    pub fstype: String,
    /// Comma-separated mount options.
    pub options: String,
}

impl MountRecord {
    /// Parse one `/proc/<pid>/mounts` line.
    ///
    /// Returns `None` for lines with fewer than four fields.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let device = unescape(fields.next()?);
        let mountpoint = unescape(fields.next()?);
        let fstype = fields.next()?.to_string();
        let options = fields.next()?.to_string();

        Some(Self {
            device,
            mountpoint,
            fstype,
            options,
        })
    }

    /// Whether the mountpoint is `tree` itself or lies below it.
    #[must_use]
    pub fn is_within(&self, tree: &str) -> bool {
        let tree = tree.trim_end_matches('/');
        match self.mountpoint.strip_prefix(tree) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Whether the mount is backed by memory rather than a device.
    #[must_use]
    pub fn is_tmpfs(&self) -> bool {
        self.fstype == "tmpfs" || self.device == "tmpfs"
    }
}

/// Decode the octal escapes (`\040` for space and friends) the kernel uses in
/// mount tables.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
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

/// Parse the full text of a mount table, skipping malformed lines.
#[must_use]
pub fn parse_mount_table(text: &str) -> Vec<MountRecord> {
    text.lines().filter_map(MountRecord::parse).collect()
}

/// Read and parse a mount table file.
pub fn read_mount_table(path: &Path) -> VeilResult<Vec<MountRecord>> {
    let text = std::fs::read_to_string(path)?;
    let records = parse_mount_table(&text);
    tracing::trace!(path = %path.display(), count = records.len(), "Read mount table");
    Ok(records)
}

/// Lazily unmount `target`.
///
/// The mount disappears from the namespace immediately, even when busy; the
/// kernel releases it once the last reference is gone.
pub fn detach(target: &Path) -> VeilResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::trace!(target = %target.display(), "Detaching mount");

    unmount(target, UnmountFlags::DETACH).map_err(|e| VeilError::Io(e.into()))?;

    Ok(())
}

/// Remount `target` in place, read-only or read-write.
#[cfg(target_os = "linux")]
pub fn remount(target: &Path, readonly: bool) -> VeilResult<()> {
    use rustix::io::Errno;
    use rustix::mount::{MountFlags, mount_remount};

    tracing::debug!(target = %target.display(), readonly, "Remounting");

    let flags = if readonly {
        MountFlags::RDONLY
    } else {
        MountFlags::empty()
    };

    mount_remount(target, flags, "").map_err(|e| match e {
        Errno::PERM | Errno::ACCESS => VeilError::PermissionDenied {
            operation: format!("remount {}", target.display()),
        },
        e => VeilError::Io(e.into()),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn remount(_target: &Path, _readonly: bool) -> VeilResult<()> {
    Err(VeilError::Internal {
        message: "remount is only available on Linux".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
rootfs / rootfs ro,seclabel 0 0
/dev/block/dm-0 /system ext4 ro,seclabel,relatime 0 0
tmpfs /sbin tmpfs rw,seclabel,relatime,mode=755 0 0
/dev/block/loop0 /sbin/.core/img ext4 rw,seclabel,relatime 0 0
/dev/block/mmcblk0p23 /cache ext4 rw,seclabel,nosuid,nodev 0 0
/dev/block/by\\040name /mnt/with\\040space vfat rw 0 0
garbage
";

    #[test]
    fn parses_mount_table() {
        let records = parse_mount_table(TABLE);
        assert_eq!(records.len(), 6);
        assert_eq!(records[1].device, "/dev/block/dm-0");
        assert_eq!(records[1].mountpoint, "/system");
        assert_eq!(records[1].fstype, "ext4");
        assert!(records[2].is_tmpfs());
    }

    #[test]
    fn decodes_octal_escapes() {
        let records = parse_mount_table(TABLE);
        assert_eq!(records[5].device, "/dev/block/by name");
        assert_eq!(records[5].mountpoint, "/mnt/with space");
    }

    #[test]
    fn tree_containment_respects_components() {
        let record = MountRecord::parse("tmpfs /system/bin/app_process tmpfs rw 0 0").unwrap();
        assert!(record.is_within("/system"));
        assert!(record.is_within("/system/"));
        assert!(!record.is_within("/sys"));

        let root = MountRecord::parse("tmpfs /sbin tmpfs rw 0 0").unwrap();
        assert!(root.is_within("/sbin"));
        let sibling = MountRecord::parse("tmpfs /sbin2 tmpfs rw 0 0").unwrap();
        assert!(!sibling.is_within("/sbin"));
    }

    #[test]
    fn reads_table_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("mounts");
        std::fs::write(&path, TABLE).unwrap();

        let records = read_mount_table(&path).unwrap();
        assert_eq!(records[4].mountpoint, "/cache");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn remount_of_plain_directory_fails() {
        let temp = tempfile::tempdir().unwrap();
        assert!(remount(temp.path(), true).is_err());
        assert!(remount(&temp.path().join("missing"), false).is_err());
    }
}

//! Selection rules for the overlay mounts a hide worker removes.

use serde::{Deserialize, Serialize};

use super::mounts::MountRecord;

/// Which mounts count as overlay mounts.
///
/// The defaults describe a stock Android layout: the overlay keeps its image
/// on the `/cache` partition, bind-mounts files from it into `/system` and
/// `/vendor`, replaces directories there with tmpfs skeletons and mounts its
/// images through loop devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmountPolicy {
    /// Mountpoint of the partition backing the overlay cache.
    pub cache_mountpoint: String,
    /// Trees in which mounts from the cache device are removed.
    pub cache_trees: Vec<String>,
    /// Trees in which tmpfs mounts are removed.
    pub tmpfs_trees: Vec<String>,
    /// Device prefixes identifying loop-backed mounts.
    pub loop_device_prefixes: Vec<String>,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            cache_mountpoint: "/cache".to_string(),
            cache_trees: vec!["/system".to_string(), "/vendor".to_string()],
            tmpfs_trees: vec![
                "/system".to_string(),
                "/vendor".to_string(),
                "/sbin".to_string(),
            ],
            loop_device_prefixes: vec!["/dev/block/loop".to_string(), "/dev/loop".to_string()],
        }
    }
}

impl UnmountPolicy {
    /// Device mounted at the cache mountpoint, if any.
    #[must_use]
    pub fn discover_cache_block(&self, table: &[MountRecord]) -> Option<String> {
        table
            .iter()
            .find(|record| record.mountpoint == self.cache_mountpoint)
            .map(|record| record.device.clone())
    }

    /// Mounts from the cache device inside the cache trees.
    #[must_use]
    pub fn cache_targets(&self, table: &[MountRecord], block: &str) -> Vec<String> {
        table
            .iter()
            .filter(|record| record.device == block)
            .filter(|record| self.cache_trees.iter().any(|tree| record.is_within(tree)))
            .map(|record| record.mountpoint.clone())
            .collect()
    }

    /// tmpfs skeletons inside the tmpfs trees.
    #[must_use]
    pub fn tmpfs_targets(&self, table: &[MountRecord]) -> Vec<String> {
        table
            .iter()
            .filter(|record| record.is_tmpfs())
            .filter(|record| self.tmpfs_trees.iter().any(|tree| record.is_within(tree)))
            .map(|record| record.mountpoint.clone())
            .collect()
    }

    /// Every mount backed by a loop device.
    #[must_use]
    pub fn loop_targets(&self, table: &[MountRecord]) -> Vec<String> {
        table
            .iter()
            .filter(|record| {
                self.loop_device_prefixes
                    .iter()
                    .any(|prefix| record.device.starts_with(prefix.as_str()))
            })
            .map(|record| record.mountpoint.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::parse_mount_table;

    const TABLE: &str = "\
/dev/block/dm-0 /system ext4 ro 0 0
/dev/block/mmcblk0p23 /cache ext4 rw 0 0
/dev/block/mmcblk0p23 /system/app/Foo ext4 rw 0 0
/dev/block/mmcblk0p23 /vendor/lib/libfoo.so ext4 rw 0 0
/dev/block/mmcblk0p23 /data/local ext4 rw 0 0
tmpfs /system/etc tmpfs rw 0 0
tmpfs /sbin tmpfs rw 0 0
tmpfs /dev tmpfs rw 0 0
/dev/block/loop0 /sbin/.core/img ext4 rw 0 0
/dev/block/loop1 /system/priv-app/Bar ext4 ro 0 0
";

    #[test]
    fn discovers_cache_block() {
        let policy = UnmountPolicy::default();
        let table = parse_mount_table(TABLE);
        assert_eq!(
            policy.discover_cache_block(&table).as_deref(),
            Some("/dev/block/mmcblk0p23")
        );

        let without_cache = parse_mount_table("/dev/block/dm-0 /system ext4 ro 0 0\n");
        assert!(policy.discover_cache_block(&without_cache).is_none());
    }

    #[test]
    fn selects_cache_mounts_inside_trees_only() {
        let policy = UnmountPolicy::default();
        let table = parse_mount_table(TABLE);
        assert_eq!(
            policy.cache_targets(&table, "/dev/block/mmcblk0p23"),
            vec!["/system/app/Foo", "/vendor/lib/libfoo.so"]
        );
    }

    #[test]
    fn selects_tmpfs_skeletons() {
        let policy = UnmountPolicy::default();
        let table = parse_mount_table(TABLE);
        assert_eq!(policy.tmpfs_targets(&table), vec!["/system/etc", "/sbin"]);
    }

    #[test]
    fn selects_loop_mounts() {
        let policy = UnmountPolicy::default();
        let table = parse_mount_table(TABLE);
        assert_eq!(
            policy.loop_targets(&table),
            vec!["/sbin/.core/img", "/system/priv-app/Bar"]
        );
    }

    #[test]
    fn deserializes_partial_policy() {
        let policy: UnmountPolicy = toml::from_str("cache_mountpoint = \"/data/cache\"").unwrap();
        assert_eq!(policy.cache_mountpoint, "/data/cache");
        assert_eq!(policy.tmpfs_trees.len(), 3);
    }
}

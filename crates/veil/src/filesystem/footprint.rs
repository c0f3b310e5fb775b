//! Marker files that reveal the overlay installation.
//!
//! While a hide worker is mid-flight the markers are removed from the root
//! filesystem, so anything probing for them in that window finds nothing.
//! They are put back once no worker is running.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use veil_common::VeilResult;

use super::mounts;

/// One well-known path whose presence gives the overlay away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Marker {
    /// A symbolic link `path -> target`.
    Symlink {
        /// Location of the link.
        path: PathBuf,
        /// What the link points at.
        target: PathBuf,
    },
    /// A regular file recreated with fixed contents.
    File {
        /// Location of the file.
        path: PathBuf,
        /// Contents written on restore.
        #[serde(default)]
        contents: String,
    },
}

impl Marker {
    /// The filesystem location of this marker.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Symlink { path, .. } | Self::File { path, .. } => path,
        }
    }

    fn remove(&self) -> std::io::Result<()> {
        match std::fs::remove_file(self.path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn create(&self) -> std::io::Result<()> {
        let result = match self {
            Self::Symlink { path, target } => std::os::unix::fs::symlink(target, path),
            Self::File { path, contents } => std::fs::write(path, contents),
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        }
    }
}

/// Marker set and the read-only mount that has to be lifted to change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Footprint {
    /// Mount remounted read-write around every change; `None` skips
    /// remounting.
    pub remount: Option<PathBuf>,
    /// Markers to hide and restore.
    pub markers: Vec<Marker>,
}

impl Default for Footprint {
    fn default() -> Self {
        Self {
            remount: Some(PathBuf::from("/")),
            markers: vec![
                Marker::Symlink {
                    path: PathBuf::from("/magisk"),
                    target: PathBuf::from("/sbin/.core/img"),
                },
                Marker::Symlink {
                    path: PathBuf::from("/data/magisk"),
                    target: PathBuf::from("/data/adb/magisk"),
                },
                Marker::Symlink {
                    path: PathBuf::from("/data/magisk.img"),
                    target: PathBuf::from("/data/adb/magisk.img"),
                },
            ],
        }
    }
}

/// Hide/restore switch for the installation footprint.
pub trait FootprintToggle: Send + Sync {
    /// Remove every marker.
    fn hide(&self) -> VeilResult<()>;

    /// Recreate every marker.
    fn restore(&self) -> VeilResult<()>;
}

/// [`FootprintToggle`] that edits the real filesystem.
#[derive(Debug, Clone)]
pub struct MarkerFootprint {
    footprint: Footprint,
}

impl MarkerFootprint {
    /// Create a toggle for the given marker set.
    #[must_use]
    pub fn new(footprint: Footprint) -> Self {
        Self { footprint }
    }

    /// Run `edit` on every marker with the root mount writable.
    ///
    /// A failing marker does not stop the others; the first error is
    /// returned after the mount is back to read-only.
    fn with_writable_root(
        &self,
        edit: impl Fn(&Marker) -> std::io::Result<()>,
    ) -> VeilResult<()> {
        if let Some(root) = &self.footprint.remount {
            mounts::remount(root, false)?;
        }

        let mut first_error = None;
        for marker in &self.footprint.markers {
            if let Err(e) = edit(marker) {
                tracing::debug!(
                    path = %marker.path().display(),
                    error = %e,
                    "Marker update failed"
                );
                first_error.get_or_insert(e);
            }
        }

        if let Some(root) = &self.footprint.remount {
            mounts::remount(root, true)?;
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl FootprintToggle for MarkerFootprint {
    fn hide(&self) -> VeilResult<()> {
        self.with_writable_root(Marker::remove)?;
        tracing::debug!(count = self.footprint.markers.len(), "Footprint hidden");
        Ok(())
    }

    fn restore(&self) -> VeilResult<()> {
        self.with_writable_root(Marker::create)?;
        tracing::debug!(count = self.footprint.markers.len(), "Footprint restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footprint_in(dir: &Path) -> Footprint {
        Footprint {
            remount: None,
            markers: vec![
                Marker::Symlink {
                    path: dir.join("magisk"),
                    target: PathBuf::from("/sbin/.core/img"),
                },
                Marker::File {
                    path: dir.join("init.magisk.rc"),
                    contents: "service magiskd /sbin/magisk --daemon\n".to_string(),
                },
            ],
        }
    }

    #[test]
    fn hide_then_restore() {
        let temp = tempfile::tempdir().unwrap();
        let footprint = footprint_in(temp.path());
        let toggle = MarkerFootprint::new(footprint);

        toggle.restore().unwrap();
        let link = temp.path().join("magisk");
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            PathBuf::from("/sbin/.core/img")
        );

        toggle.hide().unwrap();
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert!(!temp.path().join("init.magisk.rc").exists());

        toggle.restore().unwrap();
        assert!(std::fs::symlink_metadata(&link).is_ok());
        assert_eq!(
            std::fs::read_to_string(temp.path().join("init.magisk.rc")).unwrap(),
            "service magiskd /sbin/magisk --daemon\n"
        );
    }

    #[test]
    fn toggles_are_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let toggle = MarkerFootprint::new(footprint_in(temp.path()));

        toggle.hide().unwrap();
        toggle.hide().unwrap();
        toggle.restore().unwrap();
        toggle.restore().unwrap();
        assert!(temp.path().join("init.magisk.rc").exists());
    }

    #[test]
    fn default_markers_deserialize() {
        let footprint: Footprint = toml::from_str(
            r#"
            remount = "/"

            [[markers]]
            kind = "symlink"
            path = "/magisk"
            target = "/sbin/.core/img"

            [[markers]]
            kind = "file"
            path = "/init.magisk.rc"
            "#,
        )
        .unwrap();
        assert_eq!(footprint.markers.len(), 2);
        assert_eq!(footprint.markers[1].path(), Path::new("/init.magisk.rc"));
    }
}

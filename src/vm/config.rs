//! VM bundle layout and resource configuration
//!
//! A VM bundle is a directory holding everything one VM needs:
//!
//! ```text
//! {bundle}/
//!   disk.img          root disk image
//!   config.json       display name + resource configuration
//!   boot/             auxiliary boot storage
//!   shared/
//!     inbox/          host -> guest file exchange
//!     outbox/         guest -> host file exchange
//!     workspace/      scratch space mounted in the guest
//!   agent.sock        guest agent socket (created by the helper at boot)
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::VmError;

/// CPU/memory/disk sizing for one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub disk_size_gb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_count: 2,
            memory_mb: 4096,
            disk_size_gb: 32,
        }
    }
}

/// Persisted per-bundle configuration (`config.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    pub display_name: String,
    pub resources: ResourceConfig,
}

/// Handle to one VM bundle directory on disk
#[derive(Debug, Clone)]
pub struct VmBundle {
    root: PathBuf,
}

impl VmBundle {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_image(&self) -> PathBuf {
        self.root.join("disk.img")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.root.join("boot")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    /// Socket the guest agent listens on, created by the helper at boot
    pub fn agent_socket(&self) -> PathBuf {
        self.root.join("agent.sock")
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Clone a golden-image bundle into a new bundle directory.
    ///
    /// Copies the disk image and boot storage, writes a fresh config, and
    /// creates the shared folder tree. Does not boot anything.
    pub fn clone_from(
        template: &VmBundle,
        new_root: impl Into<PathBuf>,
        display_name: &str,
    ) -> Result<VmBundle, VmError> {
        let bundle = VmBundle::at(new_root);

        if !template.exists() {
            return Err(VmError::NotFound(format!(
                "template bundle missing at {}",
                template.root().display()
            )));
        }

        std::fs::create_dir_all(bundle.root())
            .map_err(|e| VmError::DiskCreationFailed(e.to_string()))?;

        std::fs::copy(template.disk_image(), bundle.disk_image())
            .map_err(|e| VmError::DiskCreationFailed(e.to_string()))?;

        copy_dir(&template.boot_dir(), &bundle.boot_dir())
            .map_err(|e| VmError::DiskCreationFailed(e.to_string()))?;

        for sub in ["inbox", "outbox", "workspace"] {
            std::fs::create_dir_all(bundle.shared_dir().join(sub))
                .map_err(|e| VmError::DiskCreationFailed(e.to_string()))?;
        }

        let resources = template
            .load_config()
            .map(|c| c.resources)
            .unwrap_or_default();
        bundle.save_config(&BundleConfig {
            display_name: display_name.to_string(),
            resources,
        })?;

        Ok(bundle)
    }

    pub fn load_config(&self) -> Result<BundleConfig, VmError> {
        let raw = std::fs::read_to_string(self.config_path())
            .map_err(|e| VmError::ConfigInvalid(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| VmError::ConfigInvalid(e.to_string()))
    }

    pub fn save_config(&self, config: &BundleConfig) -> Result<(), VmError> {
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| VmError::ConfigInvalid(e.to_string()))?;
        std::fs::write(self.config_path(), json).map_err(|e| VmError::ConfigInvalid(e.to_string()))
    }

    /// Remove the whole bundle directory. Idempotent when already absent.
    pub fn delete(&self) -> Result<(), VmError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VmError::Internal(e.to_string())),
        }
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    if !src.is_dir() {
        // Template without aux boot storage is legal
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_template(dir: &Path) -> VmBundle {
        let template = VmBundle::at(dir.join("golden"));
        std::fs::create_dir_all(template.root()).unwrap();
        std::fs::write(template.disk_image(), b"disk-bytes").unwrap();
        std::fs::create_dir_all(template.boot_dir()).unwrap();
        std::fs::write(template.boot_dir().join("cmdline"), b"quiet").unwrap();
        template
            .save_config(&BundleConfig {
                display_name: "golden".into(),
                resources: ResourceConfig::default(),
            })
            .unwrap();
        template
    }

    #[test]
    fn clone_creates_full_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let template = make_template(tmp.path());

        let bundle =
            VmBundle::clone_from(&template, tmp.path().join("vm-1"), "test vm").unwrap();

        assert!(bundle.disk_image().is_file());
        assert!(bundle.boot_dir().join("cmdline").is_file());
        for sub in ["inbox", "outbox", "workspace"] {
            assert!(bundle.shared_dir().join(sub).is_dir());
        }
        let config = bundle.load_config().unwrap();
        assert_eq!(config.display_name, "test vm");
        assert_eq!(config.resources, ResourceConfig::default());
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let template = make_template(tmp.path());
        let bundle = VmBundle::clone_from(&template, tmp.path().join("vm-2"), "x").unwrap();

        bundle.delete().unwrap();
        assert!(!bundle.exists());
        // Second delete is a no-op, not an error
        bundle.delete().unwrap();
    }

    #[test]
    fn clone_from_missing_template_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = VmBundle::at(tmp.path().join("nope"));
        let err = VmBundle::clone_from(&missing, tmp.path().join("vm-3"), "x").unwrap_err();
        assert!(matches!(err, VmError::NotFound(_)));
    }
}

//! Package descriptors and layer metadata.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use super::reference::{Arch, Module, Ref};
use super::version::Version;

/// Metadata about one package as known to the remote index or the local
/// catalog. Field names follow the server wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageMeta {
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub arch: String,
    pub kind: String,
    /// Reference of the runtime this package depends on; empty for base
    /// runtimes.
    pub runtime: String,
    pub uab_url: String,
    pub repo_name: String,
    pub description: String,
    pub user: String,
    pub size: String,
    pub channel: String,
    pub module: String,
}

impl PackageMeta {
    /// The canonical reference of this descriptor.
    pub fn to_ref(&self) -> Result<Ref> {
        let version = Version::from_str(&self.version)
            .with_context(|| format!("descriptor for {} has invalid version", self.app_id))?;
        let arch = Arch::from_str(&self.arch)?;
        let module = if self.module.is_empty() {
            Module::Runtime
        } else {
            Module::from_str(&self.module)?
        };
        let channel = if self.channel.is_empty() {
            super::reference::DEFAULT_CHANNEL
        } else {
            &self.channel
        };
        Ok(Ref::new(
            channel,
            self.app_id.clone(),
            Some(version),
            arch,
            module,
        ))
    }

    pub fn parsed_version(&self) -> Option<Version> {
        Version::from_str(&self.version).ok()
    }
}

/// One explicit bind rule from a permission declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionMount {
    #[serde(rename = "type")]
    pub fstype: String,
    /// Comma separated mount options; empty means `ro,rbind`.
    pub options: String,
    pub source: String,
    pub destination: String,
}

/// Filesystem grants; `user` maps XDG user directory names to `r`/`ro`/`rw`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemPermissions {
    pub user: BTreeMap<String, String>,
}

/// The `permissions` block of `info.json` and of the per-app config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub mounts: Vec<PermissionMount>,
    pub filesystem: Option<FilesystemPermissions>,
}

/// One overlay mount rule from `info.json`; sources and destinations may
/// contain `$APP_ROOT_PATH` style variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayMountRule {
    pub source: String,
    pub destination: String,
}

/// The `overlayfs` block of `info.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayfsInfo {
    pub mounts: Vec<OverlayMountRule>,
}

/// The layer metadata stored as `info.json` in every checked out layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerInfo {
    pub appid: String,
    pub version: String,
    pub arch: Vec<String>,
    pub kind: String,
    pub name: String,
    pub description: String,
    /// Reference of the runtime this layer needs, `id/version/arch` form.
    pub runtime: String,
    /// Reference of the base of this layer's runtime.
    pub base: String,
    pub permissions: Option<Permissions>,
    pub overlayfs: Option<OverlayfsInfo>,
}

impl LayerInfo {
    /// Load the `info.json` found at the root of a checked out layer.
    pub fn load(layer_root: &Utf8Path) -> Result<Self> {
        let path = layer_root.join("info.json");
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading layer metadata {path}"))?;
        serde_json::from_str(&data).with_context(|| format!("Parsing layer metadata {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_meta_to_ref() {
        let meta = PackageMeta {
            app_id: "org.deepin.calculator".into(),
            version: "5.7.16".into(),
            arch: "x86_64".into(),
            module: "runtime".into(),
            ..Default::default()
        };
        let r = meta.to_ref().unwrap();
        assert_eq!(
            r.to_string(),
            "linglong/org.deepin.calculator/5.7.16/x86_64/runtime"
        );
    }

    #[test]
    fn test_layer_info_parse() {
        let data = indoc! {r#"
            {
                "appid": "org.deepin.calculator",
                "name": "deepin-calculator",
                "version": "5.7.16",
                "arch": ["x86_64"],
                "kind": "app",
                "runtime": "org.deepin.Runtime/20.5.0/x86_64",
                "permissions": {
                    "filesystem": {
                        "user": { "Desktop": "rw", "Documents": "r" }
                    }
                },
                "overlayfs": {
                    "mounts": [
                        { "source": "$APP_ROOT_PATH/files/etc", "destination": "/etc" }
                    ]
                }
            }
        "#};
        let info: LayerInfo = serde_json::from_str(data).unwrap();
        assert_eq!(info.appid, "org.deepin.calculator");
        assert_eq!(info.runtime, "org.deepin.Runtime/20.5.0/x86_64");
        let fs = info.permissions.unwrap().filesystem.unwrap();
        assert_eq!(fs.user.get("Desktop").unwrap(), "rw");
        assert_eq!(info.overlayfs.unwrap().mounts.len(), 1);
    }
}

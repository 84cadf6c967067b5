//! OCI runtime configuration, the artifact handed to the container
//! executor. Plain value types composed into a tree; one is produced per
//! launch and serialized down the executor's socket.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Version written into every produced configuration.
pub const OCI_VERSION: &str = "1.0.1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Root {
    pub path: Utf8PathBuf,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Process {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub fstype: String,
    pub source: String,
    pub options: Vec<String>,
}

impl Mount {
    fn bind_with(source: impl Into<String>, destination: impl Into<String>, options: &[&str]) -> Self {
        Self {
            destination: destination.into(),
            fstype: "bind".to_string(),
            source: source.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// A read-write recursive bind.
    pub fn bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::bind_with(source, destination, &["rbind"])
    }

    /// A read-only recursive bind.
    pub fn ro_bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::bind_with(source, destination, &["ro", "rbind"])
    }

    /// An explicitly read-write recursive bind.
    pub fn rw_bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::bind_with(source, destination, &["rw", "rbind"])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdMap {
    pub host_id: u64,
    pub container_id: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
}

/// Overlay root layout under the instance working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlayRootfs {
    pub lower_parent: Utf8PathBuf,
    pub upper: Utf8PathBuf,
    pub workdir: Utf8PathBuf,
    pub mounts: Vec<Mount>,
}

/// Plain bind composition root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeRootfs {
    pub mounts: Vec<Mount>,
}

/// Session bus proxying decisions, relayed to the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbusProxyInfo {
    pub app_id: String,
    pub enable: bool,
    pub bus_type: String,
    pub proxy_path: String,
    pub name: Vec<String>,
    pub path: Vec<String>,
    pub interface: Vec<String>,
}

/// Composer-specific extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Annotations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlayfs: Option<OverlayRootfs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeRootfs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbus_proxy_info: Option<DbusProxyInfo>,
    pub container_root_path: Utf8PathBuf,
}

/// The full per-launch configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Spec {
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub mounts: Vec<Mount>,
    pub linux: Linux,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Spec {
    /// The skeleton every composition starts from: version, hostname, and
    /// the unprivileged namespace set.
    pub fn skeleton() -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            hostname: Some("linglong".to_string()),
            linux: Linux {
                namespaces: ["pid", "mount", "uts", "ipc", "user"]
                    .iter()
                    .map(|kind| Namespace {
                        kind: kind.to_string(),
                    })
                    .collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let mut spec = Spec::skeleton();
        spec.mounts.push(Mount::ro_bind("/usr", "/usr"));
        spec.linux.uid_mappings.push(IdMap {
            host_id: 1000,
            container_id: 0,
            size: 1,
        });
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["mounts"][0]["type"], "bind");
        assert_eq!(json["mounts"][0]["options"][0], "ro");
        assert_eq!(json["linux"]["uidMappings"][0]["hostId"], 1000);
        assert_eq!(json["linux"]["namespaces"][0]["type"], "pid");
        // No annotations were set; the key must be absent entirely.
        assert!(json.get("annotations").is_none());
    }

    #[test]
    fn test_round_trip() {
        let mut spec = Spec::skeleton();
        spec.annotations = Some(Annotations {
            native: Some(NativeRootfs {
                mounts: vec![Mount::bind("/a", "/b")],
            }),
            container_root_path: "/run/user/1000/linglong/x".into(),
            ..Default::default()
        });
        let json = serde_json::to_string(&spec).unwrap();
        let back: Spec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}

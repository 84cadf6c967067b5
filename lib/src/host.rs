//! Host environment detection.
//!
//! Everything the installer and composer need to know about the machine they
//! run on is captured in [`HostEnv`] and passed explicitly, so tests can
//! fabricate hosts rooted in temporary directories.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::package::{Arch, Module, Ref};

/// Environment variable overriding the store root, mainly for tests and
/// development setups.
const ROOT_ENV: &str = "LINGLONG_ROOT";

/// Store roots probed in order; the last one is the fallback.
const ROOT_CANDIDATES: &[&str] = &["/persistent/linglong", "/data/linglong", "/var/lib/linglong"];

/// Immutable facts about the host, resolved once at startup.
#[derive(Debug, Clone)]
pub struct HostEnv {
    /// The store root, e.g. `/var/lib/linglong`.
    pub root: Utf8PathBuf,
    pub arch: Arch,
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home: Utf8PathBuf,
    /// `$XDG_RUNTIME_DIR`, or `/run/user/<uid>`.
    pub runtime_dir: Utf8PathBuf,
    /// The user cache directory hosting the remote metadata cache.
    pub cache_dir: Utf8PathBuf,
    /// Whether the host provides the deepin base system itself; when it does
    /// not, apps additionally need a base layer mounted over `/usr`.
    pub is_deepin: bool,
}

impl HostEnv {
    pub fn detect() -> Result<Self> {
        let arch = Arch::host()
            .ok_or_else(|| anyhow!("unsupported host arch {}", std::env::consts::ARCH))?;
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid().as_raw();
        let username = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default();
        let home = dirs::home_dir()
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .context("Resolving home directory")?;
        let uid = uid.as_raw();
        let runtime_dir = dirs::runtime_dir()
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from(format!("/run/user/{uid}")));
        let cache_dir = dirs::cache_dir()
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .unwrap_or_else(|| home.join(".cache"));
        Ok(Self {
            root: detect_root(),
            arch,
            uid,
            gid,
            username,
            home,
            runtime_dir,
            cache_dir,
            is_deepin: os_release_is_deepin(
                &std::fs::read_to_string("/etc/os-release").unwrap_or_default(),
            ),
        })
    }

    /// The OSTree repository under the store root.
    pub fn repo_dir(&self) -> Utf8PathBuf {
        self.root.join("repo")
    }

    pub fn layers_dir(&self) -> Utf8PathBuf {
        self.root.join("layers")
    }

    /// The shared entries tree visible to the host desktop.
    pub fn entries_share_dir(&self) -> Utf8PathBuf {
        self.root.join("entries/share")
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.root.join("linglong.db")
    }

    pub fn repo_config_path(&self) -> Utf8PathBuf {
        self.root.join("config.json")
    }

    /// The checkout directory of a layer: `layers/<id>/<version>/<arch>`,
    /// with a trailing `devel` for devel modules.
    pub fn layer_dir(&self, r: &Ref) -> Utf8PathBuf {
        let mut dir = self
            .layers_dir()
            .join(&r.id)
            .join(r.version_str())
            .join(r.arch.as_str());
        if r.module == Module::Devel {
            dir.push(r.module.as_str());
        }
        dir
    }

    /// Per-user per-app state directory `~/.linglong/<id>`.
    pub fn user_app_dir(&self, id: &str) -> Utf8PathBuf {
        self.home.join(".linglong").join(id)
    }

    /// Per-container scratch directory under the user's runtime dir.
    pub fn container_work_dir(&self, container_id: &str) -> Utf8PathBuf {
        self.runtime_dir.join("linglong").join(container_id)
    }
}

fn detect_root() -> Utf8PathBuf {
    if let Ok(root) = std::env::var(ROOT_ENV) {
        if !root.is_empty() {
            return Utf8PathBuf::from(root);
        }
    }
    for candidate in ROOT_CANDIDATES {
        if Utf8Path::new(candidate).exists() {
            return Utf8PathBuf::from(*candidate);
        }
    }
    Utf8PathBuf::from(ROOT_CANDIDATES[ROOT_CANDIDATES.len() - 1])
}

/// Decide whether `/etc/os-release` content names a deepin variant.
fn os_release_is_deepin(content: &str) -> bool {
    for line in content.lines() {
        if let Some(id) = line.strip_prefix("ID=") {
            let id = id.trim().trim_matches('"');
            return matches!(id, "deepin" | "Deepin" | "uos");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_release_detection() {
        assert!(os_release_is_deepin("NAME=uos\nID=uos\n"));
        assert!(os_release_is_deepin("ID=\"deepin\"\n"));
        assert!(!os_release_is_deepin("ID=debian\n"));
        assert!(!os_release_is_deepin(""));
    }

    #[test]
    fn test_layer_dir_devel_suffix() {
        let env = crate::fixture::test_host_env(Utf8Path::new("/tmp/x"));
        let r: Ref = "app/1.0/x86_64/devel".parse().unwrap();
        assert_eq!(
            env.layer_dir(&r),
            Utf8PathBuf::from("/tmp/x/linglong/layers/app/1.0/x86_64/devel")
        );
        let r: Ref = "app/1.0/x86_64".parse().unwrap();
        assert_eq!(
            env.layer_dir(&r),
            Utf8PathBuf::from("/tmp/x/linglong/layers/app/1.0/x86_64")
        );
    }
}

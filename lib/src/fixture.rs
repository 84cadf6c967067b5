//! Test fixtures: fabricated hosts and installed layouts.

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::host::HostEnv;
use crate::package::{Arch, LayerInfo, Permissions, Ref};
use crate::runtime::AppLayout;

/// The runtime every fake app depends on.
pub(crate) const FIXTURE_RUNTIME: &str = "org.deepin.Runtime";
pub(crate) const FIXTURE_RUNTIME_VERSION: &str = "20.5.0";

/// A host whose store root, home, and runtime dir live in one tempdir.
pub(crate) struct TestHost {
    #[allow(dead_code)]
    tempdir: TempDir,
    pub(crate) env: HostEnv,
}

/// A plain [`HostEnv`] rooted at `root`, without any backing directories.
pub(crate) fn test_host_env(root: &Utf8Path) -> HostEnv {
    HostEnv {
        root: root.join("linglong"),
        arch: Arch::X86_64,
        uid: 1000,
        gid: 1000,
        username: "tester".to_string(),
        home: root.join("home"),
        runtime_dir: root.join("run"),
        cache_dir: root.join("cache"),
        is_deepin: true,
    }
}

impl TestHost {
    pub(crate) fn new() -> Self {
        let tempdir = tempfile::tempdir().expect("creating fixture tempdir");
        let base = Utf8PathBuf::from_path_buf(tempdir.path().to_path_buf()).expect("utf-8 tempdir");
        let env = test_host_env(&base);
        for dir in [&env.root, &env.home, &env.runtime_dir, &env.cache_dir] {
            std::fs::create_dir_all(dir).expect("creating fixture dirs");
        }
        Self { tempdir, env }
    }

    /// Check out a fake app layer plus its runtime layer and return the
    /// layout the composer consumes.
    pub(crate) fn install_fake_app(
        &self,
        id: &str,
        version: &str,
        user_permissions: &[(&str, &str)],
    ) -> AppLayout {
        let runtime_ref: Ref = format!("{FIXTURE_RUNTIME}/{FIXTURE_RUNTIME_VERSION}/x86_64")
            .parse()
            .expect("runtime ref");
        let runtime_root = self.env.layer_dir(&runtime_ref);
        std::fs::create_dir_all(runtime_root.join("files/bin")).expect("runtime files");
        let runtime_info = LayerInfo {
            appid: FIXTURE_RUNTIME.to_string(),
            version: FIXTURE_RUNTIME_VERSION.to_string(),
            arch: vec!["x86_64".to_string()],
            kind: "runtime".to_string(),
            ..Default::default()
        };
        std::fs::write(
            runtime_root.join("info.json"),
            serde_json::to_vec(&runtime_info).expect("runtime info"),
        )
        .expect("writing runtime info");

        let app_ref: Ref = format!("{id}/{version}/x86_64").parse().expect("app ref");
        let app_root = self.env.layer_dir(&app_ref);
        std::fs::create_dir_all(app_root.join("files/bin")).expect("app files");
        std::fs::create_dir_all(app_root.join("entries/applications")).expect("app entries");
        std::fs::write(
            app_root.join(format!("entries/applications/{id}.desktop")),
            format!("[Desktop Entry]\nName={id}\nExec=deepin-calculator %u\n"),
        )
        .expect("writing desktop entry");

        let permissions = if user_permissions.is_empty() {
            None
        } else {
            Some(Permissions {
                filesystem: Some(crate::package::FilesystemPermissions {
                    user: user_permissions
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                }),
                ..Default::default()
            })
        };
        let info = LayerInfo {
            appid: id.to_string(),
            version: version.to_string(),
            arch: vec!["x86_64".to_string()],
            kind: "app".to_string(),
            runtime: format!("{FIXTURE_RUNTIME}/{FIXTURE_RUNTIME_VERSION}/x86_64"),
            permissions,
            ..Default::default()
        };
        std::fs::write(
            app_root.join("info.json"),
            serde_json::to_vec(&info).expect("app info"),
        )
        .expect("writing app info");

        AppLayout {
            app_ref,
            runtime_ref,
            app_root,
            runtime_root: runtime_root.join("files"),
            info,
            runtime_info: Some(runtime_info),
        }
    }
}

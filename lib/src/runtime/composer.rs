//! Composition of per-launch OCI configurations.
//!
//! The composer is a pure function of the installed layout and the host
//! environment: given the same inputs it produces the same configuration,
//! modulo the generated container id and proxy socket path. It inspects the
//! filesystem read-only, except for creating the instance working directory
//! and the per-app user state directories it redirects into.

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::container::Container;
use super::dbus_proxy::DbusFilter;
use super::oci::{Annotations, DbusProxyInfo, IdMap, Mount, NativeRootfs, OverlayRootfs, Spec};
use crate::host::HostEnv;
use crate::package::{Arch, LayerInfo, Module, Ref};
use crate::xdg;

/// Environment variables forwarded from the caller into the container.
/// `PATH` and `HOME` are rewritten instead of forwarded.
const ENV_KEEP: &[&str] = &[
    "DISPLAY",
    "LANG",
    "LANGUAGE",
    "XAUTHORITY",
    "XDG_SESSION_DESKTOP",
    "XDG_SESSION_TYPE",
    "XDG_CURRENT_DESKTOP",
    "XMODIFIERS",
    "DESKTOP_SESSION",
    "WAYLAND_DISPLAY",
    "CLUTTER_IM_MODULE",
    "QT4_IM_MODULE",
    "GTK_IM_MODULE",
    "QT_IM_MODULE",
    "QT_AUTO_SCREEN_SCALE_FACTOR",
    "QT_SCALE_FACTOR",
    "QT_SCREEN_SCALE_FACTORS",
    "auto_proxy",
    "http_proxy",
    "https_proxy",
    "ftp_proxy",
    "no_proxy",
    "USER",
    "LC_ALL",
    "TERM",
    "GDMSESSION",
];

/// Runtime id marking wine runtimes, which need the overlay root and
/// `/usr` overrides.
const WINE_RUNTIME_MARKER: &str = "org.deepin.Wine";

/// The resolved installed state a launch builds on.
#[derive(Debug, Clone)]
pub struct AppLayout {
    pub app_ref: Ref,
    pub runtime_ref: Ref,
    /// `layers/<id>/<version>/<arch>` of the app.
    pub app_root: Utf8PathBuf,
    /// The runtime tree mounted at `/runtime`; `<layer>/files` when that
    /// subdirectory exists.
    pub runtime_root: Utf8PathBuf,
    pub info: LayerInfo,
    pub runtime_info: Option<LayerInfo>,
}

/// Per-launch options carried in from the request.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit command line; when unset the desktop entry decides.
    pub exec: Option<String>,
    /// `KEY=VALUE` variables supplied by the caller.
    pub user_env: Vec<String>,
    pub dbus: DbusOptions,
}

#[derive(Debug, Clone, Default)]
pub struct DbusOptions {
    /// Route the session bus through a filtering proxy.
    pub proxy: bool,
    pub bus_type: String,
    pub filter: DbusFilter,
}

pub struct Composer<'a> {
    pub host: &'a HostEnv,
}

impl Composer<'_> {
    #[context("Composing configuration for {}", layout.app_ref)]
    pub fn compose(
        &self,
        layout: &AppLayout,
        opts: &RunOptions,
        container: &Container,
    ) -> Result<Spec> {
        let mut spec = Spec::skeleton();
        let root_path = container.working_directory.join("root");
        std::fs::create_dir_all(&root_path)
            .with_context(|| format!("Creating {root_path}"))?;
        spec.root.path = root_path;
        spec.root.readonly = false;

        self.stage_rootfs(&mut spec, layout, container)?;
        self.stage_system(&mut spec);
        self.stage_dbus(&mut spec, layout, opts, container);
        self.stage_user(&mut spec, layout, opts)?;
        self.stage_permissions(&mut spec, layout, container)?;
        self.stage_host(&mut spec);
        self.fix_mounts(&mut spec, layout)?;
        self.stage_process(&mut spec, layout, opts)?;
        self.write_env_file(&mut spec, container)?;
        Ok(spec)
    }

    /// Decide the root composition: a native bind root, or an overlay when
    /// wine, declared overlay mounts, a devel module, or a base layer on a
    /// non-deepin host require one.
    fn stage_rootfs(
        &self,
        spec: &mut Spec,
        layout: &AppLayout,
        container: &Container,
    ) -> Result<()> {
        let app_id = layout.app_ref.id.as_str();
        let wine = layout.runtime_root.as_str().contains(WINE_RUNTIME_MARKER);
        let overlay_rules = layout
            .info
            .overlayfs
            .as_ref()
            .map(|o| o.mounts.as_slice())
            .unwrap_or_default();
        let devel = layout.app_ref.module == Module::Devel;

        // On hosts that do not ship the deepin userland, the runtime's own
        // runtime (the base) is layered over /usr and /etc.
        let mut basics: Option<(Utf8PathBuf, Utf8PathBuf)> = None;
        if !self.host.is_deepin {
            if let Some(runtime_info) = &layout.runtime_info {
                if !runtime_info.runtime.is_empty() {
                    let base_root = self
                        .host
                        .layers_dir()
                        .join(&runtime_info.runtime)
                        .join("files");
                    basics = Some((base_root.join("usr"), base_root.join("etc")));
                }
            }
        }

        let overlay = wine || !overlay_rules.is_empty() || devel || basics.is_some();

        let mut annotations = Annotations {
            container_root_path: container.working_directory.clone(),
            ..Default::default()
        };
        if overlay {
            let overlayfs_dir = container.working_directory.join(".overlayfs");
            annotations.overlayfs = Some(OverlayRootfs {
                lower_parent: overlayfs_dir.join("lower_parent"),
                upper: overlayfs_dir.join("upper"),
                workdir: overlayfs_dir.join("workdir"),
                mounts: Vec::new(),
            });
        } else {
            annotations.native = Some(NativeRootfs::default());
        }

        let mut mounts: Vec<Mount> = vec![
            Mount::ro_bind("/usr", "/usr"),
            Mount::ro_bind("/etc", "/etc"),
            Mount::ro_bind(layout.runtime_root.as_str(), "/runtime"),
            Mount::ro_bind("/usr/share/locale/", "/usr/share/locale/"),
        ];
        if devel {
            mounts.push(Mount::ro_bind(
                layout.app_root.join("devel/files/debug").as_str(),
                format!("/usr/lib/debug/opt/apps/{app_id}/files"),
            ));
            // Only the debug data of the runtime's devel module is layered.
            let runtime_layer = layout
                .runtime_root
                .as_str()
                .trim_end_matches("/files")
                .to_string();
            mounts.push(Mount::ro_bind(
                format!("{runtime_layer}/devel/files/debug"),
                "/usr/lib/debug/runtime",
            ));
        }
        if overlay && wine {
            // The wine runtime overrides the host /usr; these sit behind it
            // in overlay order.
            for sub in ["bin", "include", "lib", "sbin", "share"] {
                mounts.push(Mount::ro_bind(
                    layout.runtime_root.join(sub).as_str(),
                    format!("/usr/{sub}"),
                ));
            }
            for sub in ["opt/deepinwine", "opt/deepin-wine6-stable"] {
                mounts.push(Mount::ro_bind(
                    layout.runtime_root.join(sub).as_str(),
                    format!("/{sub}"),
                ));
            }
        }
        if overlay && !overlay_rules.is_empty() {
            let substitute = |raw: &str| -> String {
                raw.replace("$APP_ROOT_PATH", layout.app_root.as_str())
                    .replace("$RUNTIME_ROOT_PATH", layout.runtime_root.as_str())
                    .replace("$APP_ROOT_SHARE_PATH", self.host.entries_share_dir().as_str())
                    .replace("$LINGLONG_ROOT", self.host.root.as_str())
            };
            for rule in overlay_rules {
                mounts.push(Mount::ro_bind(
                    substitute(&rule.source),
                    substitute(&rule.destination),
                ));
            }
        }
        if let Some((basics_usr, basics_etc)) = basics {
            mounts.push(Mount::ro_bind(basics_usr.as_str(), "/usr"));
            mounts.push(Mount::ro_bind(basics_etc.as_str(), "/etc"));
        }
        // The app layer itself is writable; some apps update resources in
        // their own tree.
        mounts.push(Mount::rw_bind(
            layout.app_root.as_str(),
            format!("/opt/apps/{app_id}"),
        ));

        match (&mut annotations.overlayfs, &mut annotations.native) {
            (Some(o), _) => o.mounts = mounts,
            (_, Some(n)) => n.mounts = mounts,
            _ => unreachable!(),
        }
        spec.annotations = Some(annotations);

        self.stage_arch_env(spec, layout, overlay)
    }

    /// The fixed per-arch library and plugin search paths.
    fn stage_arch_env(&self, spec: &mut Spec, layout: &AppLayout, overlay: bool) -> Result<()> {
        let app_id = layout.app_ref.id.as_str();
        let app_lib = format!("/opt/apps/{app_id}/files/lib");
        let triple = match layout.app_ref.arch {
            Arch::X86_64 => "x86_64-linux-gnu",
            Arch::Arm64 => "aarch64-linux-gnu",
            arch => bail!("no supported arch: {arch}"),
        };
        let env = &mut spec.process.env;
        env.push(format!(
            "QT_PLUGIN_PATH=/opt/apps/{app_id}/files/plugins:/runtime/lib/{triple}/qt5/plugins:/usr/lib/{triple}/qt5/plugins"
        ));
        env.push(format!(
            "QT_QPA_PLATFORM_PLUGIN_PATH=/opt/apps/{app_id}/files/plugins/platforms:/runtime/lib/{triple}/qt5/plugins/platforms:/usr/lib/{triple}/qt5/plugins/platforms"
        ));
        if !overlay {
            env.push(format!(
                "GST_PLUGIN_PATH=/opt/apps/{app_id}/files/lib/{triple}/gstreamer-1.0"
            ));
        }
        let mut ld_paths = vec![app_lib.clone(), format!("{app_lib}/{triple}")];
        ld_paths.push("/runtime/lib".to_string());
        ld_paths.push(format!("/runtime/lib/{triple}"));
        if layout.app_ref.arch == Arch::X86_64 {
            ld_paths.push("/runtime/lib/i386-linux-gnu".to_string());
        }
        ld_paths.push("/usr/lib".to_string());
        ld_paths.push(format!("/usr/lib/{triple}"));
        env.push(format!("LD_LIBRARY_PATH={}", ld_paths.join(":")));
        Ok(())
    }

    /// Device nodes every app gets.
    fn stage_system(&self, spec: &mut Spec) {
        for dev in ["/dev/dri", "/dev/snd"] {
            spec.mounts.push(Mount::bind(dev, dev));
        }
    }

    /// Session and system bus plumbing.
    fn stage_dbus(
        &self,
        spec: &mut Spec,
        layout: &AppLayout,
        opts: &RunOptions,
        container: &Container,
    ) {
        let bus_dst = self.host.runtime_dir.join("bus");
        let proxy_path = self
            .host
            .runtime_dir
            .join(".dbus-proxy")
            .join(format!("session-bus-proxy-{}", container.id));
        if opts.dbus.proxy {
            spec.mounts
                .push(Mount::bind(proxy_path.as_str(), bus_dst.as_str()));
        } else {
            spec.mounts
                .push(Mount::bind(bus_dst.as_str(), bus_dst.as_str()));
        }
        spec.mounts.push(Mount::bind(
            "/run/dbus/system_bus_socket",
            "/run/dbus/system_bus_socket",
        ));
        if let Some(annotations) = spec.annotations.as_mut() {
            annotations.dbus_proxy_info = Some(DbusProxyInfo {
                app_id: layout.app_ref.id.clone(),
                enable: opts.dbus.proxy,
                bus_type: opts.dbus.bus_type.clone(),
                proxy_path: if opts.dbus.proxy {
                    proxy_path.to_string()
                } else {
                    String::new()
                },
                name: opts.dbus.filter.name.clone(),
                path: opts.dbus.filter.path.clone(),
                interface: opts.dbus.filter.interface.clone(),
            });
        }
    }

    /// The user view: a private runtime dir, redirected dotfile trees under
    /// `~/.linglong/<id>`, selected read-only passthroughs, and the
    /// environment/id mappings.
    fn stage_user(&self, spec: &mut Spec, layout: &AppLayout, opts: &RunOptions) -> Result<()> {
        let host = self.host;
        let app_id = layout.app_ref.id.as_str();
        let runtime_dir = host.runtime_dir.as_str();

        spec.mounts.push(Mount {
            destination: runtime_dir.to_string(),
            fstype: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: ["nodev", "nosuid", "mode=700"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        });

        let mut binds: Vec<(Utf8PathBuf, Utf8PathBuf)> = Vec::new();
        let rt = |s: &str| host.runtime_dir.join(s);
        binds.push((rt("pulse"), rt("pulse")));
        binds.push((rt("gvfs"), rt("gvfs")));
        if Utf8Path::new("/run/udev").is_dir() {
            binds.push(("/run/udev".into(), "/run/udev".into()));
        }
        for video in list_dir_matching(Utf8Path::new("/dev"), "video") {
            binds.push((video.clone(), video));
        }
        for wayland in list_dir_matching(&host.runtime_dir, "wayland") {
            binds.push((wayland.clone(), wayland));
        }

        // The host home itself stays visible; the dotfile trees below are
        // redirected to per-app subtrees.
        binds.push((host.home.clone(), host.home.clone()));

        let app_user_dir = host.user_app_dir(app_id);
        let app_config = ensure_user_dir(&app_user_dir.join("config"))?;
        let app_cache = ensure_user_dir(&app_user_dir.join("cache"))?;
        let app_share = ensure_user_dir(&app_user_dir.join("share"))?;
        let app_icons = ensure_user_dir(&app_share.join("icons"))?;
        binds.push((app_user_dir.clone(), app_user_dir.clone()));
        // Icons are shared with the host both ways so installed themes and
        // app-exported icons resolve.
        binds.push((host.home.join(".local/share/icons"), app_icons.clone()));
        binds.push((app_share.clone(), host.home.join(".local/share")));
        binds.push((app_icons.clone(), host.home.join(".local/share/icons")));
        binds.push((app_config.clone(), host.home.join(".config")));
        binds.push((app_cache.clone(), host.home.join(".cache")));
        binds.push((rt("dconf"), rt("dconf")));
        for (source, destination) in binds {
            spec.mounts
                .push(Mount::bind(source.as_str(), destination.as_str()));
        }

        // Host configuration passed through read-only.
        let systemd_user = ensure_user_dir(&host.home.join(".config/systemd/user"))?;
        let app_systemd_user = ensure_user_dir(&app_config.join("systemd/user"))?;
        let user_dirs_config = host.home.join(".config/user-dirs.dirs");
        let mut ro_binds: Vec<(Utf8PathBuf, Utf8PathBuf)> = vec![
            (systemd_user, app_systemd_user),
            (user_dirs_config.clone(), user_dirs_config.clone()),
            (user_dirs_config, app_config.join("user-dirs.dirs")),
            (host.home.join(".local/share/fonts"), app_share.join("fonts")),
            (
                host.home.join(".config/fontconfig"),
                app_config.join("fontconfig"),
            ),
            (
                host.home.join(".local/share/fonts"),
                "/run/host/appearance/user-fonts".into(),
            ),
            (
                host.home.join(".cache/fontconfig"),
                "/run/host/appearance/user-fonts-cache".into(),
            ),
            (host.home.join(".config/dconf"), app_config.join("dconf")),
        ];
        if let Ok(xauthority) = std::env::var("XAUTHORITY") {
            ro_binds.push((xauthority.clone().into(), xauthority.into()));
        }
        for (source, destination) in ro_binds {
            spec.mounts
                .push(Mount::ro_bind(source.as_str(), destination.as_str()));
        }

        // Environment: forwarded variables first, then the fixed overrides.
        let user_env = parse_env_pairs(&opts.user_env);
        for (key, value) in &user_env {
            if ENV_KEEP.contains(&key.as_str()) {
                spec.process.env.push(format!("{key}={value}"));
            }
        }
        let app_bin = format!("/opt/apps/{app_id}/files/bin");
        let inherited_path = user_env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        spec.process
            .env
            .push(format!("PATH={app_bin}:/runtime/bin:{inherited_path}"));
        let home = user_env
            .iter()
            .find(|(k, _)| k == "HOME")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| host.home.to_string());
        spec.process.env.push(format!("HOME={home}"));
        spec.process
            .env
            .push(format!("XDG_RUNTIME_DIR={runtime_dir}"));
        spec.process.env.push(format!(
            "DBUS_SESSION_BUS_ADDRESS=unix:path={}",
            host.runtime_dir.join("bus")
        ));
        let host_data_dirs = std::env::var("XDG_DATA_DIRS")
            .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_string());
        spec.process.env.push(format!(
            "XDG_DATA_DIRS=/opt/apps/{app_id}/files/share:/runtime/share:{host_data_dirs}"
        ));
        spec.process.env.push(format!("XDG_CONFIG_HOME={app_config}"));
        spec.process.env.push(format!("XDG_CACHE_HOME={app_cache}"));
        spec.process.env.push(format!("XDG_DATA_HOME={app_share}"));

        spec.process.cwd = host.home.to_string();

        spec.linux.uid_mappings.push(IdMap {
            host_id: host.uid as u64,
            container_id: 0,
            size: 1,
        });
        spec.linux.gid_mappings.push(IdMap {
            host_id: host.gid as u64,
            container_id: 0,
            size: 1,
        });
        Ok(())
    }

    /// Declared permission mounts plus the user-directory grants.
    fn stage_permissions(
        &self,
        spec: &mut Spec,
        layout: &AppLayout,
        container: &Container,
    ) -> Result<()> {
        let mut has_tmp = false;
        let permissions = layout.info.permissions.as_ref();
        for rule in permissions.map(|p| p.mounts.as_slice()).unwrap_or_default() {
            if rule.source.is_empty() || rule.destination.is_empty() {
                continue;
            }
            let fstype = if rule.fstype.is_empty() {
                "bind".to_string()
            } else {
                rule.fstype.clone()
            };
            let options: Vec<String> = if rule.options.is_empty() {
                vec!["ro".to_string(), "rbind".to_string()]
            } else {
                rule.options.split(',').map(|s| s.to_string()).collect()
            };
            if rule.destination == "/tmp" {
                has_tmp = true;
            }
            spec.mounts.push(Mount {
                destination: rule.destination.clone(),
                fstype,
                source: rule.source.clone(),
                options,
            });
        }

        if let Some(user) = permissions.and_then(|p| p.filesystem.as_ref()).map(|f| &f.user) {
            for key in xdg::USER_DIR_KEYS {
                let Some(value) = user.get(*key) else {
                    continue;
                };
                let Some(dir) = xdg::user_dir(self.host, key) else {
                    continue;
                };
                match value.as_str() {
                    "rw" => spec
                        .mounts
                        .push(Mount::rw_bind(dir.as_str(), dir.as_str())),
                    "r" | "ro" => spec
                        .mounts
                        .push(Mount::ro_bind(dir.as_str(), dir.as_str())),
                    _ => {}
                }
            }
        }

        if !has_tmp {
            // A private /tmp backed by a host-visible per-instance dir.
            let tmp = Utf8PathBuf::from("/tmp/linglong").join(&container.id);
            std::fs::create_dir_all(&tmp).with_context(|| format!("Creating {tmp}"))?;
            spec.mounts.push(Mount::bind(tmp.as_str(), "/tmp"));
        }
        Ok(())
    }

    /// Host facts every app may read.
    fn stage_host(&self, spec: &mut Spec) {
        let ro = [
            ("/etc/resolv.conf", "/run/host/network/etc/resolv.conf"),
            ("/run/resolvconf", "/run/resolvconf"),
            ("/usr/share/fonts", "/run/host/appearance/fonts"),
            ("/usr/lib/locale/", "/usr/lib/locale/"),
            ("/usr/share/themes", "/usr/share/themes"),
            ("/usr/share/icons", "/usr/share/icons"),
            ("/usr/share/zoneinfo", "/usr/share/zoneinfo"),
            ("/etc/localtime", "/run/host/etc/localtime"),
            ("/etc/machine-id", "/run/host/etc/machine-id"),
            ("/etc/machine-id", "/etc/machine-id"),
            ("/var", "/var"),
            ("/var/cache/fontconfig", "/run/host/appearance/fonts-cache"),
        ];
        for (source, destination) in ro {
            spec.mounts.push(Mount::ro_bind(source, destination));
        }
        for nvidia in list_dir_matching(Utf8Path::new("/dev"), "nvidia") {
            spec.mounts
                .push(Mount::ro_bind(nvidia.as_str(), nvidia.as_str()));
        }
        spec.mounts
            .push(Mount::bind("/tmp/.X11-unix", "/tmp/.X11-unix"));
    }

    /// Trailing adjustments: removable media, the runtime's xdg-open
    /// helpers, compiled schemas, and the per-app full `/dev` allow list.
    fn fix_mounts(&self, spec: &mut Spec, layout: &AppLayout) -> Result<()> {
        for dir in ["/media", "/mnt"] {
            spec.mounts.push(Mount::rw_bind(dir, dir));
        }
        for helper in ["xdg-open", "xdg-email"] {
            spec.mounts.push(Mount::bind(
                layout.runtime_root.join("bin").join(helper).as_str(),
                format!("/usr/bin/{helper}"),
            ));
        }
        let schemas = self
            .host
            .entries_share_dir()
            .join("glib-2.0/schemas/gschemas.compiled");
        if schemas.is_file() {
            spec.mounts
                .push(Mount::bind(schemas.as_str(), schemas.as_str()));
        }
        if dev_allow_list(&self.host.root).contains(&layout.app_ref.id) {
            spec.mounts.push(Mount::bind("/dev", "/dev"));
        }
        Ok(())
    }

    /// Decide the process argv: the explicit exec line, or the desktop
    /// entry's `Exec=` with field codes stripped.
    fn stage_process(&self, spec: &mut Spec, layout: &AppLayout, opts: &RunOptions) -> Result<()> {
        let args = match opts.exec.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(exec) => shlex::split(exec)
                .ok_or_else(|| anyhow!("unparseable exec line {exec:?}"))?,
            None => {
                let applications = layout.app_root.join("entries/applications");
                let desktop = xdg::find_desktop_file(&applications)?;
                let exec = xdg::desktop_exec(&desktop)?;
                xdg::parse_exec(&exec)
            }
        };
        if args.is_empty() {
            bail!("no command to run for {}", layout.app_ref);
        }
        spec.process.args = args;
        Ok(())
    }

    /// Persist the final environment and bind it where the entry shim
    /// expects it.
    fn write_env_file(&self, spec: &mut Spec, container: &Container) -> Result<()> {
        let env_path = container.working_directory.join("env");
        let mut data = spec.process.env.join("\n");
        data.push('\n');
        std::fs::write(&env_path, data).with_context(|| format!("Writing {env_path}"))?;
        spec.mounts
            .push(Mount::bind(env_path.as_str(), "/run/app/env"));
        Ok(())
    }
}

/// Entries of `dir` whose names start with `prefix`, sorted for stable
/// output.
fn list_dir_matching(dir: &Utf8Path, prefix: &str) -> Vec<Utf8PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = dir.read_dir_utf8() {
        for entry in entries.flatten() {
            if entry.file_name().starts_with(prefix) {
                out.push(entry.path().to_path_buf());
            }
        }
    }
    out.sort();
    out
}

fn ensure_user_dir(path: &Utf8Path) -> Result<Utf8PathBuf> {
    std::fs::create_dir_all(path).with_context(|| format!("Creating {path}"))?;
    Ok(path.to_path_buf())
}

fn parse_env_pairs(pairs: &[String]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Ids granted the full `/dev`, from `<root>/app_config.json` when present.
fn dev_allow_list(root: &Utf8Path) -> Vec<String> {
    #[derive(serde::Deserialize, Default)]
    #[serde(rename_all = "camelCase", default)]
    struct AppConfig {
        app_mount_dev_list: Vec<String>,
    }
    let path = root.join("app_config.json");
    let Ok(data) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match serde_json::from_str::<AppConfig>(&data) {
        Ok(cfg) => cfg.app_mount_dev_list,
        Err(e) => {
            tracing::warn!("ignoring malformed {path}: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::TestHost;

    fn compose_calc(host: &TestHost, user_perm: &[(&str, &str)]) -> (Spec, Container) {
        let layout = host.install_fake_app("org.deepin.calculator", "5.7.16", user_perm);
        let container = Container::create(&host.env, &layout.app_ref).unwrap();
        let composer = Composer { host: &host.env };
        let spec = composer
            .compose(&layout, &RunOptions::default(), &container)
            .unwrap();
        (spec, container)
    }

    #[test]
    fn test_native_root_and_mount_order() {
        let host = TestHost::new();
        let (spec, container) = compose_calc(&host, &[]);
        let annotations = spec.annotations.as_ref().unwrap();
        assert!(annotations.overlayfs.is_none());
        let rootfs = annotations.native.as_ref().unwrap();
        assert_eq!(rootfs.mounts[0].destination, "/usr");
        assert_eq!(rootfs.mounts[0].options, vec!["ro", "rbind"]);
        assert_eq!(rootfs.mounts[1].destination, "/etc");
        assert_eq!(rootfs.mounts[2].destination, "/runtime");
        let app = rootfs.mounts.last().unwrap();
        assert_eq!(app.destination, "/opt/apps/org.deepin.calculator");
        assert_eq!(app.options, vec!["rw", "rbind"]);
        assert_eq!(annotations.container_root_path, container.working_directory);
        // Device mounts precede user and host mounts.
        let dri = spec
            .mounts
            .iter()
            .position(|m| m.destination == "/dev/dri")
            .unwrap();
        let home = spec
            .mounts
            .iter()
            .position(|m| m.destination == host.env.home.as_str())
            .unwrap();
        assert!(dri < home);
    }

    #[test]
    fn test_devel_module_uses_overlay() {
        let host = TestHost::new();
        let mut layout = host.install_fake_app("org.deepin.calculator", "5.7.16", &[]);
        layout.app_ref.module = Module::Devel;
        let container = Container::create(&host.env, &layout.app_ref).unwrap();
        let composer = Composer { host: &host.env };
        let spec = composer
            .compose(&layout, &RunOptions::default(), &container)
            .unwrap();
        let overlay = spec
            .annotations
            .as_ref()
            .unwrap()
            .overlayfs
            .as_ref()
            .unwrap();
        assert!(overlay
            .lower_parent
            .as_str()
            .ends_with(".overlayfs/lower_parent"));
        assert!(overlay.mounts.iter().any(|m| m.destination
            == "/usr/lib/debug/opt/apps/org.deepin.calculator/files"));
    }

    #[test]
    fn test_environment_composition() {
        let host = TestHost::new();
        let layout = host.install_fake_app("org.deepin.calculator", "5.7.16", &[]);
        let container = Container::create(&host.env, &layout.app_ref).unwrap();
        let composer = Composer { host: &host.env };
        let opts = RunOptions {
            user_env: vec!["PATH=/custom/bin".to_string(), "DISPLAY=:1".to_string()],
            ..Default::default()
        };
        let spec = composer.compose(&layout, &opts, &container).unwrap();
        let env = &spec.process.env;
        assert!(env.contains(&"DISPLAY=:1".to_string()));
        assert!(env.contains(
            &"PATH=/opt/apps/org.deepin.calculator/files/bin:/runtime/bin:/custom/bin".to_string()
        ));
        let ld = env
            .iter()
            .find(|e| e.starts_with("LD_LIBRARY_PATH="))
            .unwrap();
        assert_eq!(
            ld.as_str(),
            "LD_LIBRARY_PATH=/opt/apps/org.deepin.calculator/files/lib\
             :/opt/apps/org.deepin.calculator/files/lib/x86_64-linux-gnu\
             :/runtime/lib:/runtime/lib/x86_64-linux-gnu:/runtime/lib/i386-linux-gnu\
             :/usr/lib:/usr/lib/x86_64-linux-gnu"
        );
        assert!(env.iter().any(|e| e
            == &format!("HOME={}", host.env.home)));
        assert!(env.iter().any(|e| e.starts_with("XDG_CONFIG_HOME=")
            && e.ends_with("/.linglong/org.deepin.calculator/config")));
        // The env file was written and mounted.
        assert!(spec.mounts.iter().any(|m| m.destination == "/run/app/env"));
        let env_file = container.working_directory.join("env");
        assert!(env_file.is_file());
    }

    #[test]
    fn test_user_directory_permissions() {
        let host = TestHost::new();
        let (spec, _) = compose_calc(
            &host,
            &[("Desktop", "rw"), ("Documents", "r"), ("Unknown", "rw")],
        );
        let desktop = host.env.home.join("Desktop");
        let documents = host.env.home.join("Documents");
        let user_mounts: Vec<&Mount> = spec
            .mounts
            .iter()
            .filter(|m| {
                m.source == desktop.as_str() || m.source == documents.as_str()
            })
            .collect();
        assert_eq!(user_mounts.len(), 2);
        let desktop_mount = user_mounts
            .iter()
            .find(|m| m.source == desktop.as_str())
            .unwrap();
        assert_eq!(desktop_mount.options, vec!["rw", "rbind"]);
        let documents_mount = user_mounts
            .iter()
            .find(|m| m.source == documents.as_str())
            .unwrap();
        assert_eq!(documents_mount.options, vec!["ro", "rbind"]);
        // The unknown key produced nothing at all.
        assert!(!spec
            .mounts
            .iter()
            .any(|m| m.source.ends_with("/Unknown")));
    }

    #[test]
    fn test_compose_is_deterministic() {
        let host = TestHost::new();
        let layout = host.install_fake_app("org.deepin.calculator", "5.7.16", &[("Desktop", "rw")]);
        let container = Container::create(&host.env, &layout.app_ref).unwrap();
        let composer = Composer { host: &host.env };
        let opts = RunOptions::default();
        let a = composer.compose(&layout, &opts, &container).unwrap();
        let b = composer.compose(&layout, &opts, &container).unwrap();
        similar_asserts::assert_eq!(
            serde_json::to_string_pretty(&a).unwrap(),
            serde_json::to_string_pretty(&b).unwrap()
        );
    }

    #[test]
    fn test_dbus_proxy_annotation() {
        let host = TestHost::new();
        let layout = host.install_fake_app("org.deepin.calculator", "5.7.16", &[]);
        let container = Container::create(&host.env, &layout.app_ref).unwrap();
        let composer = Composer { host: &host.env };
        let opts = RunOptions {
            dbus: DbusOptions {
                proxy: true,
                bus_type: "session".to_string(),
                filter: DbusFilter {
                    name: vec!["org.freedesktop.Notifications".to_string()],
                    ..Default::default()
                },
            },
            ..Default::default()
        };
        let spec = composer.compose(&layout, &opts, &container).unwrap();
        let info = spec
            .annotations
            .as_ref()
            .unwrap()
            .dbus_proxy_info
            .as_ref()
            .unwrap();
        assert!(info.enable);
        assert!(info.proxy_path.contains(".dbus-proxy/session-bus-proxy-"));
        assert_eq!(info.name, vec!["org.freedesktop.Notifications"]);
        let bus_dst = host.env.runtime_dir.join("bus");
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.destination == bus_dst.as_str() && m.source == info.proxy_path));
    }
}

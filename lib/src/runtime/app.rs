//! Loading installed apps and supervising their container executor.
//!
//! The executor (`ll-box`) is forked with one end of a socket pair; the
//! serialized OCI configuration, NUL terminated, goes down the other end.
//! Additional process specs for `exec` reuse the same socket with the same
//! framing. The child dies with us via `PR_SET_PDEATHSIG`, and re-checks
//! its parent between fork and exec in case we lost that race.

use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use linglong_utils::CommandRedirectionExt;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::composer::{AppLayout, Composer, RunOptions};
use super::container::Container;
use super::oci::{Process, Spec};
use crate::host::HostEnv;
use crate::package::{LayerInfo, Ref, Version};
use crate::xdg;

/// The container executor binary.
const EXECUTOR: &str = "ll-box";

/// The fd number the executor reads its configuration from.
const CONFIG_FD: i32 = 3;

/// Resolve the installed layout for a reference: pick the latest matching
/// checked out version, read its metadata, and locate its runtime.
#[context("Loading installed app {wanted}")]
pub fn load_layout(env: &HostEnv, wanted: &Ref) -> Result<AppLayout> {
    let version = latest_layer_version(env, &wanted.id, &version_prefix(wanted))
        .ok_or_else(|| anyhow!("no layer checked out for {wanted}"))?;
    let app_ref = wanted.with_version(version);
    let app_root = env.layer_dir(&app_ref);
    let info = LayerInfo::load(&app_root)?;
    if info.runtime.is_empty() {
        bail!("layer {app_ref} declares no runtime");
    }
    let mut runtime_ref: Ref = info
        .runtime
        .parse()
        .map_err(|e| anyhow!("layer {app_ref} has malformed runtime ref: {e}"))?;
    // A short runtime version is a prefix; resolve it against what is
    // checked out.
    let exact = runtime_ref
        .version
        .as_ref()
        .map(|v| v.component_count() == 4)
        .unwrap_or(false);
    if !exact {
        let prefix = runtime_ref
            .version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        let resolved = latest_layer_version(env, &runtime_ref.id, &prefix)
            .ok_or_else(|| anyhow!("runtime {} not checked out", info.runtime))?;
        runtime_ref = runtime_ref.with_version(resolved);
    }
    let runtime_layer = env.layer_dir(&runtime_ref);
    let runtime_files = runtime_layer.join("files");
    let runtime_root = if runtime_files.is_dir() {
        runtime_files
    } else {
        runtime_layer.clone()
    };
    let runtime_info = LayerInfo::load(&runtime_layer).ok();
    Ok(AppLayout {
        app_ref,
        runtime_ref,
        app_root,
        runtime_root,
        info,
        runtime_info,
    })
}

fn version_prefix(r: &Ref) -> String {
    r.version.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// Scan `layers/<id>` for the greatest checked out version matching the
/// dotted prefix.
fn latest_layer_version(env: &HostEnv, id: &str, prefix: &str) -> Option<Version> {
    let dir = env.layers_dir().join(id);
    let mut best: Option<Version> = None;
    for entry in dir.read_dir_utf8().ok()?.flatten() {
        let Ok(candidate) = entry.file_name().parse::<Version>() else {
            continue;
        };
        if !candidate.has_prefix(prefix) {
            continue;
        }
        if best.as_ref().map(|b| candidate >= *b).unwrap_or(true) {
            best = Some(candidate);
        }
    }
    best
}

/// Record the launch configuration under `~/.linglong/<id>/app.yaml` so the
/// user can inspect what their app runs against.
pub fn write_app_config(env: &HostEnv, layout: &AppLayout) -> Result<()> {
    #[derive(serde::Serialize)]
    struct PackageSection<'a> {
        r#ref: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permissions: Option<&'a crate::package::Permissions>,
    }
    #[derive(serde::Serialize)]
    struct AppConfig<'a> {
        package: PackageSection<'a>,
        runtime: String,
    }
    let dir = env.user_app_dir(&layout.app_ref.id);
    std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
    let config = AppConfig {
        package: PackageSection {
            r#ref: layout.app_ref.to_string(),
            permissions: layout.info.permissions.as_ref(),
        },
        runtime: layout.runtime_ref.to_string(),
    };
    let path = dir.join("app.yaml");
    let data = serde_yaml::to_string(&config)?;
    std::fs::write(&path, data).with_context(|| format!("Writing {path}"))?;
    Ok(())
}

/// A spawned container: the instance record, the control socket, and the
/// child handle the supervisor waits on.
pub struct RunningApp {
    pub container: Container,
    base_process: Process,
    socket: Mutex<UnixStream>,
    child: Mutex<Child>,
}

impl RunningApp {
    /// Compose and launch. On spawn failure the working directory is
    /// removed.
    #[context("Starting {}", layout.app_ref)]
    pub fn launch(
        env: &HostEnv,
        layout: &AppLayout,
        opts: &RunOptions,
    ) -> Result<Self> {
        let mut container = Container::create(env, &layout.app_ref)?;
        let composer = Composer { host: env };
        let spec = match composer.compose(layout, opts, &container) {
            Ok(spec) => spec,
            Err(e) => {
                cleanup_workdir(&container.working_directory);
                return Err(e);
            }
        };
        match spawn_executor(&spec, &container.working_directory) {
            Ok((child, socket)) => {
                container.pid = child.id() as i64;
                write_pid_file(&container.working_directory, container.pid);
                Ok(Self {
                    container,
                    base_process: spec.process.clone(),
                    socket: Mutex::new(socket),
                    child: Mutex::new(child),
                })
            }
            Err(e) => {
                cleanup_workdir(&container.working_directory);
                Err(e)
            }
        }
    }

    /// Block until the executor exits.
    pub fn wait(&self) -> Result<std::process::ExitStatus> {
        let mut child = self.child.lock().unwrap();
        child.wait().context("Waiting for container executor")
    }

    /// Deliver an additional process spec into the running container. The
    /// spec inherits env and cwd from the original configuration unless
    /// overridden.
    #[context("Sending exec to container {}", self.container.id)]
    pub fn exec(&self, cmd: &str, env: &str, cwd: &str) -> Result<()> {
        let mut process = self.base_process.clone();
        if !env.is_empty() {
            process
                .env
                .extend(env.split(',').map(|s| s.to_string()));
        }
        if !cwd.is_empty() {
            process.cwd = cwd.to_string();
        }
        let args = if cmd.trim().is_empty() {
            self.desktop_args()?
        } else {
            shlex::split(cmd).ok_or_else(|| anyhow!("unparseable command {cmd:?}"))?
        };
        if args.is_empty() {
            bail!("no command to exec");
        }
        process.args = args;
        self.send_process(&process)
    }

    fn desktop_args(&self) -> Result<Vec<String>> {
        // Fall back to the original argv of the configuration.
        Ok(self.base_process.args.clone())
    }

    /// Write one NUL-terminated JSON document to the control socket.
    /// Writers serialize on the socket mutex; cross-process callers are
    /// expected to serialize themselves.
    fn send_process(&self, process: &Process) -> Result<()> {
        let data = serde_json::to_vec(process)?;
        let mut socket = self.socket.lock().unwrap();
        socket.write_all(&data)?;
        socket.write_all(&[0])?;
        Ok(())
    }

    /// SIGKILL the executor; the supervisor's `wait` reaps it.
    pub fn stop(&self) -> Result<()> {
        nix::sys::signal::kill(Pid::from_raw(self.container.pid as i32), Signal::SIGKILL)
            .with_context(|| format!("Killing container {}", self.container.id))
    }
}

/// Fork the executor with the configuration socket at a known fd.
fn spawn_executor(spec: &Spec, workdir: &Utf8Path) -> Result<(Child, UnixStream)> {
    let (ours, theirs) = UnixStream::pair().context("Creating config socket pair")?;
    let theirs: OwnedFd = theirs.into();
    let mut cmd = Command::new(EXECUTOR);
    cmd.arg(CONFIG_FD.to_string());
    cmd.current_dir(workdir);
    cmd.take_fd_n(Arc::new(theirs), CONFIG_FD);
    preexec_die_with_parent(&mut cmd);
    let child = cmd
        .spawn()
        .with_context(|| format!("Spawning {EXECUTOR}"))?;
    let mut socket = ours;
    let data = serde_json::to_vec(spec)?;
    socket
        .write_all(&data)
        .and_then(|()| socket.write_all(&[0]))
        .context("Writing configuration to executor")?;
    Ok((child, socket))
}

/// Reparent semantics: the child is killed when we die, and if we exited
/// between fork and the prctl it notices the changed parent and aborts.
#[allow(unsafe_code)]
fn preexec_die_with_parent(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    let parent = nix::unistd::getpid();
    unsafe {
        cmd.pre_exec(move || {
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            if nix::unistd::getppid() != parent {
                return Err(std::io::Error::other("supervisor exited before exec"));
            }
            Ok(())
        });
    }
}

fn write_pid_file(workdir: &Utf8Path, pid: i64) {
    let path = workdir.join(format!("{pid}.pid"));
    if let Err(e) = std::fs::write(&path, b"") {
        tracing::warn!("failed to write {path}: {e}");
    }
}

fn cleanup_workdir(workdir: &Utf8Path) {
    if let Err(e) = std::fs::remove_dir_all(workdir) {
        tracing::warn!("failed to clean up {workdir}: {e}");
    }
}

/// Resolve the argv a plain `run` of this layout would use; exported for
/// container reuse, where a second `start` turns into an `exec`.
pub fn default_exec_args(layout: &AppLayout) -> Result<Vec<String>> {
    let applications = layout.app_root.join("entries/applications");
    let desktop = xdg::find_desktop_file(&applications)?;
    let exec = xdg::desktop_exec(&desktop)?;
    Ok(xdg::parse_exec(&exec))
}

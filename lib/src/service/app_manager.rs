//! The launcher service: start, exec, stop, and list of live containers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use fn_error_context::context;

use super::{ExecParams, JobPool, QueryReply, Reply, RunParams, StatusCode, RUN_POOL_THREADS};
use crate::catalog::{Catalog, CatalogFilter};
use crate::entries;
use crate::host::HostEnv;
use crate::package::{Module, Ref};
use crate::runtime::{
    self, default_exec_args, load_layout, write_app_config, Container, DbusOptions, RunOptions,
    RunningApp,
};

pub struct AppManager {
    host: HostEnv,
    catalog: Catalog,
    instances: Arc<Mutex<HashMap<String, Arc<RunningApp>>>>,
    pool: JobPool,
}

impl AppManager {
    pub fn new(host: HostEnv) -> Result<Self> {
        let catalog = Catalog::open(&host.catalog_path())?;
        Ok(Self {
            host,
            catalog,
            instances: Arc::new(Mutex::new(HashMap::new())),
            pool: JobPool::new("run-worker", RUN_POOL_THREADS),
        })
    }

    /// Launch an app, or reuse its live container by delivering a new
    /// process spec. The reply is immediate; the worker supervises the
    /// executor for the container's lifetime.
    pub fn start(&self, params: &RunParams) -> Reply {
        if let Some(rejection) = self.preflight(params) {
            return rejection;
        }
        let host = self.host.clone();
        let instances = Arc::clone(&self.instances);
        let params = params.clone();
        let app_id = params.app_id.trim().to_string();
        self.pool.dispatch(move || {
            if let Err(e) = run_container(&host, &instances, &params) {
                tracing::error!("start of {} failed: {e:#}", params.app_id);
            }
        });
        Reply::new(StatusCode::Success, format!("Start {app_id} success!"))
    }

    /// Launch on the caller's thread, supervising the container until it
    /// exits; the inline CLI path.
    pub fn start_blocking(&self, params: &RunParams) -> Reply {
        if let Some(rejection) = self.preflight(params) {
            return rejection;
        }
        let app_id = params.app_id.trim().to_string();
        match run_container(&self.host, &self.instances, params) {
            Ok(()) => Reply::new(StatusCode::Success, format!("Start {app_id} success!")),
            Err(e) => Reply::new(StatusCode::Fail, format!("{e:#}")),
        }
    }

    /// Request validation shared by the dispatching and inline starts;
    /// `Some` is the rejection to reply with.
    fn preflight(&self, params: &RunParams) -> Option<Reply> {
        let app_id = params.app_id.trim().to_string();
        if app_id.is_empty() {
            return Some(Reply::new(StatusCode::UserInputParamErr, "appId input err"));
        }
        let channel = if params.channel.trim().is_empty() {
            crate::package::DEFAULT_CHANNEL
        } else {
            params.channel.trim()
        };
        let module = params.module.trim();

        let installed = self.catalog.is_installed(CatalogFilter {
            id: Some(&app_id),
            version: (!params.version.trim().is_empty()).then_some(params.version.trim()),
            arch: Some(self.host.arch.as_str()),
            channel: Some(channel),
            module: (!module.is_empty()).then_some(module),
            ..Default::default()
        });
        if !installed.unwrap_or(false) {
            return Some(Reply::new(
                StatusCode::PkgNotInstalled,
                format!(
                    "{app_id}, version:{}, arch:{}, channel:{channel}, module:{module} not installed",
                    params.version.trim(),
                    self.host.arch
                ),
            ));
        }
        // A devel module runs against its release files; require both.
        if module == Module::Devel.as_str() {
            let release = self.catalog.is_installed(CatalogFilter {
                id: Some(&app_id),
                version: (!params.version.trim().is_empty()).then_some(params.version.trim()),
                arch: Some(self.host.arch.as_str()),
                channel: Some(channel),
                module: Some(Module::Runtime.as_str()),
                ..Default::default()
            });
            if !release.unwrap_or(false) {
                return Some(Reply::new(
                    StatusCode::PkgNotInstalled,
                    format!("{app_id}, no corresponding release package found"),
                ));
            }
        }

        // Make app-provided user units discoverable before the app runs.
        let user_units = self.host.entries_share_dir().join("systemd/user");
        if user_units.is_dir() {
            let target = self.host.home.join(".config/systemd/user");
            if let Err(e) = entries::link_entries(&user_units, &target) {
                tracing::warn!("linking user units failed: {e:#}");
            }
        }
        None
    }

    /// Deliver a process spec into a live container.
    pub fn exec(&self, params: &ExecParams) -> Reply {
        let instance = {
            let instances = self.instances.lock().unwrap();
            instances.get(&params.container_id).cloned()
        };
        let Some(instance) = instance else {
            return Reply::new(
                StatusCode::Fail,
                format!("No such container {}", params.container_id),
            );
        };
        match instance.exec(&params.cmd, &params.env, &params.cwd) {
            Ok(()) => Reply::new(StatusCode::Success, "Exec succeeded"),
            Err(e) => Reply::new(StatusCode::Fail, format!("{e:#}")),
        }
    }

    /// SIGKILL a live container; the supervising worker reaps and
    /// deregisters it.
    pub fn stop(&self, container_id: &str) -> Reply {
        let instance = {
            let instances = self.instances.lock().unwrap();
            instances.get(container_id).cloned()
        };
        let Some(instance) = instance else {
            return Reply::new(
                StatusCode::UserInputParamErr,
                format!("containerId:{container_id} not exist"),
            );
        };
        match instance.stop() {
            Ok(()) => Reply::new(
                StatusCode::ErrorPkgKillSuccess,
                format!("kill app:{} success", instance.container.package_name),
            ),
            Err(e) => {
                tracing::error!("stopping {container_id} failed: {e:#}");
                Reply::new(
                    StatusCode::ErrorPkgKillFailed,
                    format!("kill container failed, containerId:{container_id}"),
                )
            }
        }
    }

    /// A snapshot of the live containers.
    pub fn list(&self) -> Vec<Container> {
        let instances = self.instances.lock().unwrap();
        let mut out: Vec<Container> = instances
            .values()
            .map(|app| app.container.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Like [`list`], rendered as the query reply payload.
    pub fn list_reply(&self) -> QueryReply {
        let containers = self.list();
        let result = serde_json::to_string(&containers).unwrap_or_else(|_| "[]".to_string());
        QueryReply::new(StatusCode::Success, "Success", result)
    }

    /// Readiness probe for the bus registrar.
    pub fn status(&self) -> &'static str {
        "active"
    }
}

/// The per-launch worker body: reuse a live container or spawn a new one
/// and supervise it to exit.
#[context("Running container for {}", params.app_id)]
fn run_container(
    host: &HostEnv,
    instances: &Mutex<HashMap<String, Arc<RunningApp>>>,
    params: &RunParams,
) -> Result<()> {
    let wanted: Ref = params
        .app_id
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut wanted = wanted;
    if !params.version.trim().is_empty() {
        wanted = wanted.with_version(
            params
                .version
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid version: {e}"))?,
        );
    }
    let layout = load_layout(host, &wanted)?;

    // One container per app: a second start delivers the exec line into
    // the live instance instead.
    {
        let instances = instances.lock().unwrap();
        if let Some(existing) = instances
            .values()
            .find(|app| app.container.package_name == layout.app_ref.to_string())
        {
            let exec = if params.exec.trim().is_empty() {
                shlex::try_join(default_exec_args(&layout)?.iter().map(|s| s.as_str()))
                    .context("joining desktop exec")?
            } else {
                params.exec.clone()
            };
            return existing.exec(&exec, &params.app_env, "");
        }
    }

    write_app_config(host, &layout)?;

    let mut dbus = DbusOptions {
        proxy: !params.no_dbus_proxy,
        bus_type: params.bus_type.clone(),
        ..Default::default()
    };
    if !params.dbus_filter_file.trim().is_empty() {
        dbus.filter = runtime::load_filter(camino::Utf8Path::new(params.dbus_filter_file.trim()))?;
    }
    for (list, value) in [
        (&mut dbus.filter.name, params.filter_name.trim()),
        (&mut dbus.filter.path, params.filter_path.trim()),
        (&mut dbus.filter.interface, params.filter_interface.trim()),
    ] {
        if !value.is_empty() && !list.iter().any(|v| v == value) {
            list.push(value.to_string());
        }
    }

    let opts = RunOptions {
        exec: (!params.exec.trim().is_empty()).then(|| params.exec.clone()),
        user_env: params
            .app_env
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        dbus,
    };

    let running = Arc::new(RunningApp::launch(host, &layout, &opts)?);
    let id = running.container.id.clone();
    instances
        .lock()
        .unwrap()
        .insert(id.clone(), Arc::clone(&running));
    let status = running.wait();
    instances.lock().unwrap().remove(&id);
    let status = status?;
    tracing::debug!("container {id} exited: {status:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::TestHost;

    #[test]
    fn test_exec_without_container() {
        let host = TestHost::new();
        let mgr = AppManager::new(host.env.clone()).unwrap();
        let reply = mgr.exec(&ExecParams {
            container_id: "nonexistent".into(),
            cmd: "/bin/ls".into(),
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::Fail.code());
        assert!(reply.message.contains("No such container"));
    }

    #[test]
    fn test_stop_without_container() {
        let host = TestHost::new();
        let mgr = AppManager::new(host.env.clone()).unwrap();
        let reply = mgr.stop("nope");
        assert_eq!(reply.code, StatusCode::UserInputParamErr.code());
    }

    #[test]
    fn test_start_requires_installed() {
        let host = TestHost::new();
        let mgr = AppManager::new(host.env.clone()).unwrap();
        let reply = mgr.start(&RunParams {
            app_id: "org.example.absent".into(),
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::PkgNotInstalled.code());
    }

    #[test]
    fn test_list_is_empty_snapshot() {
        let host = TestHost::new();
        let mgr = AppManager::new(host.env.clone()).unwrap();
        assert!(mgr.list().is_empty());
        let reply = mgr.list_reply();
        assert_eq!(reply.code, StatusCode::Success.code());
        assert_eq!(reply.result, "[]");
        assert_eq!(mgr.status(), "active");
    }
}

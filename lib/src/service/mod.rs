//! The service facade: typed request and reply records, the reply codes,
//! and the worker pool the long-running operations dispatch onto.

mod app_manager;
mod helper;
mod package_manager;
mod status_code;

pub use app_manager::AppManager;
pub use helper::{NullSystemHelper, SystemHelper, SYSTEM_HELPER_SOCKET};
pub use package_manager::{PackageBackend, PackageManager};
pub use status_code::StatusCode;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Installer worker cap.
pub(crate) const INSTALL_POOL_THREADS: usize = 10;
/// Launcher worker cap; every live container occupies one worker for its
/// whole lifetime.
pub(crate) const RUN_POOL_THREADS: usize = 100;

/// Backend selector value requesting the flatpak bridge.
pub const REPO_POINT_FLATPAK: &str = "flatpak";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallParams {
    pub app_id: String,
    pub version: String,
    pub arch: String,
    pub channel: String,
    pub module: String,
    /// Empty for the native backend, `flatpak` for the bridge.
    pub repo_point: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UninstallParams {
    pub app_id: String,
    pub version: String,
    pub arch: String,
    pub channel: String,
    pub module: String,
    pub delete_all_versions: bool,
    pub delete_app_data: bool,
    pub repo_point: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateParams {
    pub app_id: String,
    pub version: String,
    pub arch: String,
    pub channel: String,
    pub module: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParams {
    pub app_id: String,
    pub arch: String,
    /// Bypass the metadata cache.
    pub force: bool,
    pub repo_point: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunParams {
    pub app_id: String,
    pub version: String,
    pub arch: String,
    pub channel: String,
    pub module: String,
    /// Explicit command line overriding the desktop entry.
    pub exec: String,
    /// Comma separated `KEY=VALUE` pairs.
    pub app_env: String,
    pub no_dbus_proxy: bool,
    pub bus_type: String,
    pub filter_name: String,
    pub filter_path: String,
    pub filter_interface: String,
    /// Optional filter file; when set it must load, a missing or
    /// unreadable file fails the launch.
    pub dbus_filter_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecParams {
    pub container_id: String,
    pub cmd: String,
    pub env: String,
    pub cwd: String,
}

/// The universal reply: a wire-stable code plus a human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub code: i32,
    pub message: String,
}

impl Reply {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
        }
    }

    pub fn is(&self, code: StatusCode) -> bool {
        self.code == code.code()
    }
}

/// A reply carrying a result payload (a JSON array of descriptors or
/// container records).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    pub code: i32,
    pub message: String,
    pub result: String,
}

impl QueryReply {
    pub fn new(code: StatusCode, message: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            result: result.into(),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed pool of plain worker threads. Jobs queue when all workers are
/// busy; there is no cancellation, callers observe progress by polling.
pub(crate) struct JobPool {
    tx: mpsc::Sender<Job>,
}

impl JobPool {
    pub(crate) fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..threads {
            let rx = Arc::clone(&rx);
            let builder = std::thread::Builder::new().name(format!("{name}-{i}"));
            // Worker threads live for the process lifetime.
            let spawned = builder.spawn(move || loop {
                let job = {
                    let rx = rx.lock().unwrap();
                    rx.recv()
                };
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            });
            if let Err(e) = spawned {
                tracing::warn!("failed to spawn worker thread: {e}");
            }
        }
        Self { tx }
    }

    pub(crate) fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::error!("worker pool is gone, dropping job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_pool_runs_jobs_concurrently() {
        let pool = JobPool::new("test", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 {
            assert!(std::time::Instant::now() < deadline, "jobs did not finish");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_reply_codes() {
        let reply = Reply::new(StatusCode::PkgInstalling, "x is installing");
        assert_eq!(reply.code, 607);
        assert!(reply.is(StatusCode::PkgInstalling));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["code"], 607);
        assert_eq!(json["message"], "x is installing");
    }
}

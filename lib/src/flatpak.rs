//! The flatpak bridge back-end: requests carrying the flatpak repo point
//! are shelled out to the `flatpak` binary instead of the native store.

use serde_json::json;

use crate::service::{
    InstallParams, PackageBackend, QueryParams, QueryReply, Reply, StatusCode, UninstallParams,
};
use crate::task::Task;

#[derive(Debug, Default)]
pub struct FlatpakBackend;

impl PackageBackend for FlatpakBackend {
    fn install(&self, params: &InstallParams) -> Reply {
        let app_id = params.app_id.trim();
        let result = Task::new(format!("Installing {app_id} via flatpak"), "flatpak")
            .args(["install", "--user", "-y", app_id])
            .capture_failure()
            .run();
        match result {
            Ok(()) => Reply::new(
                StatusCode::PkgInstallSuccess,
                format!("install {app_id} success"),
            ),
            Err(e) => {
                tracing::error!("flatpak install {app_id} failed: {e:#}");
                Reply::new(StatusCode::PkgInstallFailed, format!("install {app_id} failed"))
            }
        }
    }

    fn uninstall(&self, params: &UninstallParams) -> Reply {
        let app_id = params.app_id.trim();
        let result = Task::new(format!("Uninstalling {app_id} via flatpak"), "flatpak")
            .args(["uninstall", "--user", "-y", app_id])
            .capture_failure()
            .run();
        match result {
            Ok(()) => Reply::new(
                StatusCode::PkgUninstallSuccess,
                format!("uninstall {app_id} success"),
            ),
            Err(e) => {
                tracing::error!("flatpak uninstall {app_id} failed: {e:#}");
                Reply::new(
                    StatusCode::PkgUninstallFailed,
                    format!("uninstall {app_id} failed"),
                )
            }
        }
    }

    fn query(&self, params: &QueryParams) -> QueryReply {
        let app_id = params.app_id.trim();
        let (args, label): (&[&str], &str) = if app_id == "installed" {
            (&["list"], "flatpaklist")
        } else {
            (&["search", app_id], "flatpakquery")
        };
        let output = Task::new(format!("Querying {app_id} via flatpak"), "flatpak")
            .args(args.iter().copied())
            .read();
        match output {
            Ok(output) => {
                let result = json!([{ "appId": label, "description": output }]);
                QueryReply::new(
                    StatusCode::ErrorPkgQuerySuccess,
                    format!("flatpak query {app_id} success"),
                    result.to_string(),
                )
            }
            Err(e) => {
                tracing::error!("flatpak query {app_id} failed: {e:#}");
                QueryReply::new(StatusCode::ErrorPkgQueryFailed, "flatpak not installed", "")
            }
        }
    }
}

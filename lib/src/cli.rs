//! # linglong CLI
//!
//! Command line front-end over the installer and launcher services. With no
//! bus transport configured the services run inline in this process, which
//! is also what `--no-dbus` asks for explicitly.

use std::ffi::OsString;
use std::sync::Once;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use indicatif::ProgressBar;

use crate::config::RepoConfig;
use crate::host::HostEnv;
use crate::package::Ref;
use crate::printer::Printer;
use crate::runtime::load_layout;
use crate::service::{
    AppManager, ExecParams, InstallParams, NullSystemHelper, PackageManager, QueryParams,
    QueryReply, Reply, RunParams, StatusCode, UninstallParams, UpdateParams,
};

/// How often install/update progress is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exit status for failed operations, mirroring a `-1` return from main.
const FAILURE_EXIT: i32 = 255;

/// Run an application in its sandbox
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RunOpts {
    /// Application to run, as `id` or `id/version`
    pub(crate) app: String,

    /// Command to run instead of the desktop entry's Exec line
    #[clap(trailing_var_arg = true)]
    pub(crate) command: Vec<String>,

    /// Extra KEY=VALUE environment entries
    #[clap(long = "env")]
    pub(crate) envs: Vec<String>,

    /// Talk to the session bus directly instead of through the filter proxy
    #[clap(long)]
    pub(crate) no_dbus_proxy: bool,

    /// Bus proxy filter configuration file
    #[clap(long)]
    pub(crate) dbus_proxy_cfg: Option<String>,

    /// Which bus the proxy filters
    #[clap(long, default_value = "session")]
    pub(crate) bus_type: String,

    /// Additional allowed well-known name
    #[clap(long)]
    pub(crate) filter_name: Option<String>,

    /// Additional allowed object path
    #[clap(long)]
    pub(crate) filter_path: Option<String>,

    /// Additional allowed interface
    #[clap(long)]
    pub(crate) filter_interface: Option<String>,
}

#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum RepoAction {
    /// Point the store at a different remote repository
    Modify {
        /// Remote name
        #[clap(long, default_value = "repo")]
        name: String,
        /// Remote base URL
        url: String,
    },
}

/// Sandboxed application manager
#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    Run(RunOpts),
    /// List running containers
    Ps,
    /// Run a command in a running container
    Exec {
        /// Container id
        pagoda: String,
        #[clap(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Enter a running container (alias surface of exec)
    Enter {
        /// Container id
        pagoda: String,
        #[clap(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Stop a running container
    Kill {
        /// Container id
        pagoda: String,
    },
    /// Install applications
    Install {
        /// References to install, as `id`, `id/version`, ...
        #[clap(required = true)]
        tiers: Vec<String>,
    },
    /// Uninstall applications
    Uninstall {
        #[clap(required = true)]
        tiers: Vec<String>,
        /// Remove every installed version
        #[clap(long)]
        all: bool,
        /// Also purge the per-user app data
        #[clap(long)]
        prune: bool,
    },
    /// Update applications to the newest remote version
    Upgrade {
        #[clap(required = true)]
        tiers: Vec<String>,
    },
    /// Search the remote repository
    Search {
        text: String,
        /// Back-end to search, e.g. `flatpak`
        #[clap(long = "type", default_value = "")]
        kind: String,
    },
    /// List installed applications
    List {
        /// Back-end to list, e.g. `flatpak`
        #[clap(long = "type", default_value = "")]
        kind: String,
    },
    /// Show or modify repository configuration
    Repo {
        #[clap(subcommand)]
        action: Option<RepoAction>,
    },
    /// Show the metadata of an installed layer
    Info {
        /// Layer reference, as `id` or `id/version`
        layer: String,
    },
}

/// Manage and run sandboxed linglong applications
#[derive(Debug, Parser)]
#[clap(name = "ll-cli")]
pub(crate) struct CliOpts {
    /// Print a single JSON object instead of human readable output
    #[clap(long, global = true)]
    pub(crate) json: bool,

    /// Run the installer inline instead of calling the system daemon
    #[clap(long, global = true)]
    pub(crate) no_dbus: bool,

    #[clap(subcommand)]
    pub(crate) command: Opt,
}

/// Parse arguments and dispatch.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opts = CliOpts::parse_from(args);
    let printer = if opts.json {
        Printer::Json
    } else {
        Printer::Human
    };
    let host = HostEnv::detect()?;
    match opts.command {
        Opt::Run(run) => cmd_run(host, printer, run),
        Opt::Ps => {
            let mgr = AppManager::new(host)?;
            finish_query(printer, mgr.list_reply(), true)
        }
        Opt::Exec { pagoda, command } | Opt::Enter { pagoda, command } => {
            let mgr = AppManager::new(host)?;
            let cmd = shlex::try_join(command.iter().map(|s| s.as_str()))?;
            let reply = mgr.exec(&ExecParams {
                container_id: pagoda,
                cmd,
                ..Default::default()
            });
            finish(printer, reply)
        }
        Opt::Kill { pagoda } => {
            let mgr = AppManager::new(host)?;
            let reply = mgr.stop(&pagoda);
            finish(printer, reply)
        }
        Opt::Install { tiers } => cmd_install(host, printer, tiers),
        Opt::Uninstall { tiers, all, prune } => cmd_uninstall(host, printer, tiers, all, prune),
        Opt::Upgrade { tiers } => cmd_upgrade(host, printer, tiers),
        Opt::Search { text, kind } => {
            let pm = package_manager(&host)?;
            let reply = pm.query(&QueryParams {
                app_id: text,
                repo_point: kind,
                ..Default::default()
            });
            finish_query(printer, reply, false)
        }
        Opt::List { kind } => {
            let pm = package_manager(&host)?;
            let reply = pm.query(&QueryParams {
                app_id: "installed".to_string(),
                repo_point: kind,
                ..Default::default()
            });
            finish_query(printer, reply, false)
        }
        Opt::Repo { action } => match action {
            None => {
                let config = RepoConfig::load(&host.repo_config_path());
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Some(RepoAction::Modify { name, url }) => {
                let pm = package_manager(&host)?;
                let reply = pm.modify_repo(&name, &url);
                finish(printer, reply)
            }
        },
        Opt::Info { layer } => {
            let wanted: Ref = layer.parse().map_err(|e| anyhow!("{e}"))?;
            let layout = load_layout(&host, &wanted)?;
            println!("{}", serde_json::to_string_pretty(&layout.info)?);
            Ok(())
        }
    }
}

fn package_manager(host: &HostEnv) -> Result<PackageManager> {
    PackageManager::new(host.clone(), Box::<NullSystemHelper>::default())
}

fn cmd_run(host: HostEnv, printer: Printer, run: RunOpts) -> Result<()> {
    let wanted: Ref = run.app.parse().map_err(|e| anyhow!("{e}"))?;
    let exec = if run.command.is_empty() {
        String::new()
    } else {
        shlex::try_join(run.command.iter().map(|s| s.as_str()))?
    };
    let params = RunParams {
        app_id: wanted.id.clone(),
        version: wanted
            .version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        channel: wanted.channel.clone(),
        module: wanted.module.as_str().to_string(),
        exec,
        app_env: run.envs.join(","),
        no_dbus_proxy: run.no_dbus_proxy,
        bus_type: run.bus_type,
        filter_name: run.filter_name.unwrap_or_default(),
        filter_path: run.filter_path.unwrap_or_default(),
        filter_interface: run.filter_interface.unwrap_or_default(),
        dbus_filter_file: run.dbus_proxy_cfg.unwrap_or_default(),
        ..Default::default()
    };
    let mgr = AppManager::new(host)?;
    // Inline mode supervises the container on this thread; we return when
    // the app exits.
    let reply = mgr.start_blocking(&params);
    finish(printer, reply)
}

fn cmd_install(host: HostEnv, printer: Printer, tiers: Vec<String>) -> Result<()> {
    let pm = package_manager(&host)?;
    for tier in tiers {
        let params = install_params(&tier)?;
        let mut reply = pm.install(&params);
        if reply.is(StatusCode::PkgInstalling) {
            reply = poll_until_done(&pm, &params, 0, printer);
        }
        printer.print_reply(&reply);
        exit_on_failure(&reply);
    }
    Ok(())
}

fn cmd_uninstall(
    host: HostEnv,
    printer: Printer,
    tiers: Vec<String>,
    all: bool,
    prune: bool,
) -> Result<()> {
    let pm = package_manager(&host)?;
    for tier in tiers {
        let base = install_params(&tier)?;
        let reply = pm.uninstall(&UninstallParams {
            app_id: base.app_id,
            version: base.version,
            channel: base.channel,
            module: base.module,
            delete_all_versions: all,
            delete_app_data: prune,
            ..Default::default()
        });
        printer.print_reply(&reply);
        exit_on_failure(&reply);
    }
    Ok(())
}

fn cmd_upgrade(host: HostEnv, printer: Printer, tiers: Vec<String>) -> Result<()> {
    let pm = package_manager(&host)?;
    for tier in tiers {
        let base = install_params(&tier)?;
        let update = UpdateParams {
            app_id: base.app_id.clone(),
            version: base.version.clone(),
            channel: base.channel.clone(),
            module: base.module.clone(),
            ..Default::default()
        };
        let mut reply = pm.update(&update);
        if reply.is(StatusCode::PkgUpdating) {
            reply = poll_until_done(&pm, &base, 1, printer);
        }
        printer.print_reply(&reply);
        exit_on_failure(&reply);
    }
    Ok(())
}

fn install_params(tier: &str) -> Result<InstallParams> {
    let r: Ref = tier.parse().map_err(|e| anyhow!("{e}"))?;
    Ok(InstallParams {
        app_id: r.id.clone(),
        version: r
            .version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        channel: r.channel.clone(),
        module: r.module.as_str().to_string(),
        ..Default::default()
    })
}

/// Poll the download status until a terminal code shows up, spinning a
/// progress indicator with the reported message meanwhile.
fn poll_until_done(
    pm: &PackageManager,
    params: &InstallParams,
    kind: u32,
    printer: Printer,
) -> Reply {
    let spinner = match printer {
        Printer::Human => {
            let pb = ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(120));
            install_sigint_guard(pb.clone());
            Some(pb)
        }
        Printer::Json => None,
    };
    loop {
        let status = pm.get_download_status(params, kind);
        let in_progress = status.is(StatusCode::PkgInstalling) || status.is(StatusCode::PkgUpdating);
        if !in_progress {
            if let Some(pb) = &spinner {
                pb.finish_and_clear();
            }
            return status;
        }
        if let Some(pb) = &spinner {
            pb.set_message(status.message.clone());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Make sure an interrupt restores the terminal cursor before exiting; the
/// daemon-side work continues regardless.
fn install_sigint_guard(spinner: ProgressBar) {
    static ONCE: Once = Once::new();
    ONCE.call_once(move || {
        let result = ctrlc::set_handler(move || {
            spinner.finish_and_clear();
            std::process::exit(130);
        });
        if let Err(e) = result {
            tracing::warn!("failed to install interrupt handler: {e}");
        }
    });
}

fn finish(printer: Printer, reply: Reply) -> Result<()> {
    printer.print_reply(&reply);
    exit_on_failure(&reply);
    Ok(())
}

fn finish_query(printer: Printer, reply: QueryReply, containers: bool) -> Result<()> {
    if containers {
        printer.print_containers(&reply);
    } else {
        printer.print_meta_reply(&reply);
    }
    let code = reply.code;
    if !is_success_code(code) {
        bail!("command failed with code {code}");
    }
    Ok(())
}

fn exit_on_failure(reply: &Reply) {
    if !is_success_code(reply.code) {
        std::process::exit(FAILURE_EXIT);
    }
}

fn is_success_code(code: i32) -> bool {
    [
        StatusCode::Success,
        StatusCode::PkgInstallSuccess,
        StatusCode::PkgUninstallSuccess,
        StatusCode::ErrorPkgUpdateSuccess,
        StatusCode::ErrorPkgKillSuccess,
        StatusCode::ErrorPkgQuerySuccess,
        StatusCode::ErrorModifyRepoSuccess,
        StatusCode::PkgAlreadyInstalled,
    ]
    .iter()
    .any(|c| c.code() == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let opts = CliOpts::parse_from(["ll-cli", "install", "org.deepin.calculator/5.7.16"]);
        assert!(matches!(opts.command, Opt::Install { .. }));
        let opts = CliOpts::parse_from(["ll-cli", "--json", "uninstall", "x", "--all"]);
        assert!(opts.json);
        match opts.command {
            Opt::Uninstall { all, prune, .. } => {
                assert!(all);
                assert!(!prune);
            }
            other => panic!("unexpected {other:?}"),
        }
        let opts = CliOpts::parse_from(["ll-cli", "repo", "modify", "--name", "repo", "https://example.org/"]);
        match opts.command {
            Opt::Repo {
                action: Some(RepoAction::Modify { name, url }),
            } => {
                assert_eq!(name, "repo");
                assert_eq!(url, "https://example.org/");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_run_command_options() {
        let opts = CliOpts::parse_from([
            "ll-cli",
            "run",
            "org.deepin.calculator",
            "--env",
            "LANG=C",
            "--no-dbus-proxy",
        ]);
        match opts.command {
            Opt::Run(run) => {
                assert_eq!(run.app, "org.deepin.calculator");
                assert_eq!(run.envs, vec!["LANG=C"]);
                assert!(run.no_dbus_proxy);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_install_params_from_tier() {
        let params = install_params("org.deepin.calculator/5.7.16").unwrap();
        assert_eq!(params.app_id, "org.deepin.calculator");
        assert_eq!(params.version, "5.7.16");
        assert_eq!(params.channel, "linglong");
        assert_eq!(params.module, "runtime");
        assert!(install_params("a/b/c/d/e/f").is_err());
    }
}

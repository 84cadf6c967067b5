//! The installer service: install, uninstall, update, query, repo
//! maintenance, and download status reporting.
//!
//! Long-running operations are dispatched onto the worker pool and observed
//! through `get_download_status` polls; the committing step of an install is
//! the catalog insert, so overlapping installs of one ref resolve on its
//! uniqueness constraint.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use super::helper::{SystemHelper, KEY_DELETE_DATA};
use super::{
    InstallParams, JobPool, QueryParams, QueryReply, Reply, StatusCode, UninstallParams,
    UpdateParams, INSTALL_POOL_THREADS, REPO_POINT_FLATPAK,
};
use crate::cache::MetaCache;
use crate::catalog::{Catalog, CatalogFilter, InsertOutcome};
use crate::config::RepoConfig;
use crate::entries;
use crate::flatpak::FlatpakBackend;
use crate::host::HostEnv;
use crate::package::{compare_versions, Arch, Module, PackageMeta, Ref, Version, DEFAULT_CHANNEL};
use crate::repo::{read_progress_message, OstreeRepo, RepoClient};

/// A package-manager back-end; the native implementation below and the
/// flatpak bridge both satisfy it.
pub trait PackageBackend: Send + Sync {
    fn install(&self, params: &InstallParams) -> Reply;
    fn uninstall(&self, params: &UninstallParams) -> Reply;
    fn query(&self, params: &QueryParams) -> QueryReply;
}

pub struct PackageManager {
    inner: Arc<Inner>,
    pool: JobPool,
}

struct Inner {
    host: HostEnv,
    catalog: Catalog,
    repo: OstreeRepo,
    client: Mutex<RepoClient>,
    config: Mutex<RepoConfig>,
    helper: Box<dyn SystemHelper>,
    /// Latest reply per in-progress or finished install/update, keyed by
    /// `id/version/arch`.
    state: Mutex<HashMap<String, Reply>>,
    /// Ids currently being installed as dependencies, for cycle detection.
    in_flight: Mutex<HashSet<String>>,
    flatpak: FlatpakBackend,
}

impl PackageManager {
    pub fn new(host: HostEnv, helper: Box<dyn SystemHelper>) -> Result<Self> {
        let catalog = Catalog::open(&host.catalog_path())?;
        let config = RepoConfig::load(&host.repo_config_path());
        let repo = OstreeRepo::at_root(&host.root);
        let cache = MetaCache::open(&host.cache_dir)?;
        let client = RepoClient::new(&config.app_db_url, cache)?;
        Ok(Self {
            inner: Arc::new(Inner {
                host,
                catalog,
                repo,
                client: Mutex::new(client),
                config: Mutex::new(config),
                helper,
                state: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                flatpak: FlatpakBackend::default(),
            }),
            pool: JobPool::new("pm-worker", INSTALL_POOL_THREADS),
        })
    }

    /// Kick off an install and reply immediately; progress and the terminal
    /// code arrive through [`get_download_status`].
    pub fn install(&self, params: &InstallParams) -> Reply {
        let app_id = params.app_id.trim().to_string();
        if app_id.is_empty() {
            return Reply::new(StatusCode::UserInputParamErr, "appId input err");
        }
        if params.repo_point == REPO_POINT_FLATPAK {
            return self.inner.flatpak.install(params);
        }
        let inner = Arc::clone(&self.inner);
        let params = params.clone();
        self.pool.dispatch(move || {
            let _ = inner.install_impl(&params);
        });
        Reply::new(StatusCode::PkgInstalling, format!("{app_id} is installing"))
    }

    /// Install synchronously; used by the inline CLI path and by tests.
    pub fn install_blocking(&self, params: &InstallParams) -> Reply {
        if params.app_id.trim().is_empty() {
            return Reply::new(StatusCode::UserInputParamErr, "appId input err");
        }
        if params.repo_point == REPO_POINT_FLATPAK {
            return self.inner.flatpak.install(params);
        }
        self.inner.install_impl(params)
    }

    pub fn uninstall(&self, params: &UninstallParams) -> Reply {
        if params.app_id.trim().is_empty() {
            return Reply::new(StatusCode::UserInputParamErr, "appId input err");
        }
        if params.repo_point == REPO_POINT_FLATPAK {
            return self.inner.flatpak.uninstall(params);
        }
        self.inner.uninstall_impl(params)
    }

    /// Kick off an update; like installs it is observed by polling.
    pub fn update(&self, params: &UpdateParams) -> Reply {
        let app_id = params.app_id.trim().to_string();
        if app_id.is_empty() {
            return Reply::new(StatusCode::UserInputParamErr, "appId input err");
        }
        let inner = Arc::clone(&self.inner);
        let params = params.clone();
        self.pool.dispatch(move || {
            let _ = inner.update_impl(&params);
        });
        Reply::new(StatusCode::PkgUpdating, format!("{app_id} is updating"))
    }

    pub fn update_blocking(&self, params: &UpdateParams) -> Reply {
        self.inner.update_impl(params)
    }

    pub fn query(&self, params: &QueryParams) -> QueryReply {
        if params.app_id.trim().is_empty() {
            return QueryReply::new(StatusCode::UserInputParamErr, "appId input err", "");
        }
        if params.repo_point == REPO_POINT_FLATPAK {
            return self.inner.flatpak.query(params);
        }
        self.inner.query_impl(params)
    }

    /// Poll install (`kind = 0`) or update (`kind = 1`) progress.
    pub fn get_download_status(&self, params: &InstallParams, kind: u32) -> Reply {
        let app_id = params.app_id.trim();
        if app_id.is_empty() {
            return Reply::new(StatusCode::UserInputParamErr, "package name err");
        }
        let arch = params.arch.trim().to_lowercase();
        if !arch.is_empty() && arch != self.inner.host.arch.as_str() {
            return Reply::new(
                StatusCode::UserInputParamErr,
                format!("app arch:{arch} not support in host"),
            );
        }
        self.inner.download_status_impl(params, kind)
    }

    /// Point the store and the metadata client at a different remote.
    pub fn modify_repo(&self, name: &str, url: &str) -> Reply {
        self.inner.modify_repo_impl(name, url)
    }

    /// The catalog, for read-only surfaces (listing, run pre-checks).
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }
}

impl Inner {
    fn username(&self) -> String {
        self.host.username.clone()
    }

    fn privileged(&self) -> bool {
        self.host.uid == 0
    }

    fn state_key(&self, app_id: &str, version: &str, arch: &str) -> String {
        format!("{app_id}/{version}/{arch}")
    }

    fn finish(&self, key: &str, code: StatusCode, message: impl Into<String>) -> Reply {
        let reply = Reply::new(code, message);
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), reply.clone());
        reply
    }

    fn query_server(&self, id: &str, version: &str, arch: Arch) -> Result<Vec<PackageMeta>> {
        self.client.lock().unwrap().query(id, version, arch)
    }

    fn install_impl(&self, params: &InstallParams) -> Reply {
        let app_id = params.app_id.trim().to_string();
        let version = params.version.trim().to_string();
        let arch_param = params.arch.trim().to_lowercase();
        let channel = default_if_empty(params.channel.trim(), DEFAULT_CHANNEL);
        let module = default_if_empty(params.module.trim(), Module::Runtime.as_str());

        let arch_str = if arch_param.is_empty() {
            self.host.arch.as_str().to_string()
        } else {
            arch_param.clone()
        };
        let key = self.state_key(&app_id, &version, &arch_str);
        // A fresh attempt clears the previous terminal state for this ref.
        self.state.lock().unwrap().remove(&key);

        let arch = match arch_str.parse::<Arch>() {
            Ok(arch) => arch,
            Err(_) => {
                return self.finish(
                    &key,
                    StatusCode::UserInputParamErr,
                    format!("app arch:{arch_param} not support in host"),
                );
            }
        };

        if arch != self.host.arch {
            return self.finish(
                &key,
                StatusCode::UserInputParamErr,
                format!("app arch:{arch} not support in host"),
            );
        }

        let not_found = format!("app:{app_id}, version:{version} not found in repo");
        let metas = match self.query_server(&app_id, &version, arch) {
            Ok(metas) => metas,
            Err(e) => {
                tracing::error!("remote query for {app_id} failed: {e:#}");
                return self.finish(&key, StatusCode::PkgInstallFailed, not_found);
            }
        };
        // Highest version wins; the id must match exactly, fuzzy search
        // results are not installable.
        let Some(meta) = latest_app(&app_id, &metas) else {
            return self.finish(&key, StatusCode::PkgInstallFailed, not_found);
        };
        let mut meta = meta.clone();
        // The index does not answer per channel/module; stamp the request's.
        meta.channel = channel.clone();
        meta.module = module.clone();

        let installed = self.catalog.is_installed(CatalogFilter {
            id: Some(&meta.app_id),
            version: Some(&meta.version),
            channel: Some(&channel),
            module: Some(&module),
            ..Default::default()
        });
        if installed.unwrap_or(false) {
            return self.finish(
                &key,
                StatusCode::PkgAlreadyInstalled,
                format!("{}, version: {} already installed", meta.app_id, meta.version),
            );
        }

        if let Err(e) = self.check_runtime(&meta.runtime, &channel, &module, arch) {
            return self.finish(
                &key,
                StatusCode::InstallRuntimeFailed,
                format!("{e:#}"),
            );
        }

        if !self.host.is_deepin {
            if let Err(e) = self.check_base(&meta.runtime, &channel, &module, arch) {
                return self.finish(&key, StatusCode::InstallBaseFailed, format!("{e:#}"));
            }
        }

        let app_ref = match self.meta_ref(&meta) {
            Ok(r) => r,
            Err(e) => return self.finish(&key, StatusCode::PkgInstallFailed, format!("{e:#}")),
        };
        if let Err(e) = self.download_layer(&app_ref) {
            tracing::error!("downloading {app_ref} failed: {e:#}");
            return self.finish(&key, StatusCode::LoadPkgDataFailed, format!("{e:#}"));
        }

        if let Err(e) = self.add_app_entries(&app_ref) {
            tracing::warn!("linking entries of {app_ref} failed: {e:#}");
        }
        entries::refresh_host_caches(&self.host.entries_share_dir());

        let install_path = self.host.layer_dir(&app_ref);
        if let Err(e) = self.helper.rebuild_install_portal(
            &install_path,
            &app_ref.to_string(),
            &BTreeMap::new(),
        ) {
            tracing::warn!("process post install portal failed: {e:#}");
        }

        meta.kind = "app".to_string();
        match self.catalog.insert(&meta, &self.username()) {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::AlreadyInstalled) => {
                return self.finish(
                    &key,
                    StatusCode::PkgAlreadyInstalled,
                    format!("{}, version: {} already installed", meta.app_id, meta.version),
                );
            }
            Err(e) => {
                return self.finish(&key, StatusCode::PkgInstallFailed, format!("{e:#}"));
            }
        }

        self.finish(
            &key,
            StatusCode::PkgInstallSuccess,
            format!("install {}, version:{} success", meta.app_id, meta.version),
        )
    }

    fn meta_ref(&self, meta: &PackageMeta) -> Result<Ref> {
        let mut r = meta.to_ref()?;
        if !meta.channel.is_empty() {
            r.channel = meta.channel.clone();
        }
        if !meta.module.is_empty() {
            r.module = meta.module.parse()?;
        }
        Ok(r)
    }

    /// Make sure the app's runtime is installed, installing it on demand.
    #[context("Checking runtime {runtime}")]
    fn check_runtime(&self, runtime: &str, channel: &str, module: &str, arch: Arch) -> Result<()> {
        let (id, version, runtime_arch) = split_dependency_ref(runtime)?;
        if version.component_count() < 3 {
            bail!("app runtime:{runtime} runtime version format err");
        }
        // Four components pin the version exactly; three ask for the
        // newest matching build.
        let exact = version.component_count() == 4;
        let requested = if exact { version.to_string() } else { String::new() };
        let metas = self.query_server(&id, &requested, runtime_arch)?;
        let meta = latest_matching(&id, &version.to_string(), &metas)
            .ok_or_else(|| anyhow!("{runtime} not found in repo"))?;
        let mut meta = meta.clone();
        meta.channel = channel.to_string();
        meta.module = module.to_string();
        let installed = self.catalog.is_installed(CatalogFilter {
            id: Some(&meta.app_id),
            version: Some(&meta.version),
            arch: Some(arch.as_str()),
            channel: Some(channel),
            module: Some(module),
            ..Default::default()
        })?;
        if !installed {
            self.install_dependency(meta)?;
        }
        Ok(())
    }

    /// Non-deepin hosts also need the runtime's own runtime, the base.
    #[context("Checking base of runtime {runtime}")]
    fn check_base(&self, runtime: &str, channel: &str, module: &str, arch: Arch) -> Result<()> {
        let (id, version, runtime_arch) = split_dependency_ref(runtime)?;
        let metas = self.query_server(&id, "", runtime_arch)?;
        let runtime_meta = latest_matching(&id, &version.to_string(), &metas)
            .ok_or_else(|| anyhow!("{runtime} not found in repo"))?;
        if runtime_meta.runtime.is_empty() {
            // The runtime is itself a base.
            return Ok(());
        }
        let (base_id, base_version, base_arch) = split_dependency_ref(&runtime_meta.runtime)?;
        let base_metas = self.query_server(&base_id, &base_version.to_string(), base_arch)?;
        let base_meta = base_metas
            .first()
            .ok_or_else(|| anyhow!("{} not found in repo", runtime_meta.runtime))?;
        let mut base_meta = base_meta.clone();
        base_meta.channel = channel.to_string();
        base_meta.module = module.to_string();
        let installed = self.catalog.is_installed(CatalogFilter {
            id: Some(&base_meta.app_id),
            version: Some(&base_meta.version),
            arch: Some(arch.as_str()),
            channel: Some(channel),
            module: Some(module),
            ..Default::default()
        })?;
        if !installed {
            self.install_dependency(base_meta)?;
        }
        Ok(())
    }

    /// Pull, check out and record a runtime or base layer. Dependency
    /// recursion is bounded; revisiting an id mid-install means a cycle.
    #[context("Installing dependency layer")]
    fn install_dependency(&self, mut meta: PackageMeta) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(meta.app_id.clone()) {
                bail!("dependency cycle through {}", meta.app_id);
            }
        }
        let result = (|| -> Result<()> {
            let r = self.meta_ref(&meta)?;
            self.download_layer(&r)?;
            meta.kind = "runtime".to_string();
            let _ = self.catalog.insert(&meta, &self.username())?;
            Ok(())
        })();
        self.in_flight.lock().unwrap().remove(&meta.app_id);
        result
    }

    /// Pull the ref and materialize it under `layers/`.
    #[context("Downloading layer {r}")]
    fn download_layer(&self, r: &Ref) -> Result<()> {
        let config = self.config.lock().unwrap().clone();
        self.repo.ensure(&config.repo_name, &config.remote_repo_url())?;
        let ref_str = r.to_string();
        self.repo
            .pull(&config.repo_name, &ref_str, &r.progress_file_name())?;
        self.repo.checkout(&ref_str, &self.host.layer_dir(r))
    }

    /// Point the shared entries tree at the new version, unless a greater
    /// version is already active.
    #[context("Updating entries for {new_ref}")]
    fn add_app_entries(&self, new_ref: &Ref) -> Result<()> {
        let share = self.host.entries_share_dir();
        if let Some(current) =
            self.catalog
                .latest_installed(&new_ref.id, None, Some(new_ref.arch.as_str()))?
        {
            if let (Some(current_version), Some(new_version)) =
                (current.parsed_version(), new_ref.version.clone())
            {
                if current_version > new_version {
                    // The active version stays active.
                    return Ok(());
                }
                let current_ref = new_ref.with_version(current_version);
                let current_entries =
                    entries::layer_entries_dir(&self.host.layer_dir(&current_ref));
                entries::unlink_entries(&current_entries, &share)?;
            }
        }
        let new_entries = entries::layer_entries_dir(&self.host.layer_dir(new_ref));
        entries::link_entries(&new_entries, &share)
    }

    /// After a version was removed from the catalog, drop its entry links
    /// and re-point the tree at the newest remaining version.
    #[context("Removing entries for {removed_ref}")]
    fn del_app_entries(&self, removed_ref: &Ref) -> Result<()> {
        let share = self.host.entries_share_dir();
        let remaining =
            self.catalog
                .latest_installed(&removed_ref.id, None, Some(removed_ref.arch.as_str()))?;
        if let Some(remaining) = &remaining {
            if let (Some(remaining_version), Some(removed_version)) =
                (remaining.parsed_version(), removed_ref.version.clone())
            {
                if remaining_version > removed_version {
                    // The removed version never owned the links.
                    return Ok(());
                }
            }
        }
        let removed_entries = entries::layer_entries_dir(&self.host.layer_dir(removed_ref));
        entries::unlink_entries(&removed_entries, &share)?;
        if let Some(remaining) = remaining {
            if let Some(version) = remaining.parsed_version() {
                let remaining_ref = removed_ref.with_version(version);
                let remaining_entries =
                    entries::layer_entries_dir(&self.host.layer_dir(&remaining_ref));
                entries::link_entries(&remaining_entries, &share)?;
            }
        }
        Ok(())
    }

    fn uninstall_impl(&self, params: &UninstallParams) -> Reply {
        let app_id = params.app_id.trim().to_string();
        let version = params.version.trim().to_string();
        let arch_param = params.arch.trim().to_lowercase();

        if !version.is_empty() && params.delete_all_versions {
            let message =
                format!("uninstall {app_id}/{version} is in conflict with all-version param");
            tracing::error!("{message}");
            return Reply::new(StatusCode::UserInputParamErr, message);
        }

        let arch = if arch_param.is_empty() {
            self.host.arch
        } else {
            match arch_param.parse::<Arch>() {
                Ok(arch) => arch,
                Err(_) => {
                    return Reply::new(
                        StatusCode::UserInputParamErr,
                        format!("app arch:{arch_param} not support in host"),
                    );
                }
            }
        };
        let channel = default_if_empty(params.channel.trim(), DEFAULT_CHANNEL);
        let module = default_if_empty(params.module.trim(), Module::Runtime.as_str());

        let installed = self.catalog.is_installed(CatalogFilter {
            id: Some(&app_id),
            version: (!version.is_empty()).then_some(version.as_str()),
            arch: Some(arch.as_str()),
            channel: Some(&channel),
            module: Some(&module),
            ..Default::default()
        });
        if !installed.unwrap_or(false) {
            return Reply::new(
                StatusCode::PkgNotInstalled,
                format!(
                    "{app_id}, version:{version}, arch:{arch}, channel:{channel}, module:{module} not installed"
                ),
            );
        }

        let rows = if params.delete_all_versions {
            self.catalog.list(CatalogFilter {
                id: Some(&app_id),
                arch: Some(arch.as_str()),
                channel: Some(&channel),
                module: Some(&module),
                ..Default::default()
            })
        } else {
            self.catalog.list(CatalogFilter {
                id: Some(&app_id),
                version: (!version.is_empty()).then_some(version.as_str()),
                arch: Some(arch.as_str()),
                channel: Some(&channel),
                module: Some(&module),
                ..Default::default()
            })
        };
        let rows = match rows {
            Ok(rows) if !rows.is_empty() => rows,
            _ => {
                return Reply::new(
                    StatusCode::PkgUninstallFailed,
                    format!("query local app:{app_id} info err"),
                );
            }
        };

        let mut removed_versions = Vec::new();
        for row in &rows {
            match self.uninstall_one(row, params, arch, &channel, &module) {
                Ok(()) => removed_versions.push(row.version.clone()),
                Err(e) => {
                    tracing::error!("uninstall of {}/{} failed: {e:#}", row.app_id, row.version);
                    return Reply::new(StatusCode::PkgUninstallFailed, format!("{e:#}"));
                }
            }
        }

        let message = if removed_versions.len() > 1 {
            format!("uninstall {app_id} {} success", removed_versions.join(","))
        } else {
            format!(
                "uninstall {app_id}, version:{} success",
                removed_versions.first().cloned().unwrap_or_default()
            )
        };
        Reply::new(StatusCode::PkgUninstallSuccess, message)
    }

    fn uninstall_one(
        &self,
        row: &PackageMeta,
        params: &UninstallParams,
        arch: Arch,
        channel: &str,
        module: &str,
    ) -> Result<()> {
        // Unprivileged callers may only remove their own installs.
        if !self.privileged() && !row.user.is_empty() && row.user != self.host.username {
            bail!("{} uninstall permission deny", row.app_id);
        }

        let version: Version = row
            .version
            .parse()
            .map_err(|_| anyhow!("catalog row for {} has invalid version", row.app_id))?;
        let removed_ref = Ref::new(
            channel,
            row.app_id.clone(),
            Some(version),
            arch,
            module.parse().unwrap_or_default(),
        );

        let config = self.config.lock().unwrap().clone();
        self.repo
            .ensure(&config.repo_name, &config.remote_repo_url())
            .context("uninstall local repo not exist")?;

        // Pre-uninstall portal hook; failure is logged, not fatal.
        let mut options = BTreeMap::new();
        if params.delete_app_data {
            options.insert(
                KEY_DELETE_DATA.to_string(),
                self.host.user_app_dir(&row.app_id).to_string(),
            );
        }
        let package_root = self.host.layer_dir(&removed_ref);
        if let Err(e) =
            self.helper
                .ruin_install_portal(&package_root, &removed_ref.to_string(), &options)
        {
            tracing::warn!("process pre uninstall portal failed: {e:#}");
        }

        self.repo
            .delete_ref(&removed_ref.to_string())
            .with_context(|| format!("uninstall {}, version:{} failed", row.app_id, row.version))?;

        let user = if self.privileged() {
            None
        } else {
            Some(self.host.username.as_str())
        };
        self.catalog.remove(CatalogFilter {
            id: Some(&row.app_id),
            version: Some(&row.version),
            arch: Some(arch.as_str()),
            channel: Some(channel),
            module: Some(module),
            user,
        })?;

        self.del_app_entries(&removed_ref)?;
        entries::refresh_host_caches(&self.host.entries_share_dir());
        self.remove_layer_dirs(&removed_ref, channel)?;
        Ok(())
    }

    /// Drop the checked out layer, keeping a devel module's files when only
    /// the runtime module is removed and vice versa.
    #[context("Removing layer directories of {removed_ref}")]
    fn remove_layer_dirs(&self, removed_ref: &Ref, channel: &str) -> Result<()> {
        let version_dir = self
            .host
            .layers_dir()
            .join(&removed_ref.id)
            .join(removed_ref.version_str());
        let arch_dir = version_dir.join(removed_ref.arch.as_str());
        if removed_ref.module == Module::Devel {
            remove_dir_if_present(&arch_dir.join("devel"))?;
        } else {
            let devel_remains = self.catalog.is_installed(CatalogFilter {
                id: Some(&removed_ref.id),
                version: Some(&removed_ref.version_str()),
                arch: Some(removed_ref.arch.as_str()),
                channel: Some(channel),
                module: Some(Module::Devel.as_str()),
                ..Default::default()
            })?;
            if devel_remains && arch_dir.is_dir() {
                let dir = Dir::open_ambient_dir(arch_dir.as_std_path(), cap_std::ambient_authority())
                    .with_context(|| format!("Opening {arch_dir}"))?;
                for entry in dir.entries()? {
                    let entry = entry?;
                    let name = entry.file_name();
                    if name != *"devel" {
                        dir.remove_all_optional(&name)?;
                    }
                }
            } else {
                remove_dir_if_present(&version_dir)?;
            }
        }
        remove_dir_if_empty(&arch_dir)?;
        remove_dir_if_empty(&version_dir)?;
        remove_dir_if_empty(&self.host.layers_dir().join(&removed_ref.id))?;
        Ok(())
    }

    fn update_impl(&self, params: &UpdateParams) -> Reply {
        let app_id = params.app_id.trim().to_string();
        let version = params.version.trim().to_string();
        let arch = self.host.arch;
        let channel = default_if_empty(params.channel.trim(), DEFAULT_CHANNEL);
        let module = default_if_empty(params.module.trim(), Module::Runtime.as_str());
        let key = self.state_key(&app_id, &version, arch.as_str());
        self.state.lock().unwrap().remove(&key);

        let installed = self.catalog.is_installed(CatalogFilter {
            id: Some(&app_id),
            version: (!version.is_empty()).then_some(version.as_str()),
            arch: Some(arch.as_str()),
            channel: Some(&channel),
            module: Some(&module),
            ..Default::default()
        });
        if !installed.unwrap_or(false) {
            return self.finish(
                &key,
                StatusCode::PkgNotInstalled,
                format!(
                    "{app_id}, version:{version}, arch:{arch}, channel:{channel}, module:{module} not installed"
                ),
            );
        }

        let current = match self.catalog.latest_installed(
            &app_id,
            (!version.is_empty()).then_some(version.as_str()),
            Some(arch.as_str()),
        ) {
            Ok(Some(current)) => current,
            _ => {
                return self.finish(
                    &key,
                    StatusCode::ErrorPkgUpdateFailed,
                    format!("query local app:{app_id} info err"),
                );
            }
        };

        let metas = match self.query_server(&app_id, "", arch) {
            Ok(metas) if !metas.is_empty() => metas,
            _ => {
                return self.finish(
                    &key,
                    StatusCode::ErrorPkgUpdateFailed,
                    format!("query server app:{app_id} info err"),
                );
            }
        };
        let Some(server) = latest_app(&app_id, &metas) else {
            return self.finish(
                &key,
                StatusCode::ErrorPkgUpdateFailed,
                format!("load app:{app_id} info err"),
            );
        };

        if compare_versions(&current.version, &server.version) != std::cmp::Ordering::Less {
            return self.finish(
                &key,
                StatusCode::ErrorPkgUpdateSuccess,
                format!(
                    "app:{app_id}, latest version:{} already installed",
                    current.version
                ),
            );
        }

        let install = InstallParams {
            app_id: app_id.clone(),
            version: server.version.clone(),
            arch: arch.as_str().to_string(),
            channel: channel.clone(),
            module: module.clone(),
            repo_point: String::new(),
        };
        let reply = self.install_impl(&install);
        if !reply.is(StatusCode::PkgInstallSuccess) {
            return self.finish(
                &key,
                StatusCode::ErrorPkgUpdateFailed,
                format!("download app:{app_id}, version:{} err", server.version),
            );
        }

        let uninstall = UninstallParams {
            app_id: app_id.clone(),
            version: current.version.clone(),
            channel: channel.clone(),
            module: module.clone(),
            ..Default::default()
        };
        let reply = self.uninstall_impl(&uninstall);
        if !reply.is(StatusCode::PkgUninstallSuccess) {
            // The new version is installed and stays; the old one could not
            // be removed.
            return self.finish(
                &key,
                StatusCode::ErrorPkgUpdateFailed,
                format!(
                    "update partial: {app_id} versions {} and {} both present, uninstall old err",
                    current.version, server.version
                ),
            );
        }

        self.finish(
            &key,
            StatusCode::ErrorPkgUpdateSuccess,
            format!(
                "update {app_id} success, version:{} --> {}",
                current.version, server.version
            ),
        )
    }

    fn download_status_impl(&self, params: &InstallParams, kind: u32) -> Reply {
        let app_id = params.app_id.trim().to_string();
        let version = params.version.trim().to_string();
        let arch = self.host.arch;
        let channel = default_if_empty(params.channel.trim(), DEFAULT_CHANNEL);
        let module = default_if_empty(params.module.trim(), Module::Runtime.as_str());
        let key = self.state_key(&app_id, &version, arch.as_str());
        let updating = kind > 0;

        let mut progress_version = version.clone();
        if version.is_empty() || updating {
            if updating {
                let installed = self.catalog.is_installed(CatalogFilter {
                    id: Some(&app_id),
                    arch: Some(arch.as_str()),
                    channel: Some(&channel),
                    module: Some(&module),
                    ..Default::default()
                });
                if !installed.unwrap_or(false) {
                    return self.finish(
                        &key,
                        StatusCode::PkgNotInstalled,
                        format!(
                            "{app_id}, version:{version}, arch:{arch}, channel:{channel}, module:{module} not installed"
                        ),
                    );
                }
            }
            match self
                .query_server(&app_id, "", arch)
                .ok()
                .and_then(|metas| latest_app(&app_id, &metas).cloned())
            {
                Some(latest) => progress_version = latest.version,
                None => {
                    return Reply::new(
                        StatusCode::PkgInstallFailed,
                        format!("app:{app_id}, version:{version} not found in repo"),
                    );
                }
            }
        }

        let terminal = if updating {
            StatusCode::ErrorPkgUpdateSuccess
        } else {
            StatusCode::PkgInstallSuccess
        };
        if let Some(stored) = self.state.lock().unwrap().get(&key) {
            if stored.is(terminal) {
                return stored.clone();
            }
        }

        let progress_ref = Ref::new(
            channel.clone(),
            app_id.clone(),
            progress_version.parse().ok(),
            arch,
            module.parse().unwrap_or_default(),
        );
        let progress = read_progress_message(&progress_ref.progress_file_name());

        if let Some(mut stored) = self.state.lock().unwrap().get(&key).cloned() {
            // Mid-update the install leg finishing still reads as updating
            // until the old version is gone.
            if updating && stored.is(StatusCode::PkgInstallSuccess) {
                stored.code = StatusCode::PkgUpdating.code();
            }
            return stored;
        }

        let message = progress.unwrap_or_else(|| {
            if updating {
                format!("{app_id} is updating...")
            } else {
                format!("{app_id} is installing...")
            }
        });
        let code = if updating {
            StatusCode::PkgUpdating
        } else {
            StatusCode::PkgInstalling
        };
        Reply::new(code, message)
    }

    fn query_impl(&self, params: &QueryParams) -> QueryReply {
        let app_id = params.app_id.trim().to_string();
        if app_id == "installed" {
            let rows = match self.catalog.list(CatalogFilter::default()) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!("listing catalog failed: {e:#}");
                    return QueryReply::new(StatusCode::ErrorPkgQueryFailed, format!("{e:#}"), "");
                }
            };
            let result = serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string());
            return QueryReply::new(
                StatusCode::ErrorPkgQuerySuccess,
                format!("query {app_id} success"),
                result,
            );
        }

        let metas = self
            .client
            .lock()
            .unwrap()
            .query_cached(&app_id, self.host.arch, params.force);
        match metas {
            Ok(metas) => {
                let result = serde_json::to_string(&metas).unwrap_or_else(|_| "[]".to_string());
                QueryReply::new(
                    StatusCode::ErrorPkgQuerySuccess,
                    format!("query {app_id} success"),
                    result,
                )
            }
            Err(e) => {
                tracing::error!("query {app_id} failed: {e:#}");
                QueryReply::new(StatusCode::ErrorPkgQueryFailed, format!("{e:#}"), "")
            }
        }
    }

    fn modify_repo_impl(&self, name: &str, url: &str) -> Reply {
        let name = name.trim();
        if name.is_empty() || !has_http_scheme(url) {
            return Reply::new(StatusCode::UserInputParamErr, "url format error");
        }
        let mut config = self.config.lock().unwrap();
        if let Err(e) = self
            .repo
            .ensure(&config.repo_name, &config.remote_repo_url())
        {
            tracing::error!("preparing repo failed: {e:#}");
            return Reply::new(StatusCode::Fail, format!("{e:#}"));
        }

        // There is no rename; the remote under the previously used name is
        // dropped and the new one written with verification off.
        if let Err(e) = self.repo.delete_remote(&config.repo_name) {
            tracing::warn!("deleting remote {} failed: {e:#}", config.repo_name);
        }
        let new_config = RepoConfig {
            repo_name: name.to_string(),
            app_db_url: url.to_string(),
        };
        if let Err(e) = self.repo.add_remote(name, &new_config.remote_repo_url()) {
            tracing::error!("modify repo config failed: {e:#}");
            return Reply::new(StatusCode::ErrorModifyRepoFailed, "modify repo config failed");
        }
        if let Err(e) = new_config.save(&self.host.repo_config_path()) {
            return Reply::new(StatusCode::ErrorModifyRepoFailed, format!("{e:#}"));
        }
        match MetaCache::open(&self.host.cache_dir)
            .and_then(|cache| RepoClient::new(&new_config.app_db_url, cache))
        {
            Ok(client) => *self.client.lock().unwrap() = client,
            Err(e) => {
                return Reply::new(StatusCode::ErrorModifyRepoFailed, format!("{e:#}"));
            }
        }
        *config = new_config;
        Reply::new(StatusCode::ErrorModifyRepoSuccess, "modify repo url success")
    }
}

fn default_if_empty(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn has_http_scheme(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    let scheme = scheme.to_ascii_lowercase();
    (scheme == "http" || scheme == "https") && !rest.is_empty()
}

/// The greatest-versioned descriptor whose id matches exactly.
fn latest_app<'a>(id: &str, metas: &'a [PackageMeta]) -> Option<&'a PackageMeta> {
    latest_matching(id, "", metas)
}

/// The greatest-versioned descriptor matching id and a dotted version
/// prefix.
fn latest_matching<'a>(id: &str, prefix: &str, metas: &'a [PackageMeta]) -> Option<&'a PackageMeta> {
    let mut best: Option<(&'a PackageMeta, Version)> = None;
    for meta in metas {
        if meta.app_id != id {
            continue;
        }
        let Some(version) = meta.parsed_version() else {
            continue;
        };
        if !version.has_prefix(prefix) {
            continue;
        }
        match &best {
            Some((_, current)) if version < *current => {}
            _ => best = Some((meta, version)),
        }
    }
    best.map(|(meta, _)| meta)
}

/// Split an `id/version/arch` dependency reference as found in descriptor
/// `runtime` fields.
fn split_dependency_ref(raw: &str) -> Result<(String, Version, Arch)> {
    let segments: Vec<&str> = raw.split('/').collect();
    if segments.len() < 3 || segments[0].is_empty() {
        bail!("app runtime:{raw} runtime format err");
    }
    let version: Version = segments[1]
        .parse()
        .map_err(|_| anyhow!("app runtime:{raw} runtime version format err"))?;
    let arch: Arch = segments[2].parse()?;
    Ok((segments[0].to_string(), version, arch))
}

fn remove_dir_if_present(dir: &camino::Utf8Path) -> Result<()> {
    if dir.is_dir() {
        std::fs::remove_dir_all(dir).with_context(|| format!("Removing {dir}"))?;
    }
    Ok(())
}

fn remove_dir_if_empty(dir: &camino::Utf8Path) -> Result<()> {
    let Ok(mut entries) = dir.read_dir_utf8() else {
        return Ok(());
    };
    if entries.next().is_none() {
        std::fs::remove_dir(dir).with_context(|| format!("Removing {dir}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::TestHost;
    use crate::service::NullSystemHelper;

    fn manager(host: &TestHost) -> PackageManager {
        PackageManager::new(host.env.clone(), Box::<NullSystemHelper>::default()).unwrap()
    }

    #[test]
    fn test_uninstall_all_versions_flag_conflict() {
        let host = TestHost::new();
        let pm = manager(&host);
        let reply = pm.uninstall(&UninstallParams {
            app_id: "x".into(),
            version: "1.0".into(),
            delete_all_versions: true,
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::UserInputParamErr.code());
        assert!(reply.message.contains("conflict with all-version"), "{}", reply.message);
    }

    #[test]
    fn test_uninstall_not_installed() {
        let host = TestHost::new();
        let pm = manager(&host);
        let reply = pm.uninstall(&UninstallParams {
            app_id: "org.example.absent".into(),
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::PkgNotInstalled.code());
        assert!(reply.message.contains("not installed"));
    }

    #[test]
    fn test_install_rejects_foreign_arch() {
        let host = TestHost::new();
        let pm = manager(&host);
        let reply = pm.install_blocking(&InstallParams {
            app_id: "org.example.app".into(),
            arch: "arm64".into(),
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::UserInputParamErr.code());
        assert!(reply.message.contains("not support in host"));
        let reply = pm.install_blocking(&InstallParams {
            app_id: "org.example.app".into(),
            arch: "sparc".into(),
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::UserInputParamErr.code());
    }

    #[test]
    fn test_install_rejects_empty_id() {
        let host = TestHost::new();
        let pm = manager(&host);
        let reply = pm.install(&InstallParams::default());
        assert_eq!(reply.code, StatusCode::UserInputParamErr.code());
    }

    #[test]
    fn test_modify_repo_rejects_bad_urls() {
        let host = TestHost::new();
        let pm = manager(&host);
        for url in ["ftp://example.org/", "example.org", "https://"] {
            let reply = pm.modify_repo("repo", url);
            assert_eq!(reply.code, StatusCode::UserInputParamErr.code(), "{url}");
            assert_eq!(reply.message, "url format error");
        }
        let reply = pm.modify_repo(" ", "https://example.org/");
        assert_eq!(reply.code, StatusCode::UserInputParamErr.code());
    }

    #[test]
    fn test_query_installed_lists_catalog() {
        let host = TestHost::new();
        let pm = manager(&host);
        let meta = PackageMeta {
            app_id: "org.deepin.calculator".into(),
            version: "5.7.16".into(),
            arch: "x86_64".into(),
            kind: "app".into(),
            channel: "linglong".into(),
            module: "runtime".into(),
            ..Default::default()
        };
        pm.catalog().insert(&meta, "tester").unwrap();
        let reply = pm.query(&QueryParams {
            app_id: "installed".into(),
            ..Default::default()
        });
        assert_eq!(reply.code, StatusCode::ErrorPkgQuerySuccess.code());
        let rows: Vec<PackageMeta> = serde_json::from_str(&reply.result).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].app_id, "org.deepin.calculator");
    }

    #[test]
    fn test_latest_matching() {
        let metas: Vec<PackageMeta> = ["5.9.1", "5.10.1", "4.0.0"]
            .iter()
            .map(|v| PackageMeta {
                app_id: "x".into(),
                version: v.to_string(),
                ..Default::default()
            })
            .collect();
        assert_eq!(latest_app("x", &metas).unwrap().version, "5.10.1");
        assert_eq!(latest_matching("x", "5.9", &metas).unwrap().version, "5.9.1");
        assert!(latest_app("y", &metas).is_none());
    }

    #[test]
    fn test_split_dependency_ref() {
        let (id, version, arch) = split_dependency_ref("org.deepin.Runtime/20.5.0/x86_64").unwrap();
        assert_eq!(id, "org.deepin.Runtime");
        assert_eq!(version.to_string(), "20.5.0");
        assert_eq!(arch, Arch::X86_64);
        assert!(split_dependency_ref("org.deepin.Runtime/20.5.0").is_err());
        assert!(split_dependency_ref("/1.0/x86_64").is_err());
    }

    fn meta_for(id: &str, version: &str) -> PackageMeta {
        PackageMeta {
            app_id: id.into(),
            version: version.into(),
            arch: "x86_64".into(),
            kind: "app".into(),
            channel: "linglong".into(),
            module: "runtime".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_links_follow_install_order() {
        let host = TestHost::new();
        let pm = manager(&host);
        let v1 = host.install_fake_app("org.deepin.calculator", "1.0.0", &[]);
        let v2 = host.install_fake_app("org.deepin.calculator", "2.0.0", &[]);
        let link = host
            .env
            .entries_share_dir()
            .join("applications/org.deepin.calculator.desktop");

        // First install: nothing recorded yet, v1's entries get linked.
        pm.inner.add_app_entries(&v1.app_ref).unwrap();
        pm.catalog()
            .insert(&meta_for("org.deepin.calculator", "1.0.0"), "tester")
            .unwrap();
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.to_str().unwrap().contains("/1.0.0/"));

        // Upgrading relinks to the numerically greater version.
        pm.inner.add_app_entries(&v2.app_ref).unwrap();
        pm.catalog()
            .insert(&meta_for("org.deepin.calculator", "2.0.0"), "tester")
            .unwrap();
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.to_str().unwrap().contains("/2.0.0/"));

        // Re-adding the older version must not steal the links back.
        pm.inner.add_app_entries(&v1.app_ref).unwrap();
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.to_str().unwrap().contains("/2.0.0/"));
    }

    #[test]
    fn test_entry_links_after_uninstall() {
        let host = TestHost::new();
        let pm = manager(&host);
        let v1 = host.install_fake_app("org.deepin.calculator", "1.0.0", &[]);
        let v2 = host.install_fake_app("org.deepin.calculator", "2.0.0", &[]);
        let link = host
            .env
            .entries_share_dir()
            .join("applications/org.deepin.calculator.desktop");

        pm.catalog()
            .insert(&meta_for("org.deepin.calculator", "1.0.0"), "tester")
            .unwrap();
        pm.inner.add_app_entries(&v2.app_ref).unwrap();
        pm.catalog()
            .insert(&meta_for("org.deepin.calculator", "2.0.0"), "tester")
            .unwrap();

        // Removing the active version re-points the tree at the remaining
        // one.
        pm.catalog()
            .remove(CatalogFilter {
                id: Some("org.deepin.calculator"),
                version: Some("2.0.0"),
                ..Default::default()
            })
            .unwrap();
        pm.inner.del_app_entries(&v2.app_ref).unwrap();
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.to_str().unwrap().contains("/1.0.0/"));

        // Removing the last version leaves no dangling links behind.
        pm.catalog()
            .remove(CatalogFilter {
                id: Some("org.deepin.calculator"),
                ..Default::default()
            })
            .unwrap();
        pm.inner.del_app_entries(&v1.app_ref).unwrap();
        assert!(link.symlink_metadata().is_err());
    }

    #[test]
    fn test_remove_layer_dirs_keeps_devel() {
        let host = TestHost::new();
        let pm = manager(&host);
        let runtime_ref: Ref = "org.x/1.0.0/x86_64".parse().unwrap();
        let devel_ref: Ref = "org.x/1.0.0/x86_64/devel".parse().unwrap();
        let arch_dir = host.env.layers_dir().join("org.x/1.0.0/x86_64");
        std::fs::create_dir_all(arch_dir.join("files")).unwrap();
        std::fs::create_dir_all(arch_dir.join("devel/files/debug")).unwrap();
        let mut devel_row = meta_for("org.x", "1.0.0");
        devel_row.module = "devel".into();
        pm.catalog().insert(&devel_row, "tester").unwrap();

        // Removing the runtime module leaves the devel data in place.
        pm.inner.remove_layer_dirs(&runtime_ref, "linglong").unwrap();
        assert!(!arch_dir.join("files").exists());
        assert!(arch_dir.join("devel/files/debug").is_dir());

        // Removing the devel module afterwards prunes everything.
        pm.catalog()
            .remove(CatalogFilter::for_id("org.x"))
            .unwrap();
        pm.inner.remove_layer_dirs(&devel_ref, "linglong").unwrap();
        assert!(!host.env.layers_dir().join("org.x").exists());
    }

    #[test]
    fn test_download_status_reports_state() {
        let host = TestHost::new();
        let pm = manager(&host);
        let key = pm.inner.state_key("org.x", "1.0", "x86_64");
        pm.inner.finish(
            &key,
            StatusCode::PkgInstallSuccess,
            "install org.x, version:1.0 success",
        );
        let reply = pm.get_download_status(
            &InstallParams {
                app_id: "org.x".into(),
                version: "1.0".into(),
                ..Default::default()
            },
            0,
        );
        assert_eq!(reply.code, StatusCode::PkgInstallSuccess.code());
    }
}

//! The privileged system helper, an external collaborator performing
//! post-install and pre-uninstall portal hooks.
//!
//! The transport to the real helper daemon lives outside this crate; the
//! installer only needs the two hook calls, and treats their failure as a
//! warning, never as an install failure.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::Utf8Path;

/// Peer-to-peer socket the helper listens on when the bus is bypassed.
pub const SYSTEM_HELPER_SOCKET: &str = "unix:path=/run/linglong_system_helper_socket";

/// Extra-options key carrying the user data path to purge on uninstall.
pub const KEY_DELETE_DATA: &str = "delData";

pub trait SystemHelper: Send + Sync {
    /// Invoked after a layer is placed and recorded.
    fn rebuild_install_portal(
        &self,
        install_path: &Utf8Path,
        ref_str: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Invoked before a layer is torn down.
    fn ruin_install_portal(
        &self,
        package_root: &Utf8Path,
        ref_str: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Stand-in used when no helper connection is configured; hooks become
/// no-ops and installs proceed.
#[derive(Debug, Default)]
pub struct NullSystemHelper;

impl SystemHelper for NullSystemHelper {
    fn rebuild_install_portal(
        &self,
        install_path: &Utf8Path,
        ref_str: &str,
        _options: &BTreeMap<String, String>,
    ) -> Result<()> {
        tracing::debug!("no system helper; skipping install portal for {ref_str} at {install_path}");
        Ok(())
    }

    fn ruin_install_portal(
        &self,
        package_root: &Utf8Path,
        ref_str: &str,
        _options: &BTreeMap<String, String>,
    ) -> Result<()> {
        tracing::debug!("no system helper; skipping uninstall portal for {ref_str} at {package_root}");
        Ok(())
    }
}

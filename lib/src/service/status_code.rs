//! The numeric reply taxonomy shared by the services, the CLI JSON output,
//! and status polling.

use serde::{Deserialize, Serialize};

/// Every reply carries one of these codes. The numeric values are wire
/// stable; new codes append.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success = 0,
    Fail = 1,
    UserInputParamErr = 600,
    PkgAlreadyInstalled = 601,
    PkgNotInstalled = 602,
    InstallRuntimeFailed = 603,
    InstallBaseFailed = 604,
    LoadPkgDataFailed = 605,
    PkgInstallSuccess = 606,
    PkgInstalling = 607,
    PkgInstallFailed = 608,
    PkgUninstallSuccess = 609,
    PkgUninstalling = 610,
    PkgUninstallFailed = 611,
    ErrorPkgUpdateFailed = 612,
    ErrorPkgUpdateSuccess = 613,
    PkgUpdating = 614,
    ErrorPkgKillFailed = 615,
    ErrorPkgKillSuccess = 616,
    ErrorPkgQuerySuccess = 617,
    ErrorPkgQueryFailed = 618,
    ErrorModifyRepoSuccess = 619,
    ErrorModifyRepoFailed = 620,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether a CLI should exit zero for this code.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StatusCode::Success
                | StatusCode::PkgInstallSuccess
                | StatusCode::PkgInstalling
                | StatusCode::PkgUninstallSuccess
                | StatusCode::PkgUninstalling
                | StatusCode::ErrorPkgUpdateSuccess
                | StatusCode::PkgUpdating
                | StatusCode::ErrorPkgKillSuccess
                | StatusCode::ErrorPkgQuerySuccess
                | StatusCode::ErrorModifyRepoSuccess
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(StatusCode::Success.code(), 0);
        assert_eq!(StatusCode::Fail.code(), 1);
        assert_eq!(StatusCode::UserInputParamErr.code(), 600);
        assert_eq!(StatusCode::PkgInstallSuccess.code(), 606);
        assert_eq!(StatusCode::ErrorModifyRepoFailed.code(), 620);
    }

    #[test]
    fn test_success_classification() {
        assert!(StatusCode::PkgInstallSuccess.is_success());
        assert!(!StatusCode::PkgInstallFailed.is_success());
        assert!(!StatusCode::UserInputParamErr.is_success());
    }
}

//! Container instance records.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::host::HostEnv;
use crate::package::Ref;

/// One live (or about to be live) container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Opaque 128-bit identifier, generated at launch.
    pub id: String,
    /// Pid of the external executor; 0 until spawned.
    pub pid: i64,
    /// Canonical reference string of the running app.
    pub package_name: String,
    /// Per-instance scratch directory under the user's runtime dir.
    pub working_directory: Utf8PathBuf,
}

impl Container {
    /// Allocate an id and create the working directory.
    pub fn create(env: &HostEnv, package: &Ref) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let working_directory = env.container_work_dir(&id);
        std::fs::create_dir_all(&working_directory)
            .with_context(|| format!("Creating {working_directory}"))?;
        Ok(Self {
            id,
            pid: 0,
            package_name: package.to_string(),
            working_directory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn test_create_allocates_unique_workdirs() {
        let dir = tempfile::tempdir().unwrap();
        let env = crate::fixture::test_host_env(
            Utf8Path::from_path(dir.path()).unwrap(),
        );
        let r: Ref = "org.deepin.calculator/1.0/x86_64".parse().unwrap();
        let a = Container::create(&env, &r).unwrap();
        let b = Container::create(&env, &r).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
        assert!(a.working_directory.is_dir());
        assert_eq!(a.package_name, r.to_string());
    }
}

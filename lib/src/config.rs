//! The daemon-scoped repository configuration, `<root>/config.json`.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// The remote name used when no configuration exists yet.
pub const DEFAULT_REPO_NAME: &str = "repo";
/// The metadata index endpoint used when no configuration exists yet.
pub const DEFAULT_APP_DB_URL: &str = "https://linglong-api-dev.deepin.com/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub repo_name: String,
    pub app_db_url: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            repo_name: DEFAULT_REPO_NAME.to_string(),
            app_db_url: DEFAULT_APP_DB_URL.to_string(),
        }
    }
}

impl RepoConfig {
    /// Load the configuration, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: &Utf8Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("ignoring malformed {path}: {e}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically via a rename.
    #[context("Persisting repo config to {path}")]
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let parent = path.parent().context("config path has no parent")?;
        std::fs::create_dir_all(parent)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// The OSTree remote URL derived from the index endpoint:
    /// `<appDbUrl>/repos/<repoName>`.
    pub fn remote_repo_url(&self) -> String {
        format!(
            "{}/repos/{}",
            self.app_db_url.trim_end_matches('/'),
            self.repo_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn test_defaults_on_missing() {
        let cfg = RepoConfig::load(Utf8Path::new("/nonexistent/config.json"));
        assert_eq!(cfg.repo_name, "repo");
        assert_eq!(cfg.app_db_url, DEFAULT_APP_DB_URL);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(dir.path().join("config.json")).unwrap();
        let cfg = RepoConfig {
            repo_name: "repo".into(),
            app_db_url: "https://example.org/".into(),
        };
        cfg.save(&path).unwrap();
        assert_eq!(RepoConfig::load(&path), cfg);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"repoName\""), "{raw}");
        assert!(raw.contains("\"appDbUrl\""), "{raw}");
    }

    #[test]
    fn test_remote_repo_url() {
        let cfg = RepoConfig {
            repo_name: "repo".into(),
            app_db_url: "https://example.org/".into(),
        };
        assert_eq!(cfg.remote_repo_url(), "https://example.org/repos/repo");
    }
}

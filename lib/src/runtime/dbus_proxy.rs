//! Session bus proxy filter configuration.

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Filter rules for the bus proxy: well-known names, object paths, and
/// interfaces the sandboxed app may talk to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbusFilter {
    pub name: Vec<String>,
    pub path: Vec<String>,
    pub interface: Vec<String>,
}

/// Load a proxy filter file. A missing or unreadable file is an error: a
/// caller asking for filtering must not silently run unfiltered.
#[context("Loading dbus proxy filter {path}")]
pub fn load_filter(path: &Utf8Path) -> Result<DbusFilter> {
    let data = std::fs::read_to_string(path).context("malformed dbus proxy config")?;
    serde_yaml::from_str(&data)
        .map_err(|e| anyhow!("malformed dbus proxy config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn test_load_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filter.yaml")).unwrap();
        std::fs::write(
            &path,
            "name:\n  - org.freedesktop.Notifications\npath:\n  - /org/freedesktop/Notifications\n",
        )
        .unwrap();
        let filter = load_filter(&path).unwrap();
        assert_eq!(filter.name, vec!["org.freedesktop.Notifications"]);
        assert!(filter.interface.is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_filter(Utf8Path::new("/no/such/filter.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("malformed dbus proxy config"));
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filter.yaml")).unwrap();
        std::fs::write(&path, "{not yaml").unwrap();
        assert!(load_filter(&path).is_err());
    }
}

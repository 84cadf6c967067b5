//! XDG user directories and desktop entry handling.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tini::Ini;

use crate::host::HostEnv;

/// The recognized user directory keys of a `filesystem.user` permission
/// declaration. Matching is exact; unknown keys are ignored by the
/// composer.
pub const USER_DIR_KEYS: &[&str] = &[
    "Desktop",
    "Documents",
    "Downloads",
    "Music",
    "Pictures",
    "Videos",
    "Templates",
    "PublicShare",
    "Temp",
];

/// Resolve a recognized user directory key to a host path, consulting the
/// user's `user-dirs.dirs` and falling back to the conventional name under
/// the home directory.
pub fn user_dir(env: &HostEnv, key: &str) -> Option<Utf8PathBuf> {
    if key == "Temp" {
        return Some(Utf8PathBuf::from("/tmp"));
    }
    let config_key = match key {
        "Desktop" => "XDG_DESKTOP_DIR",
        "Documents" => "XDG_DOCUMENTS_DIR",
        "Downloads" => "XDG_DOWNLOAD_DIR",
        "Music" => "XDG_MUSIC_DIR",
        "Pictures" => "XDG_PICTURES_DIR",
        "Videos" => "XDG_VIDEOS_DIR",
        "Templates" => "XDG_TEMPLATES_DIR",
        "PublicShare" => "XDG_PUBLICSHARE_DIR",
        _ => return None,
    };
    let config = std::fs::read_to_string(env.home.join(".config/user-dirs.dirs")).ok();
    if let Some(found) = config.as_deref().and_then(|c| {
        lookup_user_dirs_config(c, config_key).map(|raw| substitute_home(&raw, &env.home))
    }) {
        return Some(found);
    }
    let fallback = match key {
        "PublicShare" => "Public",
        other => other,
    };
    Some(env.home.join(fallback))
}

fn lookup_user_dirs_config(content: &str, key: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        if k.trim() == key {
            return Some(v.trim().trim_matches('"').to_string());
        }
    }
    None
}

fn substitute_home(raw: &str, home: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(raw.replace("$HOME", home.as_str()))
}

/// Parse a desktop `Exec=` line into argv. Tokens following a `--exec`
/// switch replace everything before it, and unresolved field codes (`%u`,
/// `%F`, ...) are dropped.
pub fn parse_exec(exec: &str) -> Vec<String> {
    let Some(tokens) = shlex::split(exec) else {
        return Vec::new();
    };
    let tokens = match tokens.iter().position(|t| t == "--exec") {
        Some(i) => tokens[i + 1..].to_vec(),
        None => tokens,
    };
    let field_code = field_code_pattern();
    tokens
        .into_iter()
        .filter(|t| !field_code.is_match(t))
        .collect()
}

fn field_code_pattern() -> &'static regex::Regex {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^%\w$").expect("static pattern"))
}

/// The single desktop file under a layer's `entries/applications`.
pub fn find_desktop_file(applications_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let mut found = Vec::new();
    for entry in applications_dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {applications_dir}"))?
    {
        let entry = entry?;
        if entry.path().extension() == Some("desktop") {
            found.push(entry.path().to_path_buf());
        }
    }
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no desktop entry under {applications_dir}"))
}

/// Read the `Exec=` value of a desktop file.
pub fn desktop_exec(path: &Utf8Path) -> Result<String> {
    let ini = Ini::from_file(path.as_std_path())
        .map_err(|e| anyhow!("Parsing desktop entry {path}: {e}"))?;
    ini.get::<String>("Desktop Entry", "Exec")
        .ok_or_else(|| anyhow!("desktop entry {path} has no Exec"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec_strips_field_codes() {
        assert_eq!(
            parse_exec("deepin-calculator %u"),
            vec!["deepin-calculator".to_string()]
        );
        assert_eq!(
            parse_exec("app --flag %F other"),
            vec!["app".to_string(), "--flag".to_string(), "other".to_string()]
        );
        // %% is an escaped percent, not a field code.
        assert_eq!(parse_exec("app %%"), vec!["app".to_string(), "%%".to_string()]);
    }

    #[test]
    fn test_parse_exec_honors_exec_switch() {
        assert_eq!(
            parse_exec("ll-cli run org.deepin.calculator --exec deepin-calculator %u"),
            vec!["deepin-calculator".to_string()]
        );
    }

    #[test]
    fn test_parse_exec_quoting() {
        assert_eq!(
            parse_exec(r#"sh -c "echo hi""#),
            vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn test_lookup_user_dirs_config() {
        let content = "# comment\nXDG_DESKTOP_DIR=\"$HOME/Desktop\"\nXDG_DOWNLOAD_DIR=\"$HOME/dl\"\n";
        assert_eq!(
            lookup_user_dirs_config(content, "XDG_DOWNLOAD_DIR").unwrap(),
            "$HOME/dl"
        );
        assert_eq!(
            substitute_home("$HOME/dl", Utf8Path::new("/home/u")),
            Utf8PathBuf::from("/home/u/dl")
        );
        assert!(lookup_user_dirs_config(content, "XDG_MUSIC_DIR").is_none());
    }
}

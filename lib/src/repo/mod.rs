//! The content-addressed layer store, backed by an external `ostree` binary
//! operating on `<root>/repo`.
//!
//! Pulls go through a temporary child repository under `/tmp` and are then
//! `pull-local`ed into the main store; this keeps a failed download from
//! leaving partial objects behind the main store's refs. The child store is
//! removed on both outcomes.

mod client;

pub use client::{parse_query_envelope, RepoClient};

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tini::Ini;

use crate::package::{Arch, Version};
use crate::task::Task;

/// Directory holding the textual pull progress files polled by download
/// status queries.
const PROGRESS_DIR: &str = "/tmp/.linglong";

/// Timeout-free wrapper around the `ostree` binary rooted at one store.
#[derive(Debug, Clone)]
pub struct OstreeRepo {
    repo_path: Utf8PathBuf,
}

impl OstreeRepo {
    /// A store at `<root>/repo`; the directory need not exist yet.
    pub fn at_root(root: &Utf8Path) -> Self {
        Self {
            repo_path: root.join("repo"),
        }
    }

    fn repo_arg(&self) -> String {
        format!("--repo={}", self.repo_path)
    }

    fn config_path(&self) -> Utf8PathBuf {
        self.repo_path.join("config")
    }

    /// Initialize the store if absent, and make sure the configured remote
    /// exists.
    #[context("Ensuring ostree repo at {}", self.repo_path)]
    pub fn ensure(&self, remote_name: &str, remote_url: &str) -> Result<()> {
        if !self.config_path().exists() {
            std::fs::create_dir_all(&self.repo_path)
                .with_context(|| format!("Creating {}", self.repo_path))?;
            Task::new("Initializing layer store", "ostree")
                .args([
                    self.repo_arg().as_str(),
                    "init",
                    "--mode=bare-user-only",
                ])
                .capture_failure()
                .run()?;
        }
        if !self.list_remotes()?.iter().any(|r| r == remote_name) {
            self.add_remote(remote_name, remote_url)?;
        }
        Ok(())
    }

    /// Names of the configured remotes, read from the repo config.
    pub fn list_remotes(&self) -> Result<Vec<String>> {
        let ini = Ini::from_file(self.config_path().as_std_path())
            .map_err(|e| anyhow!("Parsing {}: {e}", self.config_path()))?;
        let mut remotes = Vec::new();
        for (section, _) in ini.iter() {
            if let Some(name) = section
                .strip_prefix("remote \"")
                .and_then(|s| s.strip_suffix('"'))
            {
                remotes.push(name.to_string());
            }
        }
        Ok(remotes)
    }

    /// The URL of one configured remote.
    pub fn remote_url(&self, name: &str) -> Result<Option<String>> {
        let ini = Ini::from_file(self.config_path().as_std_path())
            .map_err(|e| anyhow!("Parsing {}: {e}", self.config_path()))?;
        Ok(ini.get::<String>(&format!("remote \"{name}\""), "url"))
    }

    #[context("Adding remote {name}")]
    pub fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        Task::new(format!("Adding remote {name}"), "ostree")
            .args([
                self.repo_arg().as_str(),
                "remote",
                "add",
                "--no-gpg-verify",
                "--if-not-exists",
                name,
                url,
            ])
            .capture_failure()
            .run()
    }

    #[context("Deleting remote {name}")]
    pub fn delete_remote(&self, name: &str) -> Result<()> {
        Task::new(format!("Deleting remote {name}"), "ostree")
            .args([
                self.repo_arg().as_str(),
                "remote",
                "delete",
                "--if-exists",
                name,
            ])
            .capture_failure()
            .run()
    }

    /// Fetch the remote summary and return its ref map (`ref -> commit`).
    /// This performs network I/O.
    #[context("Listing refs of remote {remote}")]
    pub fn remote_refs(&self, remote: &str) -> Result<BTreeMap<String, String>> {
        let out = Task::new(format!("Listing refs of {remote}"), "ostree")
            .args([
                self.repo_arg().as_str(),
                "remote",
                "refs",
                "--revision",
                remote,
            ])
            .read()?;
        let mut refs = BTreeMap::new();
        for line in out.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, commit) = line
                .split_once('\t')
                .or_else(|| line.split_once(' '))
                .unwrap_or((line, ""));
            let name = name.strip_prefix(&format!("{remote}:")).unwrap_or(name);
            refs.insert(name.to_string(), commit.trim().to_string());
        }
        Ok(refs)
    }

    /// Find the ref for `(id, version, arch)` among the remote's refs. With
    /// no version requested, the numerically greatest one wins.
    #[context("Resolving {id} on remote {remote}")]
    pub fn match_ref(
        &self,
        remote: &str,
        id: &str,
        version: Option<&Version>,
        arch: Arch,
    ) -> Result<String> {
        let refs = self.remote_refs(remote)?;
        select_ref(refs.keys().map(|s| s.as_str()), id, version, arch)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("{id} not found in repo {remote}"))
    }

    /// Fetch `ref` from `remote`. Progress output is streamed into the
    /// well-known progress file for this ref so status queries can report
    /// it. Two stages: mirror into a temporary child store, then pull-local
    /// into the main store (which contends on the store lock only for the
    /// commit).
    #[context("Pulling {ref_name} from {remote}")]
    pub fn pull(&self, remote: &str, ref_name: &str, progress_name: &str) -> Result<()> {
        let tmp = tempfile::Builder::new()
            .prefix("linglong-cache-")
            .tempdir()
            .context("Creating temporary pull store")?;
        let child_repo = Utf8PathBuf::from_path_buf(tmp.path().join("repoTmp"))
            .map_err(|p| anyhow!("non UTF-8 temp path {p:?}"))?;
        std::fs::create_dir_all(&child_repo)?;
        let child_repo_arg = format!("--repo={child_repo}");
        let refspec = format!("{remote}:{ref_name}");
        Task::new("Initializing pull store", "ostree")
            .args([child_repo_arg.as_str(), "init", "--mode=bare-user-only"])
            .capture_failure()
            .run()?;
        Task::new(format!("Pulling {ref_name}"), "ostree")
            .args([child_repo_arg.as_str(), "pull", "--mirror", refspec.as_str()])
            .output_to(&progress_file_path(progress_name)?)?
            .run()?;
        Task::new(format!("Importing {ref_name}"), "ostree")
            .args([
                self.repo_arg().as_str(),
                "pull-local",
                child_repo.as_str(),
                ref_name,
            ])
            .capture_failure()
            .run()?;
        // tmp dropped here, removing the child store on success and failure
        // alike.
        Ok(())
    }

    /// Materialize `ref` into `destination` in user mode, resolving file
    /// collisions by union overwrite.
    #[context("Checking out {ref_name} to {destination}")]
    pub fn checkout(&self, ref_name: &str, destination: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(destination)
            .with_context(|| format!("Creating {destination}"))?;
        Task::new(format!("Checking out {ref_name}"), "ostree")
            .args([
                self.repo_arg().as_str(),
                "checkout",
                "-U",
                "--union",
                ref_name,
                destination.as_str(),
            ])
            .capture_failure()
            .run()
    }

    /// Clear `ref` and prune now-unreachable objects; disk is reclaimed
    /// before this returns.
    #[context("Deleting ref {ref_name}")]
    pub fn delete_ref(&self, ref_name: &str) -> Result<()> {
        Task::new(format!("Deleting ref {ref_name}"), "ostree")
            .args([self.repo_arg().as_str(), "refs", "--delete", ref_name])
            .capture_failure()
            .run()?;
        Task::new("Pruning unreachable objects", "ostree")
            .args([self.repo_arg().as_str(), "prune", "--refs-only"])
            .capture_failure()
            .run()
    }
}

/// The on-disk path of the progress file for a pull.
pub fn progress_file_path(progress_name: &str) -> Result<Utf8PathBuf> {
    std::fs::create_dir_all(PROGRESS_DIR)?;
    Ok(Utf8PathBuf::from(PROGRESS_DIR).join(progress_name))
}

/// Extract a human progress message from a pull progress file. The second
/// line carries the live ostree status; cursor-restore escapes separate the
/// refreshes, the last chunk is current.
pub fn read_progress_message(progress_name: &str) -> Option<String> {
    let path = Utf8PathBuf::from(PROGRESS_DIR).join(progress_name);
    let content = std::fs::read_to_string(path).ok()?;
    parse_progress(&content)
}

fn parse_progress(content: &str) -> Option<String> {
    let lines: Vec<&str> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let line = lines.get(1)?;
    let last = line.trim().split('\u{1b}').last()?;
    let last = last.strip_prefix('8').unwrap_or(last).trim();
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

/// Pure ref selection over a set of 5-segment ref names.
fn select_ref<'a>(
    refs: impl Iterator<Item = &'a str>,
    id: &str,
    version: Option<&Version>,
    arch: Arch,
) -> Option<&'a str> {
    let mut best: Option<(&'a str, Version)> = None;
    for name in refs {
        let segments: Vec<&str> = name.split('/').collect();
        if segments.len() != 5 {
            continue;
        }
        if segments[1] != id || segments[3] != arch.as_str() {
            continue;
        }
        let Ok(candidate) = segments[2].parse::<Version>() else {
            tracing::debug!("skipping ref {name} with invalid version");
            continue;
        };
        match version {
            Some(wanted) => {
                if candidate == *wanted {
                    return Some(name);
                }
            }
            None => match &best {
                Some((_, current)) if candidate <= *current => {}
                _ => best = Some((name, candidate)),
            },
        }
    }
    best.map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_select_ref_latest() {
        let refs = [
            "linglong/app/1.2.2/x86_64/runtime",
            "linglong/app/1.10.0/x86_64/runtime",
            "linglong/app/1.2.3/x86_64/runtime",
            "linglong/other/9.9.9/x86_64/runtime",
            "linglong/app/2.0.0/arm64/runtime",
        ];
        let got = select_ref(refs.iter().copied(), "app", None, Arch::X86_64).unwrap();
        assert_eq!(got, "linglong/app/1.10.0/x86_64/runtime");
    }

    #[test]
    fn test_select_ref_exact_version() {
        let refs = [
            "linglong/app/1.2.2/x86_64/runtime",
            "linglong/app/1.2.3/x86_64/runtime",
        ];
        let wanted = Version::from_str("1.2.2").unwrap();
        let got = select_ref(refs.iter().copied(), "app", Some(&wanted), Arch::X86_64).unwrap();
        assert_eq!(got, "linglong/app/1.2.2/x86_64/runtime");
        let wanted = Version::from_str("3.0").unwrap();
        assert!(select_ref(refs.iter().copied(), "app", Some(&wanted), Arch::X86_64).is_none());
    }

    #[test]
    fn test_parse_progress() {
        let content = "Pulling app\nReceiving objects: 73% (1234/1680) 2.1 MB/s 13.4 MB\n";
        assert_eq!(
            parse_progress(content).unwrap(),
            "Receiving objects: 73% (1234/1680) 2.1 MB/s 13.4 MB"
        );
        let content = "header\nfirst \u{1b}8Receiving objects: 90%\n";
        assert_eq!(parse_progress(content).unwrap(), "Receiving objects: 90%");
        assert!(parse_progress("").is_none());
    }
}

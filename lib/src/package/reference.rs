//! Package references.
//!
//! A reference names one materialized layer as
//! `channel/id/version/arch/module`, e.g.
//! `linglong/org.deepin.calculator/5.7.16/x86_64/runtime`. Prefix forms
//! (`id`, `id/version`, `id/version/arch`, `id/version/arch/module`) and the
//! colon channel form (`channel:id/...`) are accepted on input; missing
//! fields are filled with defaults. A reference without a version means
//! "latest", rendered as the literal segment `latest`.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::version::Version;

/// The default distribution channel.
pub const DEFAULT_CHANNEL: &str = "linglong";

/// Rendering of an unspecified version in the canonical string form.
const LATEST: &str = "latest";

/// Errors produced while parsing a reference string.
#[derive(Debug, Error)]
pub enum RefError {
    #[error("malformed reference {0:?}")]
    Malformed(String),
    #[error("malformed version in reference {input:?}: {version:?}")]
    Version { input: String, version: String },
    #[error("unsupported architecture {0:?}")]
    Arch(String),
    #[error("unknown module {0:?}")]
    Module(String),
}

/// Supported CPU architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "mips64")]
    Mips64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::Mips64 => "mips64",
        }
    }

    /// The architecture of the running host, if it is one we can run
    /// containers for.
    pub fn host() -> Option<Arch> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Arch::X86_64),
            "aarch64" => Some(Arch::Arm64),
            "mips64" => Some(Arch::Mips64),
            _ => None,
        }
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, RefError> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            "arm64" => Ok(Arch::Arm64),
            "mips64" => Ok(Arch::Mips64),
            other => Err(RefError::Arch(other.to_string())),
        }
    }
}

/// The module of a layer; `devel` adds debugging data on top of `runtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    #[default]
    Runtime,
    Devel,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Runtime => "runtime",
            Module::Devel => "devel",
        }
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, RefError> {
        match s {
            "runtime" => Ok(Module::Runtime),
            "devel" => Ok(Module::Devel),
            other => Err(RefError::Module(other.to_string())),
        }
    }
}

/// A fully defaulted package reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Ref {
    pub channel: String,
    pub id: String,
    /// `None` means "whatever is latest"; completed by catalog or remote
    /// lookup before a layer is addressed.
    pub version: Option<Version>,
    pub arch: Arch,
    pub module: Module,
}

impl Ref {
    pub fn new(
        channel: impl Into<String>,
        id: impl Into<String>,
        version: Option<Version>,
        arch: Arch,
        module: Module,
    ) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
            version,
            arch,
            module,
        }
    }

    /// The version segment as rendered in the canonical form.
    pub fn version_str(&self) -> String {
        match &self.version {
            Some(v) => v.to_string(),
            None => LATEST.to_string(),
        }
    }

    /// The basename of the pull progress file for this reference: the five
    /// fields joined by `-`.
    pub fn progress_file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.channel,
            self.id,
            self.version_str(),
            self.arch,
            self.module
        )
    }

    /// Return a copy with the version replaced.
    pub fn with_version(&self, version: Version) -> Self {
        let mut r = self.clone();
        r.version = Some(version);
        r
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.channel,
            self.id,
            self.version_str(),
            self.arch,
            self.module
        )
    }
}

impl FromStr for Ref {
    type Err = RefError;

    fn from_str(input: &str) -> Result<Self, RefError> {
        let malformed = || RefError::Malformed(input.to_string());
        let (channel, rest) = match input.split_once(':') {
            Some((c, r)) => (Some(c), r),
            None => (None, input),
        };
        let mut segments: Vec<&str> = rest.split('/').collect();
        let max = if channel.is_some() { 4 } else { 5 };
        if segments.len() > max {
            return Err(malformed());
        }
        let channel = match channel {
            Some(c) => c,
            None if segments.len() == 5 => segments.remove(0),
            None => DEFAULT_CHANNEL,
        };
        if channel.is_empty() || segments[0].is_empty() {
            return Err(malformed());
        }
        let id = segments[0];
        let version = match segments.get(1).copied() {
            None | Some("") | Some(LATEST) => None,
            Some(v) => Some(v.parse().map_err(|_| RefError::Version {
                input: input.to_string(),
                version: v.to_string(),
            })?),
        };
        let arch = match segments.get(2).copied() {
            None | Some("") => Arch::host().ok_or_else(malformed)?,
            Some(a) => a.parse()?,
        };
        let module = match segments.get(3).copied() {
            None | Some("") => Module::default(),
            Some(m) => m.parse()?,
        };
        Ok(Ref::new(channel, id, version, arch, module))
    }
}

/// Pick the candidate with the requested id whose version is greatest by
/// numeric order among those matching `version_prefix` as a dotted prefix.
/// Ties keep the last (most recently inserted) candidate.
pub fn latest_of<'a, I>(id: &str, version_prefix: &str, candidates: I) -> Option<&'a Ref>
where
    I: IntoIterator<Item = &'a Ref>,
{
    let mut best: Option<&'a Ref> = None;
    for candidate in candidates {
        if candidate.id != id {
            continue;
        }
        let Some(version) = candidate.version.as_ref() else {
            continue;
        };
        if !version.has_prefix(version_prefix) {
            continue;
        }
        match best.and_then(|b| b.version.as_ref()) {
            Some(best_version) if version < best_version => {}
            _ => best = Some(candidate),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Ref {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_prefix_forms() {
        let host = Arch::host().unwrap();
        let r = parse("org.deepin.calculator");
        assert_eq!(r.channel, "linglong");
        assert_eq!(r.id, "org.deepin.calculator");
        assert_eq!(r.version, None);
        assert_eq!(r.arch, host);
        assert_eq!(r.module, Module::Runtime);

        let r = parse("org.deepin.calculator/5.7.16");
        assert_eq!(r.version_str(), "5.7.16");

        let r = parse("org.deepin.calculator/5.7.16/x86_64");
        assert_eq!(r.arch, Arch::X86_64);

        let r = parse("org.deepin.calculator/5.7.16/x86_64/devel");
        assert_eq!(r.module, Module::Devel);

        let r = parse("main:org.deepin.calculator/5.7.16/x86_64/devel");
        assert_eq!(r.channel, "main");

        let r = parse("main/org.deepin.calculator/5.7.16/x86_64/devel");
        assert_eq!(r.channel, "main");
    }

    #[test]
    fn test_round_trip_is_canonical() {
        for s in [
            "org.deepin.calculator",
            "org.deepin.calculator/5.7.16",
            "org.deepin.calculator/5.7.16/x86_64",
            "org.deepin.calculator/5.7.16/x86_64/devel",
            "main:org.deepin.calculator/5.7.16/x86_64/devel",
        ] {
            let r = parse(s);
            let formatted = r.to_string();
            assert_eq!(formatted.split('/').count(), 5, "{formatted}");
            assert_eq!(parse(&formatted), r);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<Ref>().is_err());
        assert!("/1.0".parse::<Ref>().is_err());
        assert!("a/b/c/d/e/f".parse::<Ref>().is_err());
        assert!("ch:a/b/c/d/e".parse::<Ref>().is_err());
        assert!("app/not.a.version".parse::<Ref>().is_err());
        assert!("app/1.0/sparc64".parse::<Ref>().is_err());
        assert!("app/1.0/x86_64/debug".parse::<Ref>().is_err());
    }

    #[test]
    fn test_latest_of() {
        let candidates: Vec<Ref> = ["1.2.2", "1.2.3", "1.10.0"]
            .iter()
            .map(|v| parse(&format!("app/{v}/x86_64")))
            .collect();
        let latest = latest_of("app", "", &candidates).unwrap();
        assert_eq!(latest.version_str(), "1.10.0");
        let latest = latest_of("app", "1.2", &candidates).unwrap();
        assert_eq!(latest.version_str(), "1.2.3");
        assert!(latest_of("other", "", &candidates).is_none());
        assert!(latest_of("app", "2", &candidates).is_none());
    }
}

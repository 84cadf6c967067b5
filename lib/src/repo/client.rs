//! The remote metadata index client.
//!
//! Queries POST `{appId, version, arch}` to the index's fuzzy search
//! endpoint and get back an envelope `{code, data}`. The envelope never
//! escapes this module.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fn_error_context::context;
use serde::Deserialize;

use crate::cache::MetaCache;
use crate::package::{Arch, PackageMeta};

/// Search endpoint below the index base URL.
const SEARCH_PATH: &str = "apps/fuzzysearchapp";

/// The index replies with this code on success.
const CODE_OK: i32 = 200;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    code: i32,
    #[serde(default)]
    data: Option<Vec<PackageMeta>>,
}

pub struct RepoClient {
    endpoint: String,
    http: reqwest::blocking::Client,
    cache: MetaCache,
}

impl RepoClient {
    pub fn new(app_db_url: &str, cache: MetaCache) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Building http client")?;
        Ok(Self {
            endpoint: app_db_url.trim_end_matches('/').to_string(),
            http,
            cache,
        })
    }

    fn search_url(&self) -> String {
        format!("{}/{SEARCH_PATH}", self.endpoint)
    }

    /// Query descriptors for `(id, version, arch)`. An empty version asks
    /// for all versions.
    #[context("Querying remote index for {id}")]
    pub fn query(&self, id: &str, version: &str, arch: Arch) -> Result<Vec<PackageMeta>> {
        let raw = self.query_raw(id, version, arch)?;
        parse_query_envelope(&raw)
    }

    /// Like [`query`], consulting the TTL cache first. Successful uncached
    /// responses refresh the cache.
    #[context("Querying remote index for {id} (cached)")]
    pub fn query_cached(&self, id: &str, arch: Arch, force: bool) -> Result<Vec<PackageMeta>> {
        if !force {
            if let Some(data) = self.cache.lookup(id)? {
                return parse_query_envelope(&data);
            }
        }
        let raw = self.query_raw(id, "", arch)?;
        let metas = parse_query_envelope(&raw)?;
        if let Err(e) = self.cache.store(id, &raw) {
            tracing::warn!("failed to refresh metadata cache for {id}: {e:#}");
        }
        Ok(metas)
    }

    fn query_raw(&self, id: &str, version: &str, arch: Arch) -> Result<String> {
        let body = serde_json::json!({
            "AppId": id,
            "version": version,
            "arch": arch.as_str(),
        });
        let reply = self
            .http
            .post(self.search_url())
            .json(&body)
            .send()
            .context("please check the network")?;
        reply.text().context("Reading index response")
    }
}

/// Enforce the envelope shape and unwrap the descriptor list. A non-200
/// code means the package is unknown to the index; a null `data` is an
/// empty result.
pub fn parse_query_envelope(raw: &str) -> Result<Vec<PackageMeta>> {
    let envelope: QueryEnvelope = serde_json::from_str(raw)
        .context("parse server's json data failed, please check the network")?;
    if envelope.code != CODE_OK {
        return Err(anyhow!("not found in repo (server code {})", envelope.code));
    }
    Ok(envelope.data.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_envelope_success() {
        let raw = indoc! {r#"
            {
                "code": 200,
                "data": [
                    {
                        "appId": "org.deepin.calculator",
                        "name": "deepin-calculator",
                        "version": "5.7.16",
                        "arch": "x86_64",
                        "kind": "app",
                        "runtime": "org.deepin.Runtime/20.5.0/x86_64",
                        "repoName": "repo",
                        "size": "683400"
                    }
                ]
            }
        "#};
        let metas = parse_query_envelope(raw).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].app_id, "org.deepin.calculator");
        assert_eq!(metas[0].runtime, "org.deepin.Runtime/20.5.0/x86_64");
    }

    #[test]
    fn test_envelope_not_found() {
        let err = parse_query_envelope(r#"{"code": 404, "data": null}"#).unwrap_err();
        assert!(format!("{err}").contains("not found in repo"));
    }

    #[test]
    fn test_envelope_null_data_is_empty() {
        let metas = parse_query_envelope(r#"{"code": 200, "data": null}"#).unwrap();
        assert!(metas.is_empty());
    }

    #[test]
    fn test_envelope_garbage() {
        assert!(parse_query_envelope("<html>").is_err());
    }
}

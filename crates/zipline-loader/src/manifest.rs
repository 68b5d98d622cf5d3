//! # Manifest
//!
//! JSON description of a code application: modules, hashes, and the
//! dependency DAG. URLs are normalized against the manifest URL at load
//! time.
//!
//! ## Invariants
//! - The `dependsOnIds` graph is acyclic.
//! - Every referenced id exists.
//! - Every `sha256` is 32 bytes of lowercase hex.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::error::LoaderError;
use crate::error::Result;
use crate::hash::is_sha256_hex;

/// Filename convention for embedded manifests, keyed by application name.
pub fn manifest_file_name(application_name: &str) -> String {
    format!("{}.manifest.zipline.json", application_name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZiplineManifest {
    /// Keyed by module id; ordered so structural comparison and topological
    /// tie-breaking are deterministic.
    pub modules: BTreeMap<String, ManifestModule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestModule {
    pub url: String,
    /// Lowercase hex SHA-256 of the module file.
    pub sha256: String,
    #[serde(rename = "dependsOnIds", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on_ids: Vec<String>,
}

impl ZiplineManifest {
    /// Decodes and validates manifest bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn validate(&self) -> Result<()> {
        for (id, module) in &self.modules {
            if !is_sha256_hex(&module.sha256) {
                return Err(LoaderError::ManifestInvalid(format!(
                    "module {} has a malformed sha256",
                    id
                )));
            }
            for dependency in &module.depends_on_ids {
                if !self.modules.contains_key(dependency) {
                    return Err(LoaderError::ManifestInvalid(format!(
                        "module {} depends on unknown module {}",
                        id, dependency
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Module ids in dependency order: every module appears after all of its
    /// dependencies. Ties break lexicographically. Fails on cycles.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut remaining_deps: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, module) in &self.modules {
            remaining_deps.insert(id, module.depends_on_ids.len());
            for dependency in &module.depends_on_ids {
                dependents.entry(dependency).or_default().push(id);
            }
        }

        let mut ready: Vec<&str> = remaining_deps
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.modules.len());

        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id.to_string());
            for dependent in dependents.remove(id).unwrap_or_default() {
                let count = remaining_deps
                    .get_mut(dependent)
                    .ok_or_else(|| LoaderError::ManifestInvalid(format!("unknown module {}", dependent)))?;
                *count -= 1;
                if *count == 0 {
                    // Keep lexicographic order among newly-ready modules.
                    let at = ready.partition_point(|r| *r < dependent);
                    ready.insert(at, dependent);
                }
            }
        }

        if order.len() != self.modules.len() {
            return Err(LoaderError::ManifestInvalid(
                "dependency graph has a cycle".into(),
            ));
        }
        Ok(order)
    }

    /// Resolves each module's URL against the manifest URL. Absolute URLs
    /// pass through.
    pub fn resolve_urls(&mut self, manifest_url: &str) -> Result<()> {
        let base = Url::parse(manifest_url)?;
        for module in self.modules.values_mut() {
            if Url::parse(&module.url).is_ok() {
                continue; // already absolute
            }
            module.url = base.join(&module.url)?.to_string();
        }
        Ok(())
    }
}

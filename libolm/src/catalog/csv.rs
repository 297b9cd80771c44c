//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! The subset of the ClusterServiceVersion manifest the resolver reads.
//!
//! Everything else in the manifest is carried along untouched as JSON so the
//! step generator can emit it verbatim.

use super::{Api, Bundle, CatalogError, InstallMode, InstallStrategy, Result};
use crate::version::{parse_lenient, VersionRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CSV_KIND: &str = "ClusterServiceVersion";
pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const SKIP_RANGE_ANNOTATION: &str = "olm.skipRange";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CsvMetadata {
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrdDescription {
    pub name: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiServiceDescription {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrdDescriptions {
    #[serde(default)]
    pub owned: Vec<CrdDescription>,
    #[serde(default)]
    pub required: Vec<CrdDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiServiceDescriptions {
    #[serde(default)]
    pub owned: Vec<ApiServiceDescription>,
    #[serde(default)]
    pub required: Vec<ApiServiceDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NamedInstallStrategy {
    #[serde(default, rename = "strategy")]
    pub name: String,
    #[serde(default)]
    pub spec: InstallStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CsvSpec {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub replaces: Option<String>,
    #[serde(default)]
    pub skips: Vec<String>,
    #[serde(default)]
    pub install_modes: Vec<InstallMode>,
    #[serde(default, rename = "customresourcedefinitions")]
    pub crds: CrdDescriptions,
    #[serde(default, rename = "apiservicedefinitions")]
    pub api_services: ApiServiceDescriptions,
    #[serde(default)]
    pub install: Option<NamedInstallStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterServiceVersion {
    pub metadata: CsvMetadata,
    #[serde(default)]
    pub spec: CsvSpec,
}

impl ClusterServiceVersion {
    pub fn from_value(value: &serde_json::Value) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn owned_apis(&self) -> impl Iterator<Item = Api> + '_ {
        self.spec
            .crds
            .owned
            .iter()
            .map(|d| Api::from_crd_name(&d.name, &d.version, &d.kind))
            .chain(
                self.spec
                    .api_services
                    .owned
                    .iter()
                    .map(|d| Api::new(d.group.clone(), d.version.clone(), d.kind.clone())),
            )
    }

    pub fn required_apis(&self) -> impl Iterator<Item = Api> + '_ {
        self.spec
            .crds
            .required
            .iter()
            .map(|d| Api::from_crd_name(&d.name, &d.version, &d.kind))
            .chain(
                self.spec
                    .api_services
                    .required
                    .iter()
                    .map(|d| Api::new(d.group.clone(), d.version.clone(), d.kind.clone())),
            )
    }

    pub fn skip_range(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(SKIP_RANGE_ANNOTATION)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Turn the CSV into a bundle of `package`, keeping the raw manifests
    pub fn into_bundle(
        self,
        package: &str,
        raw: serde_json::Value,
        crds: Vec<serde_json::Value>,
    ) -> Result<Bundle> {
        let name = self.metadata.name.clone();
        let version_str = self
            .spec
            .version
            .clone()
            .ok_or_else(|| CatalogError::MissingVersion(name.clone()))?;
        let version = parse_lenient(&version_str).map_err(|e| CatalogError::InvalidVersion {
            bundle: name.clone(),
            version: version_str.clone(),
            reason: e.to_string(),
        })?;
        let skip_range = self
            .skip_range()
            .map(VersionRange::parse)
            .transpose()
            .map_err(|source| CatalogError::InvalidRange {
                bundle: name.clone(),
                source,
            })?;

        let mut bundle = Bundle::new(name, package, version);
        bundle.provided_apis = self.owned_apis().collect();
        bundle.required_apis = self.required_apis().collect();
        bundle.replaces = self.spec.replaces.clone().filter(|r| !r.is_empty());
        bundle.skips = self.spec.skips.clone();
        bundle.skip_range = skip_range;
        bundle.install_modes = self.spec.install_modes.clone();
        bundle.strategy = self.spec.install.map(|i| i.spec).unwrap_or_default();
        bundle.crds = crds;
        bundle.csv = Some(raw);
        Ok(bundle)
    }
}

/// The `kind` of a manifest
pub fn kind_of(manifest: &serde_json::Value) -> Option<&str> {
    manifest.get("kind").and_then(|k| k.as_str())
}

/// The `metadata.name` of a manifest
pub fn name_of(manifest: &serde_json::Value) -> Option<&str> {
    manifest.pointer("/metadata/name").and_then(|n| n.as_str())
}

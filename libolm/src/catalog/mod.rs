//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory model of an operator catalog.
//!
//! A catalog holds packages, each with one or more channels, and the bundles
//! (ClusterServiceVersions) those channels point into. Bundles are connected by
//! `replaces` edges and may jump over older bundles with `skips` or a
//! `skipRange`. Catalogs are populated by the loaders in [`declcfg`] and
//! [`manifests`] and queried through the [`Querier`] trait.

mod continuity;
pub mod csv;
pub mod declcfg;
mod graph;
pub mod manifests;
mod query;

pub use continuity::{check_continuity, ContinuityIssue};
pub use graph::{PackageGraph, ReplacesGraphLoader};
pub use query::Querier;

use crate::version::{RangeError, VersionRange};
use k8s_openapi::api::rbac::v1::PolicyRule;
use miette::Diagnostic;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while building or querying a catalog
#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("bundle {0} not found")]
    #[diagnostic(
        code(olm::catalog_error::bundle_not_found),
        help("Check the bundle name and that the catalog has been loaded")
    )]
    BundleNotFound(String),

    #[error("package {0} not found")]
    #[diagnostic(
        code(olm::catalog_error::package_not_found),
        help("Check the package name against the catalog's package list")
    )]
    PackageNotFound(String),

    #[error("channel {channel} not found in package {package}")]
    #[diagnostic(code(olm::catalog_error::channel_not_found))]
    ChannelNotFound { package: String, channel: String },

    #[error("bundle {bundle} replaces {replaces}, which is not present in package {package}")]
    #[diagnostic(
        code(olm::catalog_error::missing_replacement),
        help("Add the replaced bundle to the catalog first, or correct the replaces field")
    )]
    MissingReplacement {
        package: String,
        bundle: String,
        replaces: String,
    },

    #[error("bundle {bundle} already exists in package {package}")]
    #[diagnostic(code(olm::catalog_error::duplicate_bundle))]
    DuplicateBundle { package: String, bundle: String },

    #[error("bundle {bundle} belongs to package {found}, expected {expected}")]
    #[diagnostic(code(olm::catalog_error::package_mismatch))]
    PackageMismatch {
        bundle: String,
        expected: String,
        found: String,
    },

    #[error("replaces chain of package {package} loops back to {bundle}")]
    #[diagnostic(
        code(olm::catalog_error::replaces_cycle),
        help("The catalog was modified after loading; reload it from its source")
    )]
    ReplacesCycle { package: String, bundle: String },

    #[error("channel {channel} of package {package} points at missing head {head}")]
    #[diagnostic(code(olm::catalog_error::invalid_channel_head))]
    InvalidChannelHead {
        package: String,
        channel: String,
        head: String,
    },

    #[error("channel {channel} of package {package} has {} heads: {}", heads.len(), heads.join(", "))]
    #[diagnostic(
        code(olm::catalog_error::ambiguous_channel_head),
        help("Exactly one channel entry must be neither replaced nor skipped by another entry")
    )]
    AmbiguousChannelHead {
        package: String,
        channel: String,
        heads: Vec<String>,
    },

    #[error("default channel {channel} of package {package} does not exist")]
    #[diagnostic(code(olm::catalog_error::invalid_default_channel))]
    InvalidDefaultChannel { package: String, channel: String },

    #[error("invalid version {version:?} on bundle {bundle}: {reason}")]
    #[diagnostic(code(olm::catalog_error::invalid_version))]
    InvalidVersion {
        bundle: String,
        version: String,
        reason: String,
    },

    #[error("bundle {0} has no version")]
    #[diagnostic(
        code(olm::catalog_error::missing_version),
        help("Bundles must carry an olm.package property or a CSV spec.version")
    )]
    MissingVersion(String),

    #[error("invalid range on bundle {bundle}")]
    #[diagnostic(code(olm::catalog_error::invalid_range))]
    InvalidRange {
        bundle: String,
        #[source]
        #[diagnostic_source]
        source: RangeError,
    },

    #[error("invalid catalog document in {path}: {reason}")]
    #[diagnostic(
        code(olm::catalog_error::invalid_document),
        help("Check the document schema and required fields")
    )]
    InvalidDocument { path: PathBuf, reason: String },

    #[error("failed to read {path}: {source}")]
    #[diagnostic(
        code(olm::catalog_error::io),
        help("Check that the catalog path exists and is readable")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} catalog error(s)", errors.len())]
    #[diagnostic(code(olm::catalog_error::aggregate))]
    Aggregate {
        #[related]
        errors: Vec<CatalogError>,
    },
}

impl CatalogError {
    /// Fold a list of errors into a single result
    pub fn aggregate(errors: Vec<CatalogError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::Aggregate { errors })
        }
    }

    /// True if the error reports something absent rather than malformed
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CatalogError::BundleNotFound(_)
                | CatalogError::PackageNotFound(_)
                | CatalogError::ChannelNotFound { .. }
        )
    }
}

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Identifies a catalog source by name and namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SourceKey {
    pub name: String,
    pub namespace: String,
}

impl SourceKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        SourceKey {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A group/version/kind triple naming a Kubernetes API
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Api {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Api {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Api {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build the API served by a CRD named `<plural>.<group>`
    pub fn from_crd_name(crd_name: &str, version: &str, kind: &str) -> Self {
        let group = crd_name.split_once('.').map(|(_, g)| g).unwrap_or_default();
        Api::new(group, version, kind)
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// A dependency on another package within a version range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequirement {
    pub package_name: String,
    pub version_range: VersionRange,
}

impl fmt::Display for PackageRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "package {} ({})", self.package_name, self.version_range)
    }
}

/// The ways an operator can be scoped by its OperatorGroup
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum InstallModeType {
    OwnNamespace,
    SingleNamespace,
    MultiNamespace,
    AllNamespaces,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMode {
    #[serde(rename = "type")]
    pub mode: InstallModeType,
    pub supported: bool,
}

/// RBAC rules granted to one service account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPermission {
    pub service_account_name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// A deployment the operator runs, kept opaque apart from its name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StrategyDeployment {
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl StrategyDeployment {
    /// The service account the deployment's pods run as, if set
    pub fn service_account(&self) -> Option<&str> {
        self.spec
            .pointer("/template/spec/serviceAccountName")
            .and_then(|v| v.as_str())
    }
}

/// The deployment install strategy of a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallStrategy {
    #[serde(default)]
    pub deployments: Vec<StrategyDeployment>,
    #[serde(default)]
    pub permissions: Vec<StrategyPermission>,
    #[serde(default)]
    pub cluster_permissions: Vec<StrategyPermission>,
}

impl InstallStrategy {
    /// Every service account the strategy refers to, deduplicated and sorted
    pub fn service_accounts(&self) -> BTreeSet<&str> {
        self.permissions
            .iter()
            .chain(self.cluster_permissions.iter())
            .map(|p| p.service_account_name.as_str())
            .chain(self.deployments.iter().filter_map(|d| d.service_account()))
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// A single installable version of an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub name: String,
    pub package: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_range: Option<VersionRange>,
    #[serde(default)]
    pub channels: BTreeSet<String>,
    #[serde(default)]
    pub provided_apis: BTreeSet<Api>,
    #[serde(default)]
    pub required_apis: BTreeSet<Api>,
    #[serde(default)]
    pub required_packages: Vec<PackageRequirement>,
    #[serde(default)]
    pub install_modes: Vec<InstallMode>,
    #[serde(default)]
    pub strategy: InstallStrategy,
    /// Manifests of the CRDs this bundle owns
    #[serde(default)]
    pub crds: Vec<serde_json::Value>,
    /// The ClusterServiceVersion manifest, when the source carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Bundle {
    /// Create a bundle with no edges, APIs or manifests
    pub fn new(name: impl Into<String>, package: impl Into<String>, version: Version) -> Self {
        Bundle {
            name: name.into(),
            package: package.into(),
            version,
            replaces: None,
            skips: Vec::new(),
            skip_range: None,
            channels: BTreeSet::new(),
            provided_apis: BTreeSet::new(),
            required_apis: BTreeSet::new(),
            required_packages: Vec::new(),
            install_modes: Vec::new(),
            strategy: InstallStrategy::default(),
            crds: Vec::new(),
            csv: None,
            image: None,
        }
    }

    pub fn provides(&self, api: &Api) -> bool {
        self.provided_apis.contains(api)
    }

    /// Whether this bundle may directly replace the installed CSV `name` at `version`,
    /// through its replaces edge, its skips list or its skipRange. A skipRange
    /// match only counts when this bundle is strictly newer than the install.
    pub fn can_replace(&self, name: &str, version: Option<&Version>) -> bool {
        if self.name == name {
            return false;
        }
        if self.replaces.as_deref() == Some(name) || self.skips.iter().any(|s| s == name) {
            return true;
        }
        match (&self.skip_range, version) {
            (Some(range), Some(v)) => self.version > *v && range.matches(v),
            _ => false,
        }
    }

    /// Whether the bundle can run under the given install mode.
    /// Bundles that declare no install modes at all are not restricted.
    pub fn supports(&self, mode: InstallModeType) -> bool {
        if self.install_modes.is_empty() {
            return true;
        }
        self.install_modes
            .iter()
            .any(|m| m.mode == mode && m.supported)
    }
}

/// A named upgrade stream within a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub name: String,
    pub package: String,
    #[serde(rename = "currentCSV")]
    pub current_csv_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,
    pub default_channel_name: String,
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Package {
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn default_channel(&self) -> Option<&Channel> {
        self.channel(&self.default_channel_name)
    }
}

/// The content of a single catalog source
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    source: SourceKey,
    packages: BTreeMap<String, Package>,
    graphs: BTreeMap<String, PackageGraph>,
}

impl Catalog {
    pub fn new(source: SourceKey) -> Self {
        Catalog {
            source,
            packages: BTreeMap::new(),
            graphs: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    /// Register a package and its channels. Channel heads are checked by
    /// [`validate`](Self::validate) once all bundles are present.
    pub fn add_package(&mut self, package: Package) {
        self.graphs
            .entry(package.name.clone())
            .or_insert_with(|| PackageGraph::new(package.name.clone()));
        self.packages.insert(package.name.clone(), package);
    }

    /// Add one bundle through the replaces-graph loader
    pub fn add_bundle(&mut self, bundle: Bundle) -> Result<()> {
        let graph = self
            .graphs
            .entry(bundle.package.clone())
            .or_insert_with(|| PackageGraph::new(bundle.package.clone()));
        ReplacesGraphLoader.add(bundle, graph)
    }

    /// Add many bundles, in whatever order, inserting predecessors first
    pub fn add_bundles(&mut self, bundles: Vec<Bundle>) -> Result<()> {
        let mut by_package: BTreeMap<String, Vec<Bundle>> = BTreeMap::new();
        for b in bundles {
            by_package.entry(b.package.clone()).or_default().push(b);
        }
        let mut errors = Vec::new();
        for (package, bundles) in by_package {
            let graph = self
                .graphs
                .entry(package.clone())
                .or_insert_with(|| PackageGraph::new(package.clone()));
            if let Err(e) = ReplacesGraphLoader.load(bundles, graph) {
                match e {
                    CatalogError::Aggregate { errors: inner } => errors.extend(inner),
                    other => errors.push(other),
                }
            }
        }
        CatalogError::aggregate(errors)
    }

    /// Check package invariants: every channel head resolves to a bundle of the
    /// package, the default channel exists, and no replaces chain loops.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        for package in self.packages.values() {
            if package.default_channel().is_none() {
                errors.push(CatalogError::InvalidDefaultChannel {
                    package: package.name.clone(),
                    channel: package.default_channel_name.clone(),
                });
            }
            let graph = self.graphs.get(&package.name);
            for channel in &package.channels {
                match graph.map(|g| g.chain_from(&channel.current_csv_name)) {
                    Some(Ok(_)) => {}
                    Some(Err(CatalogError::BundleNotFound(_))) | None => {
                        errors.push(CatalogError::InvalidChannelHead {
                            package: package.name.clone(),
                            channel: channel.name.clone(),
                            head: channel.current_csv_name.clone(),
                        })
                    }
                    Some(Err(e)) => errors.push(e),
                }
            }
        }
        debug!(source = %self.source, packages = self.packages.len(), errors = errors.len(), "validated catalog");
        CatalogError::aggregate(errors)
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn graph(&self, package: &str) -> Option<&PackageGraph> {
        self.graphs.get(package)
    }

    /// All bundles across all packages, ordered by package then name
    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.graphs.values().flat_map(|g| g.bundles())
    }

    /// Look up a channel; an empty channel name selects the package default
    pub fn channel(&self, package: &str, channel: &str) -> Result<&Channel> {
        let pkg = self
            .packages
            .get(package)
            .ok_or_else(|| CatalogError::PackageNotFound(package.to_string()))?;
        let name = if channel.is_empty() {
            pkg.default_channel_name.as_str()
        } else {
            channel
        };
        pkg.channel(name).ok_or_else(|| CatalogError::ChannelNotFound {
            package: package.to_string(),
            channel: name.to_string(),
        })
    }

    /// The bundles of a channel, head first, following replaces edges
    pub fn channel_bundles(&self, package: &str, channel: &str) -> Result<Vec<&Bundle>> {
        let ch = self.channel(package, channel)?;
        let graph = self
            .graphs
            .get(package)
            .ok_or_else(|| CatalogError::PackageNotFound(package.to_string()))?;
        graph.chain_from(&ch.current_csv_name)
    }

    /// Bundles owning the given API, ordered by package then highest version
    pub fn providers_of(&self, api: &Api) -> Vec<&Bundle> {
        let mut out: Vec<&Bundle> = self.bundles().filter(|b| b.provides(api)).collect();
        out.sort_by(|a, b| {
            a.package
                .cmp(&b.package)
                .then_with(|| b.version.cmp(&a.version))
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// Fill in each bundle's channel membership by walking every channel from its head
pub(crate) fn assign_channels(packages: &[Package], bundles: &mut [Bundle]) {
    let mut by_name: BTreeMap<(String, String), usize> = BTreeMap::new();
    for (i, b) in bundles.iter().enumerate() {
        by_name.insert((b.package.clone(), b.name.clone()), i);
    }
    for package in packages {
        for channel in &package.channels {
            let mut seen = BTreeSet::new();
            let mut next = Some(channel.current_csv_name.clone());
            while let Some(name) = next.take() {
                if !seen.insert(name.clone()) {
                    break;
                }
                if let Some(&i) = by_name.get(&(package.name.clone(), name)) {
                    bundles[i].channels.insert(channel.name.clone());
                    next = bundles[i].replaces.clone();
                }
            }
        }
    }
}

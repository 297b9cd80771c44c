//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! File-based declarative catalog configuration.
//!
//! A declarative catalog is a directory tree of JSON streams and multi-document
//! YAML files. Every document carries a `schema` field:
//!
//! - `olm.package` declares a package and its default channel
//! - `olm.channel` lists the entries of one channel with their upgrade edges
//! - `olm.bundle` describes one bundle through typed properties
//!
//! Documents with any other schema are kept as opaque [`DeclMeta`] blobs.

use super::csv::{kind_of, ClusterServiceVersion, CRD_KIND, CSV_KIND};
use super::{
    Api, Bundle, Catalog, CatalogError, Channel, Package, PackageRequirement, Result, SourceKey,
};
use crate::version::{parse_lenient, VersionRange};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const SCHEMA_PACKAGE: &str = "olm.package";
pub const SCHEMA_CHANNEL: &str = "olm.channel";
pub const SCHEMA_BUNDLE: &str = "olm.bundle";

pub const PROPERTY_PACKAGE: &str = "olm.package";
pub const PROPERTY_GVK: &str = "olm.gvk";
pub const PROPERTY_GVK_REQUIRED: &str = "olm.gvk.required";
pub const PROPERTY_PACKAGE_REQUIRED: &str = "olm.package.required";
pub const PROPERTY_BUNDLE_OBJECT: &str = "olm.bundle.object";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclPackage {
    pub name: String,
    #[serde(default)]
    pub default_channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclChannel {
    pub package: String,
    pub name: String,
    #[serde(default)]
    pub entries: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclBundle {
    pub name: String,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub properties: Vec<Property>,
}

/// A document of a schema this loader does not interpret
#[derive(Debug, Clone, PartialEq)]
pub struct DeclMeta {
    pub schema: String,
    pub package: Option<String>,
    pub blob: serde_json::Value,
}

/// One schema-tagged document
#[derive(Debug, Clone, PartialEq)]
pub enum DeclDocument {
    Package(DeclPackage),
    Channel(DeclChannel),
    Bundle(DeclBundle),
    Meta(DeclMeta),
}

impl DeclDocument {
    /// Decode a document by its `schema` tag
    pub fn from_value(value: serde_json::Value, path: &Path) -> Result<Self> {
        let invalid = |reason: String| CatalogError::InvalidDocument {
            path: path.to_path_buf(),
            reason,
        };
        let schema = value
            .get("schema")
            .and_then(|s| s.as_str())
            .ok_or_else(|| invalid("document has no schema".to_string()))?
            .to_string();
        let doc = match schema.as_str() {
            SCHEMA_PACKAGE => DeclDocument::Package(
                serde_json::from_value(value).map_err(|e| invalid(format!("{}: {}", schema, e)))?,
            ),
            SCHEMA_CHANNEL => DeclDocument::Channel(
                serde_json::from_value(value).map_err(|e| invalid(format!("{}: {}", schema, e)))?,
            ),
            SCHEMA_BUNDLE => DeclDocument::Bundle(
                serde_json::from_value(value).map_err(|e| invalid(format!("{}: {}", schema, e)))?,
            ),
            _ => DeclDocument::Meta(DeclMeta {
                package: value
                    .get("package")
                    .and_then(|p| p.as_str())
                    .map(str::to_string),
                schema,
                blob: value,
            }),
        };
        Ok(doc)
    }
}

/// Interpreted bundle properties
#[derive(Debug, Clone, PartialEq)]
pub enum BundleProperty {
    Package { package_name: String, version: String },
    Gvk(Api),
    GvkRequired(Api),
    PackageRequired(PackageRequirement),
    BundleObject(serde_json::Value),
    Other(Property),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageValue {
    package_name: String,
    version: String,
}

#[derive(Deserialize)]
struct ObjectValue {
    data: String,
}

impl BundleProperty {
    fn parse(property: &Property, bundle: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| CatalogError::InvalidDocument {
            path: path.to_path_buf(),
            reason: format!("bundle {} property {}: {}", bundle, property.kind, reason),
        };
        let value = property.value.clone();
        let parsed = match property.kind.as_str() {
            PROPERTY_PACKAGE => {
                let p: PackageValue =
                    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
                BundleProperty::Package {
                    package_name: p.package_name,
                    version: p.version,
                }
            }
            PROPERTY_GVK => {
                BundleProperty::Gvk(serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?)
            }
            PROPERTY_GVK_REQUIRED => BundleProperty::GvkRequired(
                serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?,
            ),
            PROPERTY_PACKAGE_REQUIRED => BundleProperty::PackageRequired(
                serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?,
            ),
            PROPERTY_BUNDLE_OBJECT => {
                let o: ObjectValue =
                    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(o.data.trim())
                    .map_err(|e| invalid(e.to_string()))?;
                BundleProperty::BundleObject(
                    serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?,
                )
            }
            _ => BundleProperty::Other(property.clone()),
        };
        Ok(parsed)
    }
}

/// Every document of a declarative catalog, grouped by schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclarativeConfig {
    pub packages: Vec<DeclPackage>,
    pub channels: Vec<DeclChannel>,
    pub bundles: Vec<DeclBundle>,
    pub others: Vec<DeclMeta>,
}

enum Format {
    Json,
    Yaml,
}

impl DeclarativeConfig {
    /// Load every `.json`, `.yaml` and `.yml` file below `root`
    pub fn load_dir(root: &Path) -> Result<Self> {
        let mut cfg = DeclarativeConfig::default();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| CatalogError::Io {
                path: root.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let format = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => Format::Json,
                Some("yaml") | Some("yml") => Format::Yaml,
                _ => continue,
            };
            let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), "reading declarative config file");
            let docs = match format {
                Format::Json => parse_json_stream(&text, path)?,
                Format::Yaml => parse_yaml_stream(&text, path)?,
            };
            cfg.extend(docs);
        }
        Ok(cfg)
    }

    /// Parse a single YAML or JSON text; JSON is detected by its first character
    pub fn parse(text: &str) -> Result<Self> {
        let path = PathBuf::from("<inline>");
        let docs = if text.trim_start().starts_with('{') {
            parse_json_stream(text, &path)?
        } else {
            parse_yaml_stream(text, &path)?
        };
        let mut cfg = DeclarativeConfig::default();
        cfg.extend(docs);
        Ok(cfg)
    }

    fn extend(&mut self, docs: Vec<DeclDocument>) {
        for doc in docs {
            match doc {
                DeclDocument::Package(p) => self.packages.push(p),
                DeclDocument::Channel(c) => self.channels.push(c),
                DeclDocument::Bundle(b) => self.bundles.push(b),
                DeclDocument::Meta(m) => self.others.push(m),
            }
        }
    }

    /// Build a validated in-memory catalog for `source`
    pub fn into_catalog(self, source: SourceKey) -> Result<Catalog> {
        let path = PathBuf::from(source.to_string());
        let mut errors = Vec::new();

        let mut bundles: BTreeMap<(String, String), Bundle> = BTreeMap::new();
        for decl in &self.bundles {
            match bundle_from_decl(decl, &path) {
                Ok(b) => {
                    bundles.insert((b.package.clone(), b.name.clone()), b);
                }
                Err(e) => errors.push(e),
            }
        }

        let mut channels = self.channels;
        channels.sort_by(|a, b| (&a.package, &a.name).cmp(&(&b.package, &b.name)));
        let mut package_channels: BTreeMap<String, Vec<Channel>> = BTreeMap::new();
        // replaces recorded per bundle so diverging channels can be reported
        let mut recorded_replaces: BTreeMap<(String, String), Option<String>> = BTreeMap::new();

        for channel in &channels {
            match channel_head(channel) {
                Ok(head) => package_channels
                    .entry(channel.package.clone())
                    .or_default()
                    .push(Channel {
                        name: channel.name.clone(),
                        package: channel.package.clone(),
                        current_csv_name: head,
                    }),
                Err(e) => errors.push(e),
            }

            for entry in &channel.entries {
                let key = (channel.package.clone(), entry.name.clone());
                let Some(bundle) = bundles.get_mut(&key) else {
                    errors.push(CatalogError::InvalidDocument {
                        path: path.clone(),
                        reason: format!(
                            "channel {}/{} lists {}, which has no olm.bundle document",
                            channel.package, channel.name, entry.name
                        ),
                    });
                    continue;
                };
                bundle.channels.insert(channel.name.clone());
                let replaces = entry.replaces.clone().filter(|r| !r.is_empty());
                match recorded_replaces.get(&key) {
                    Some(previous) if previous != &replaces => {
                        warn!(
                            package = %channel.package,
                            channel = %channel.name,
                            bundle = %entry.name,
                            "channel disagrees on replaces edge; keeping the first one seen"
                        );
                    }
                    Some(_) => {}
                    None => {
                        recorded_replaces.insert(key.clone(), replaces.clone());
                        bundle.replaces = replaces;
                    }
                }
                for skip in &entry.skips {
                    if !bundle.skips.contains(skip) {
                        bundle.skips.push(skip.clone());
                    }
                }
                if bundle.skip_range.is_none() {
                    if let Some(range) = entry.skip_range.as_deref().filter(|r| !r.trim().is_empty()) {
                        match VersionRange::parse(range) {
                            Ok(r) => bundle.skip_range = Some(r),
                            Err(source) => errors.push(CatalogError::InvalidRange {
                                bundle: entry.name.clone(),
                                source,
                            }),
                        }
                    }
                }
            }
        }

        let mut catalog = Catalog::new(source);
        for decl in self.packages {
            let channels = package_channels.remove(&decl.name).unwrap_or_default();
            let default_channel_name = if decl.default_channel.is_empty() && channels.len() == 1 {
                channels[0].name.clone()
            } else {
                decl.default_channel
            };
            catalog.add_package(Package {
                name: decl.name,
                default_channel_name,
                channels,
                description: decl.description,
            });
        }
        for package in package_channels.keys() {
            errors.push(CatalogError::InvalidDocument {
                path: path.clone(),
                reason: format!("channels declared for unknown package {}", package),
            });
        }

        if let Err(e) = catalog.add_bundles(bundles.into_values().collect()) {
            match e {
                CatalogError::Aggregate { errors: inner } => errors.extend(inner),
                other => errors.push(other),
            }
        }
        CatalogError::aggregate(errors)?;
        catalog.validate()?;
        Ok(catalog)
    }
}

fn parse_json_stream(text: &str, path: &Path) -> Result<Vec<DeclDocument>> {
    let mut docs = Vec::new();
    for value in serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>() {
        let value = value.map_err(|e| CatalogError::InvalidDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        docs.push(DeclDocument::from_value(value, path)?);
    }
    Ok(docs)
}

fn parse_yaml_stream(text: &str, path: &Path) -> Result<Vec<DeclDocument>> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_json::Value::deserialize(document).map_err(|e| {
            CatalogError::InvalidDocument {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        if value.is_null() {
            continue;
        }
        docs.push(DeclDocument::from_value(value, path)?);
    }
    Ok(docs)
}

/// The head of a channel is the one entry no other entry replaces or skips
fn channel_head(channel: &DeclChannel) -> Result<String> {
    let superseded: BTreeSet<&str> = channel
        .entries
        .iter()
        .flat_map(|e| e.replaces.iter().chain(e.skips.iter()))
        .map(String::as_str)
        .collect();
    let heads: Vec<String> = channel
        .entries
        .iter()
        .filter(|e| !superseded.contains(e.name.as_str()))
        .map(|e| e.name.clone())
        .collect();
    match heads.as_slice() {
        [head] => Ok(head.clone()),
        _ => Err(CatalogError::AmbiguousChannelHead {
            package: channel.package.clone(),
            channel: channel.name.clone(),
            heads,
        }),
    }
}

fn bundle_from_decl(decl: &DeclBundle, path: &Path) -> Result<Bundle> {
    let mut version: Option<String> = None;
    let mut provided = BTreeSet::new();
    let mut required = BTreeSet::new();
    let mut required_packages = Vec::new();
    let mut csv: Option<serde_json::Value> = None;
    let mut crds = Vec::new();

    for property in &decl.properties {
        match BundleProperty::parse(property, &decl.name, path)? {
            BundleProperty::Package {
                package_name,
                version: v,
            } => {
                if package_name != decl.package {
                    return Err(CatalogError::PackageMismatch {
                        bundle: decl.name.clone(),
                        expected: decl.package.clone(),
                        found: package_name,
                    });
                }
                version = Some(v);
            }
            BundleProperty::Gvk(api) => {
                provided.insert(api);
            }
            BundleProperty::GvkRequired(api) => {
                required.insert(api);
            }
            BundleProperty::PackageRequired(req) => required_packages.push(req),
            BundleProperty::BundleObject(object) => match kind_of(&object) {
                Some(CSV_KIND) => csv = Some(object),
                Some(CRD_KIND) => crds.push(object),
                _ => {}
            },
            BundleProperty::Other(_) => {}
        }
    }

    let version_str = version.ok_or_else(|| CatalogError::MissingVersion(decl.name.clone()))?;
    let parsed = parse_lenient(&version_str).map_err(|e| CatalogError::InvalidVersion {
        bundle: decl.name.clone(),
        version: version_str.clone(),
        reason: e.to_string(),
    })?;

    let mut bundle = Bundle::new(decl.name.clone(), decl.package.clone(), parsed);
    if let Some(raw) = csv {
        let parsed_csv = ClusterServiceVersion::from_value(&raw).map_err(|e| {
            CatalogError::InvalidDocument {
                path: path.to_path_buf(),
                reason: format!("bundle {} embedded CSV: {}", decl.name, e),
            }
        })?;
        provided.extend(parsed_csv.owned_apis());
        required.extend(parsed_csv.required_apis());
        bundle.install_modes = parsed_csv.spec.install_modes.clone();
        bundle.strategy = parsed_csv.spec.install.map(|i| i.spec).unwrap_or_default();
        bundle.csv = Some(raw);
    }
    bundle.provided_apis = provided;
    bundle.required_apis = required;
    bundle.required_packages = required_packages;
    bundle.crds = crds;
    bundle.image = decl.image.clone();
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Querier;
    use std::io::Write;

    const ETCD_YAML: &str = r#"
schema: olm.package
name: etcd
defaultChannel: stable
---
schema: olm.channel
package: etcd
name: stable
entries:
  - name: etcd.v0.9.0
  - name: etcd.v0.9.2
    replaces: etcd.v0.9.0
  - name: etcd.v0.9.4
    replaces: etcd.v0.9.2
    skipRange: ">=0.9.0 <0.9.4"
---
schema: olm.bundle
name: etcd.v0.9.0
package: etcd
properties:
  - type: olm.package
    value: {packageName: etcd, version: 0.9.0}
  - type: olm.gvk
    value: {group: etcd.database.coreos.com, version: v1beta2, kind: EtcdCluster}
---
schema: olm.bundle
name: etcd.v0.9.2
package: etcd
properties:
  - type: olm.package
    value: {packageName: etcd, version: 0.9.2}
  - type: olm.gvk
    value: {group: etcd.database.coreos.com, version: v1beta2, kind: EtcdCluster}
---
schema: olm.bundle
name: etcd.v0.9.4
package: etcd
properties:
  - type: olm.package
    value: {packageName: etcd, version: 0.9.4}
  - type: olm.gvk
    value: {group: etcd.database.coreos.com, version: v1beta2, kind: EtcdCluster}
  - type: olm.package.required
    value: {packageName: vault, versionRange: ">=1.0.0"}
  - type: olm.deprecations.fake
    value: {}
---
schema: olm.deprecations
package: etcd
"#;

    #[test]
    fn yaml_stream_decodes_every_schema() {
        let cfg = DeclarativeConfig::parse(ETCD_YAML).unwrap();
        assert_eq!(cfg.packages.len(), 1);
        assert_eq!(cfg.channels.len(), 1);
        assert_eq!(cfg.bundles.len(), 3);
        assert_eq!(cfg.others.len(), 1);
        assert_eq!(cfg.others[0].schema, "olm.deprecations");
        assert_eq!(cfg.others[0].package.as_deref(), Some("etcd"));
    }

    #[test]
    fn builds_catalog_with_edges_from_channel_entries() {
        let catalog = DeclarativeConfig::parse(ETCD_YAML)
            .unwrap()
            .into_catalog(SourceKey::new("community", "olm"))
            .unwrap();
        let head = catalog.channel_head("etcd", "").unwrap();
        assert_eq!(head.name, "etcd.v0.9.4");
        assert_eq!(head.replaces.as_deref(), Some("etcd.v0.9.2"));
        assert_eq!(head.skip_range.as_ref().unwrap().as_str(), ">=0.9.0 <0.9.4");
        assert_eq!(head.required_packages.len(), 1);
        assert_eq!(head.channels.iter().collect::<Vec<_>>(), vec!["stable"]);
    }

    #[test]
    fn json_stream_and_bundle_objects() {
        let csv = serde_json::json!({
            "kind": "ClusterServiceVersion",
            "metadata": {"name": "vault.v1.0.0"},
            "spec": {
                "version": "1.0.0",
                "installModes": [{"type": "AllNamespaces", "supported": true}],
                "customresourcedefinitions": {
                    "owned": [{"name": "vaultservices.vault.security.coreos.com", "version": "v1alpha1", "kind": "VaultService"}]
                }
            }
        });
        let crd = serde_json::json!({
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "vaultservices.vault.security.coreos.com"}
        });
        let encode = |v: &serde_json::Value| {
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(v).unwrap())
        };
        let text = format!(
            r#"{{"schema": "olm.package", "name": "vault"}}
{{"schema": "olm.channel", "package": "vault", "name": "alpha", "entries": [{{"name": "vault.v1.0.0"}}]}}
{{"schema": "olm.bundle", "name": "vault.v1.0.0", "package": "vault", "image": "quay.io/vault:1.0.0",
  "properties": [
    {{"type": "olm.package", "value": {{"packageName": "vault", "version": "1.0.0"}}}},
    {{"type": "olm.bundle.object", "value": {{"data": "{}"}}}},
    {{"type": "olm.bundle.object", "value": {{"data": "{}"}}}}
  ]}}"#,
            encode(&csv),
            encode(&crd)
        );

        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("catalog.json")).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        // Files of other types are ignored
        fs::write(dir.path().join("README.md"), "not a catalog").unwrap();

        let catalog = DeclarativeConfig::load_dir(dir.path())
            .unwrap()
            .into_catalog(SourceKey::new("vault-catalog", "olm"))
            .unwrap();
        let bundle = catalog.find_csv_by_name("vault.v1.0.0").unwrap();
        // Defaulted to the only channel
        assert_eq!(catalog.package("vault").unwrap().default_channel_name, "alpha");
        assert_eq!(bundle.crds.len(), 1);
        assert!(bundle.csv.is_some());
        assert_eq!(bundle.image.as_deref(), Some("quay.io/vault:1.0.0"));
        assert!(bundle.provides(&Api::new("vault.security.coreos.com", "v1alpha1", "VaultService")));
    }

    #[test]
    fn channel_with_two_heads_is_rejected() {
        let text = r#"
schema: olm.package
name: p
defaultChannel: c
---
schema: olm.channel
package: p
name: c
entries:
  - name: p.v1
  - name: p.v2
---
schema: olm.bundle
name: p.v1
package: p
properties: [{type: olm.package, value: {packageName: p, version: 1.0.0}}]
---
schema: olm.bundle
name: p.v2
package: p
properties: [{type: olm.package, value: {packageName: p, version: 2.0.0}}]
"#;
        let err = DeclarativeConfig::parse(text)
            .unwrap()
            .into_catalog(SourceKey::new("s", "olm"))
            .unwrap_err();
        let CatalogError::Aggregate { errors } = err else {
            panic!("expected aggregate");
        };
        assert!(matches!(errors[0], CatalogError::AmbiguousChannelHead { ref heads, .. } if heads.len() == 2));
    }

    #[test]
    fn document_without_schema_is_invalid() {
        let err = DeclarativeConfig::parse("name: nothing\n").unwrap_err();
        assert!(matches!(err, CatalogError::InvalidDocument { .. }));
    }

    #[test]
    fn bundle_without_version_is_reported() {
        let text = r#"
schema: olm.package
name: p
---
schema: olm.channel
package: p
name: c
entries: [{name: p.v1}]
---
schema: olm.bundle
name: p.v1
package: p
"#;
        let err = DeclarativeConfig::parse(text)
            .unwrap()
            .into_catalog(SourceKey::new("s", "olm"))
            .unwrap_err();
        let CatalogError::Aggregate { errors } = err else {
            panic!("expected aggregate");
        };
        assert!(errors
            .iter()
            .any(|e| matches!(e, CatalogError::MissingVersion(n) if n == "p.v1")));
    }
}

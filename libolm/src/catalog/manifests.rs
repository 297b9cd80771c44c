//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Loader for the manifest-directory catalog layout.
//!
//! ```text
//! <root>/
//!   etcd/
//!     etcd.package.yaml
//!     0.9.0/
//!       etcdoperator.v0.9.0.clusterserviceversion.yaml
//!       etcdclusters.crd.yaml
//!     0.9.2/
//!       ...
//! ```
//!
//! Every package directory holds exactly one `*.package.yaml`. All other YAML
//! files below it are classified by `kind`; CRDs are attached to the CSVs in
//! the same directory that own them.

use super::csv::{kind_of, name_of, ClusterServiceVersion, CRD_KIND, CSV_KIND};
use super::{assign_channels, Bundle, Catalog, CatalogError, Channel, Package, Result, SourceKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const PACKAGE_SUFFIX: &str = ".package.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelManifest {
    pub name: String,
    #[serde(rename = "currentCSV")]
    pub current_csv: String,
}

/// The `<pkg>.package.yaml` file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub package_name: String,
    pub channels: Vec<ChannelManifest>,
    #[serde(default)]
    pub default_channel: Option<String>,
}

impl PackageManifest {
    fn into_package(self) -> Package {
        let default_channel_name = match self.default_channel {
            Some(c) if !c.is_empty() => c,
            _ if self.channels.len() == 1 => self.channels[0].name.clone(),
            _ => String::new(),
        };
        let channels = self
            .channels
            .into_iter()
            .map(|c| Channel {
                name: c.name,
                package: self.package_name.clone(),
                current_csv_name: c.current_csv,
            })
            .collect();
        Package {
            name: self.package_name,
            default_channel_name,
            channels,
            description: None,
        }
    }
}

/// Read every YAML document of a file as JSON values, skipping empty documents
pub(crate) fn read_yaml_documents(path: &Path) -> Result<Vec<serde_json::Value>> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&text) {
        let value = serde_json::Value::deserialize(document).map_err(|e| {
            CatalogError::InvalidDocument {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        if !value.is_null() {
            out.push(value);
        }
    }
    Ok(out)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Load a manifest-directory catalog rooted at `root`
pub fn load_manifests(root: &Path, source: SourceKey) -> Result<Catalog> {
    let mut packages = Vec::new();
    let mut bundles = Vec::new();
    let mut errors = Vec::new();

    let mut package_dirs: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|source| CatalogError::Io {
            path: root.to_path_buf(),
            source,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    package_dirs.sort();

    for dir in package_dirs {
        match load_package_dir(&dir) {
            Ok((package, mut found)) => {
                debug!(package = %package.name, bundles = found.len(), "loaded package directory");
                packages.push(package);
                bundles.append(&mut found);
            }
            Err(CatalogError::Aggregate { errors: inner }) => errors.extend(inner),
            Err(e) => errors.push(e),
        }
    }
    CatalogError::aggregate(errors)?;

    assign_channels(&packages, &mut bundles);
    let mut catalog = Catalog::new(source);
    for package in packages {
        catalog.add_package(package);
    }
    catalog.add_bundles(bundles)?;
    catalog.validate()?;
    info!(source = %catalog.source(), packages = catalog.packages().count(), "loaded manifest catalog");
    Ok(catalog)
}

fn load_package_dir(dir: &Path) -> Result<(Package, Vec<Bundle>)> {
    let mut manifest: Option<PackageManifest> = None;
    // directory -> (csvs, crds)
    let mut by_dir: BTreeMap<PathBuf, (Vec<serde_json::Value>, Vec<serde_json::Value>)> =
        BTreeMap::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| CatalogError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_yaml(path) {
            continue;
        }
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if file_name.ends_with(PACKAGE_SUFFIX) {
            if manifest.is_some() {
                return Err(CatalogError::InvalidDocument {
                    path: path.to_path_buf(),
                    reason: "more than one package manifest in package directory".to_string(),
                });
            }
            let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            manifest = Some(serde_yaml::from_str(&text).map_err(|e| {
                CatalogError::InvalidDocument {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?);
            continue;
        }

        let parent = path.parent().unwrap_or(dir).to_path_buf();
        for doc in read_yaml_documents(path)? {
            let slot = by_dir.entry(parent.clone()).or_default();
            match kind_of(&doc) {
                Some(CSV_KIND) => slot.0.push(doc),
                Some(CRD_KIND) => slot.1.push(doc),
                _ => debug!(path = %path.display(), "skipping manifest of unrelated kind"),
            }
        }
    }

    let manifest = manifest.ok_or_else(|| CatalogError::InvalidDocument {
        path: dir.to_path_buf(),
        reason: format!("no {} file found", PACKAGE_SUFFIX),
    })?;
    let package = manifest.into_package();

    let mut bundles = Vec::new();
    let mut errors = Vec::new();
    for (path, (csvs, crds)) in by_dir {
        for raw in csvs {
            let parsed = match ClusterServiceVersion::from_value(&raw) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(CatalogError::InvalidDocument {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let owned: Vec<&str> = parsed
                .spec
                .crds
                .owned
                .iter()
                .map(|d| d.name.as_str())
                .collect();
            let attached: Vec<serde_json::Value> = crds
                .iter()
                .filter(|crd| name_of(crd).is_some_and(|n| owned.contains(&n)))
                .cloned()
                .collect();
            match parsed.into_bundle(&package.name, raw, attached) {
                Ok(b) => bundles.push(b),
                Err(e) => errors.push(e),
            }
        }
    }
    CatalogError::aggregate(errors)?;
    Ok((package, bundles))
}

//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::CatalogConfig;
use crate::error::{OlmctlError, Result};
use clap::ValueEnum;
use libolm::catalog::declcfg::DeclarativeConfig;
use libolm::catalog::manifests::load_manifests;
use libolm::catalog::{Catalog, SourceKey};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk catalog layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CatalogFormat {
    /// Pick by looking for `*.package.yaml` files
    Auto,
    /// `<pkg>/<pkg>.package.yaml` plus versioned bundle directories
    Manifests,
    /// File-based catalog of schema-tagged documents
    Declcfg,
}

impl CatalogFormat {
    pub fn parse(s: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(s, true).map_err(|_| OlmctlError::UnknownFormat(s.to_string()))
    }
}

/// A catalog to load and register under a source name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRef {
    pub source: SourceKey,
    pub path: PathBuf,
    pub format: CatalogFormat,
}

impl CatalogRef {
    /// Parse `NAME/NAMESPACE=PATH`; the namespace defaults to `default_namespace`
    pub fn parse(s: &str, default_namespace: &str) -> Result<Self> {
        let (key, path) = s
            .split_once('=')
            .ok_or_else(|| OlmctlError::InvalidCatalogRef(s.to_string()))?;
        let (name, namespace) = match key.split_once('/') {
            Some((name, ns)) => (name, ns),
            None => (key, default_namespace),
        };
        if name.is_empty() || namespace.is_empty() || path.is_empty() {
            return Err(OlmctlError::InvalidCatalogRef(s.to_string()));
        }
        Ok(CatalogRef {
            source: SourceKey::new(name, namespace),
            path: PathBuf::from(path),
            format: CatalogFormat::Auto,
        })
    }

    pub fn from_config(cfg: &CatalogConfig, default_namespace: &str) -> Result<Self> {
        Ok(CatalogRef {
            source: SourceKey::new(
                cfg.name.clone(),
                cfg.namespace.clone().unwrap_or_else(|| default_namespace.to_string()),
            ),
            path: cfg.path.clone(),
            format: match &cfg.format {
                Some(f) => CatalogFormat::parse(f)?,
                None => CatalogFormat::Auto,
            },
        })
    }

    pub fn load(&self) -> Result<Catalog> {
        load_catalog(&self.path, self.format, self.source.clone())
    }
}

/// Whether `root` holds a package manifest one directory down
fn looks_like_manifests(root: &Path) -> bool {
    let Ok(entries) = fs::read_dir(root) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|dir| fs::read_dir(dir).ok())
        .flat_map(|files| files.filter_map(|f| f.ok()))
        .any(|f| f.file_name().to_string_lossy().ends_with(".package.yaml"))
}

pub fn load_catalog(path: &Path, format: CatalogFormat, source: SourceKey) -> Result<Catalog> {
    let format = match format {
        CatalogFormat::Auto if path.is_dir() && looks_like_manifests(path) => CatalogFormat::Manifests,
        CatalogFormat::Auto => CatalogFormat::Declcfg,
        f => f,
    };
    debug!(path = %path.display(), ?format, source = %source, "loading catalog");

    let catalog = match format {
        CatalogFormat::Manifests => load_manifests(path, source)?,
        _ if path.is_dir() => DeclarativeConfig::load_dir(path)?.into_catalog(source)?,
        _ => {
            let text = fs::read_to_string(path).map_err(|e| OlmctlError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            DeclarativeConfig::parse(&text)?.into_catalog(source)?
        }
    };
    info!(
        source = %catalog.source(),
        packages = catalog.packages().count(),
        bundles = catalog.bundles().count(),
        "loaded catalog"
    );
    Ok(catalog)
}

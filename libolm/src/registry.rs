//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! The set of catalog sources known to the cluster.
//!
//! Catalogs are stored behind `Arc` and replaced wholesale when a source is
//! updated, so a resolution pass works on a [`RegistrySnapshot`] that can not
//! change underneath it. The registry lock is only held while cloning the map
//! of pointers.

use crate::catalog::{Api, Bundle, Catalog, CatalogError, Package, Querier, Result, SourceKey};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Thread-safe registry of catalog sources
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<SourceKey, Arc<Catalog>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a catalog, atomically replacing any previous content of its source
    pub fn register(&self, catalog: Catalog) {
        let key = catalog.source().clone();
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        let replaced = sources.insert(key.clone(), Arc::new(catalog)).is_some();
        info!(source = %key, replaced, "registered catalog source");
    }

    pub fn remove(&self, key: &SourceKey) -> Option<Arc<Catalog>> {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.remove(key)
    }

    pub fn get(&self, key: &SourceKey) -> Option<Arc<Catalog>> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered source
    pub fn snapshot(&self) -> RegistrySnapshot {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        RegistrySnapshot {
            catalogs: sources.clone(),
        }
    }

    /// Sources visible from `namespace`: its own and those in `global_namespace`
    pub fn visible_from(&self, namespace: &str, global_namespace: &str) -> RegistrySnapshot {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        let catalogs: BTreeMap<SourceKey, Arc<Catalog>> = sources
            .iter()
            .filter(|(k, _)| k.namespace == namespace || k.namespace == global_namespace)
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();
        debug!(namespace, visible = catalogs.len(), "took registry snapshot");
        RegistrySnapshot { catalogs }
    }
}

/// An immutable view over a set of catalogs, ordered by source key
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    catalogs: BTreeMap<SourceKey, Arc<Catalog>>,
}

impl RegistrySnapshot {
    pub fn from_catalogs(catalogs: impl IntoIterator<Item = Catalog>) -> Self {
        RegistrySnapshot {
            catalogs: catalogs
                .into_iter()
                .map(|c| (c.source().clone(), Arc::new(c)))
                .collect(),
        }
    }

    pub fn get(&self, key: &SourceKey) -> Option<&Catalog> {
        self.catalogs.get(key).map(|c| c.as_ref())
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.catalogs.contains_key(key)
    }

    pub fn catalogs(&self) -> impl Iterator<Item = &Catalog> {
        self.catalogs.values().map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    /// Owners of `api` across all catalogs, each tagged with its source
    pub fn providers_of(&self, api: &Api) -> Vec<(&SourceKey, &Bundle)> {
        self.catalogs
            .iter()
            .flat_map(|(k, c)| c.providers_of(api).into_iter().map(move |b| (k, b)))
            .collect()
    }

    /// Bundles of `package` across all catalogs, each tagged with its source
    pub fn bundles_of(&self, package: &str) -> Vec<(&SourceKey, &Bundle)> {
        self.catalogs
            .iter()
            .filter_map(|(k, c)| c.graph(package).map(|g| (k, g)))
            .flat_map(|(k, g)| g.bundles().map(move |b| (k, b)))
            .collect()
    }
}

/// Queries over a snapshot return the first match in source order
impl Querier for RegistrySnapshot {
    fn find_csv_by_name(&self, name: &str) -> Result<Bundle> {
        for catalog in self.catalogs() {
            match catalog.find_csv_by_name(name) {
                Ok(b) => return Ok(b),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CatalogError::BundleNotFound(name.to_string()))
    }

    fn find_replacement(&self, current: &str) -> Result<Option<Bundle>> {
        for catalog in self.catalogs() {
            if let Some(b) = catalog.find_replacement(current)? {
                return Ok(Some(b));
            }
        }
        Ok(None)
    }

    fn list_services(&self) -> Result<Vec<Bundle>> {
        let mut out = Vec::new();
        for catalog in self.catalogs() {
            out.extend(catalog.list_services()?);
        }
        Ok(out)
    }

    fn list_packages(&self) -> Result<Vec<Package>> {
        let mut out = Vec::new();
        for catalog in self.catalogs() {
            out.extend(catalog.list_packages()?);
        }
        Ok(out)
    }

    fn channel_head(&self, package: &str, channel: &str) -> Result<Bundle> {
        let mut last = CatalogError::PackageNotFound(package.to_string());
        for catalog in self.catalogs() {
            match catalog.channel_head(package, channel) {
                Ok(b) => return Ok(b),
                Err(e) if e.is_not_found() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn find_providers(&self, api: &Api) -> Result<Vec<Bundle>> {
        Ok(self
            .providers_of(api)
            .into_iter()
            .map(|(_, b)| b.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Bundle;
    use semver::Version;
    use std::thread;

    fn catalog(name: &str, namespace: &str, bundle: &str) -> Catalog {
        let mut c = Catalog::new(SourceKey::new(name, namespace));
        let mut b = Bundle::new(bundle, "etcd", Version::new(1, 0, 0));
        b.provided_apis.insert(Api::new("etcd.database.coreos.com", "v1", "EtcdCluster"));
        c.add_bundle(b).unwrap();
        c
    }

    #[test]
    fn register_replaces_source_atomically() {
        let registry = SourceRegistry::new();
        registry.register(catalog("community", "olm", "etcd.v1"));
        let before = registry.snapshot();
        registry.register(catalog("community", "olm", "etcd.v2"));

        // The old snapshot still sees the old content
        assert!(before.find_csv_by_name("etcd.v1").is_ok());
        assert!(registry.snapshot().find_csv_by_name("etcd.v1").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn visibility_is_own_namespace_plus_global() {
        let registry = SourceRegistry::new();
        registry.register(catalog("global", "olm", "etcd.v1"));
        registry.register(catalog("local", "team-a", "etcd.v2"));
        registry.register(catalog("other", "team-b", "etcd.v3"));

        let snap = registry.visible_from("team-a", "olm");
        assert_eq!(snap.len(), 2);
        assert!(snap.contains(&SourceKey::new("local", "team-a")));
        assert!(!snap.contains(&SourceKey::new("other", "team-b")));

        let api = Api::new("etcd.database.coreos.com", "v1", "EtcdCluster");
        let names: Vec<&str> = snap.providers_of(&api).iter().map(|(_, b)| b.name.as_str()).collect();
        // Snapshot iterates in source key order
        assert_eq!(names, vec!["etcd.v1", "etcd.v2"]);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let registry = Arc::new(SourceRegistry::new());
        registry.register(catalog("community", "olm", "etcd.v1"));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    if i == 0 {
                        registry.register(catalog("community", "olm", "etcd.v2"));
                    }
                    let snap = registry.snapshot();
                    snap.list_services().unwrap().len()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
    }
}

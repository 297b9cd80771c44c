//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{Api, Bundle, Catalog, CatalogError, Package, Result};

/// Read-only queries the resolver issues against a catalog.
///
/// Results are owned copies so callers never hold borrows into a catalog that
/// may be swapped out underneath them.
pub trait Querier {
    /// Find a bundle by its CSV name
    fn find_csv_by_name(&self, name: &str) -> Result<Bundle>;

    /// Find the bundle whose `replaces` names `current`, if any
    fn find_replacement(&self, current: &str) -> Result<Option<Bundle>>;

    /// Every bundle in the catalog
    fn list_services(&self) -> Result<Vec<Bundle>>;

    /// Every package in the catalog
    fn list_packages(&self) -> Result<Vec<Package>>;

    /// The head bundle of a channel; an empty channel selects the default
    fn channel_head(&self, package: &str, channel: &str) -> Result<Bundle>;

    /// Bundles that own an API, by package then newest version
    fn find_providers(&self, api: &Api) -> Result<Vec<Bundle>>;
}

impl Querier for Catalog {
    fn find_csv_by_name(&self, name: &str) -> Result<Bundle> {
        self.graphs
            .values()
            .find_map(|g| g.get(name))
            .cloned()
            .ok_or_else(|| CatalogError::BundleNotFound(name.to_string()))
    }

    fn find_replacement(&self, current: &str) -> Result<Option<Bundle>> {
        Ok(self
            .graphs
            .values()
            .find_map(|g| g.replacements_of(current).next())
            .cloned())
    }

    fn list_services(&self) -> Result<Vec<Bundle>> {
        Ok(self.bundles().cloned().collect())
    }

    fn list_packages(&self) -> Result<Vec<Package>> {
        Ok(self.packages().cloned().collect())
    }

    fn channel_head(&self, package: &str, channel: &str) -> Result<Bundle> {
        let ch = self.channel(package, channel)?;
        self.graph(package)
            .and_then(|g| g.get(&ch.current_csv_name))
            .cloned()
            .ok_or_else(|| CatalogError::BundleNotFound(ch.current_csv_name.clone()))
    }

    fn find_providers(&self, api: &Api) -> Result<Vec<Bundle>> {
        Ok(self.providers_of(api).into_iter().cloned().collect())
    }
}

//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Per-package upgrade graphs and the replaces-graph loader that guards them.
//!
//! A [`PackageGraph`] holds every bundle of one package together with the
//! reverse `replaces` index used to walk forward along upgrade chains. Bundles
//! only enter a graph through [`ReplacesGraphLoader`], which refuses a bundle
//! whose `replaces` target is not already present. Ordered insertion therefore
//! keeps the graph free of dangling edges and cycles; the traversals below
//! still carry a visited set so data mutated after loading cannot hang them.

use super::{Bundle, CatalogError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// All bundles of a single package, indexed by name and by replaces edge
#[derive(Debug, Clone, Default)]
pub struct PackageGraph {
    package: String,
    bundles: BTreeMap<String, Bundle>,
    /// replaces target -> names of the bundles that replace it
    replaced_by: BTreeMap<String, BTreeSet<String>>,
}

impl PackageGraph {
    /// Create an empty graph for the named package
    pub fn new(package: impl Into<String>) -> Self {
        PackageGraph {
            package: package.into(),
            bundles: BTreeMap::new(),
            replaced_by: BTreeMap::new(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bundles.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Bundles in name order
    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }

    /// Bundles whose `replaces` names the given bundle, in name order
    pub fn replacements_of<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Bundle> + 'a {
        self.replaced_by
            .get(name)
            .into_iter()
            .flat_map(|names| names.iter())
            .filter_map(move |n| self.bundles.get(n))
    }

    fn insert(&mut self, bundle: Bundle) {
        if let Some(replaces) = &bundle.replaces {
            self.replaced_by
                .entry(replaces.clone())
                .or_default()
                .insert(bundle.name.clone());
        }
        self.bundles.insert(bundle.name.clone(), bundle);
    }

    /// Walk `replaces` edges starting at `head`, returning the chain head first.
    ///
    /// The walk stops at a root bundle or at a `replaces` target that is not part
    /// of the graph. A bundle seen twice means the graph was corrupted after
    /// loading and is reported as a cycle.
    pub fn chain_from(&self, head: &str) -> Result<Vec<&Bundle>> {
        let first = self
            .bundles
            .get(head)
            .ok_or_else(|| CatalogError::BundleNotFound(head.to_string()))?;

        let mut chain = vec![first];
        let mut seen = BTreeSet::new();
        seen.insert(first.name.as_str());
        let mut next = first.replaces.as_deref();
        while let Some(name) = next {
            let Some(bundle) = self.bundles.get(name) else {
                trace!(package = %self.package, bundle = name, "replaces chain leaves the graph");
                break;
            };
            if !seen.insert(bundle.name.as_str()) {
                return Err(CatalogError::ReplacesCycle {
                    package: self.package.clone(),
                    bundle: bundle.name.clone(),
                });
            }
            chain.push(bundle);
            next = bundle.replaces.as_deref();
        }
        Ok(chain)
    }
}

/// Gatekeeper for bundle insertion: predecessors must be present before their
/// successors are added.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplacesGraphLoader;

impl ReplacesGraphLoader {
    /// Report whether `bundle` may be added to `graph`.
    ///
    /// Returns `Ok(true)` for new roots and for bundles whose predecessor is
    /// already present, `Ok(false)` if the bundle is already in the graph, and
    /// an error naming both the bundle and its missing predecessor otherwise.
    pub fn can_add(&self, bundle: &Bundle, graph: &PackageGraph) -> Result<bool> {
        if bundle.package != graph.package {
            return Err(CatalogError::PackageMismatch {
                bundle: bundle.name.clone(),
                expected: graph.package.clone(),
                found: bundle.package.clone(),
            });
        }
        if graph.contains(&bundle.name) {
            return Ok(false);
        }
        match &bundle.replaces {
            None => Ok(true),
            Some(replaces) if graph.contains(replaces) => Ok(true),
            Some(replaces) => Err(CatalogError::MissingReplacement {
                package: graph.package.clone(),
                bundle: bundle.name.clone(),
                replaces: replaces.clone(),
            }),
        }
    }

    /// Add a single bundle, enforcing [`can_add`](Self::can_add)
    pub fn add(&self, bundle: Bundle, graph: &mut PackageGraph) -> Result<()> {
        if !self.can_add(&bundle, graph)? {
            return Err(CatalogError::DuplicateBundle {
                package: graph.package.clone(),
                bundle: bundle.name,
            });
        }
        debug!(package = %graph.package, bundle = %bundle.name, "adding bundle to graph");
        graph.insert(bundle);
        Ok(())
    }

    /// Add a batch of bundles in predecessor-first order.
    ///
    /// Bundles are retried in passes until a pass adds nothing; whatever is
    /// left has a predecessor that never appears and is reported together with
    /// any other insertion failures.
    pub fn load(&self, bundles: Vec<Bundle>, graph: &mut PackageGraph) -> Result<()> {
        let mut pending = bundles;
        pending.sort_by(|a, b| a.name.cmp(&b.name));
        let mut errors = Vec::new();

        loop {
            let before = pending.len();
            let mut deferred = Vec::new();
            for bundle in pending.drain(..) {
                match self.can_add(&bundle, graph) {
                    Ok(true) => graph.insert(bundle),
                    Ok(false) => errors.push(CatalogError::DuplicateBundle {
                        package: graph.package.clone(),
                        bundle: bundle.name,
                    }),
                    Err(CatalogError::MissingReplacement { .. }) => deferred.push(bundle),
                    Err(e) => errors.push(e),
                }
            }
            pending = deferred;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        for bundle in pending {
            if let Some(replaces) = bundle.replaces {
                errors.push(CatalogError::MissingReplacement {
                    package: graph.package.clone(),
                    bundle: bundle.name,
                    replaces,
                });
            }
        }
        CatalogError::aggregate(errors)
    }
}

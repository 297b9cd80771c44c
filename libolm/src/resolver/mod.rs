//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of the subscriptions of one namespace.
//!
//! A pass works in four stages:
//! - **seed**: every subscription picks a target bundle. A fresh install takes
//!   the channel head (or its pinned `startingCSV`). An existing install takes
//!   the upgrade closest to the head that can replace it, or stays put.
//! - **closure**: required APIs and packages of every candidate are looked up
//!   in the visible catalogs, adding providers to the candidate set until
//!   nothing new turns up. Installed operators without a subscription are kept
//!   as fixed providers.
//! - **solve**: candidates, requirements and API ownership conflicts become a
//!   [`solver::Problem`](crate::solver::Problem) handed to the configured
//!   [`Satisfier`](crate::solver::Satisfier).
//! - **order**: the selected bundles are ordered dependencies first.
//!
//! Identical inputs always produce identical output: catalogs are walked in
//! source key order and every candidate list is sorted before it is used.

pub mod scope;
mod upgrade;

pub use upgrade::next_upgrade;

use crate::catalog::{Api, Bundle, Catalog, CatalogError, SourceKey};
use crate::cluster::{ClusterState, FailureReason, InstalledOperator, Subscription};
use crate::config::ResolverConfig;
use crate::registry::{RegistrySnapshot, SourceRegistry};
use crate::solver::{satisfier_for, Problem, SolverError, VarId};
use crate::version::VersionRange;
use miette::Diagnostic;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a namespace could not be resolved
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("{detail}")]
    #[diagnostic(
        code(olm::resolution_error::not_found),
        help("Check the subscription's package, channel and catalog source")
    )]
    NotFound {
        subscription: Option<String>,
        detail: String,
    },

    #[error("api {api} is provided by more than one operator: {}", providers.join(", "))]
    #[diagnostic(
        code(olm::resolution_error::ambiguous_api),
        help("Only one installed operator may own an API; remove one of the providers from the catalog or the cluster")
    )]
    AmbiguousApi {
        subscription: Option<String>,
        api: Api,
        providers: Vec<String>,
    },

    #[error("constraints not satisfiable: {}", reasons.join("; "))]
    #[diagnostic(code(olm::resolution_error::constraints_not_satisfiable))]
    ConstraintsNotSatisfiable { reasons: Vec<String> },

    #[error("{reason}")]
    #[diagnostic(
        code(olm::resolution_error::forbidden),
        help("Check the namespace's OperatorGroup and the install modes the bundle supports")
    )]
    Forbidden {
        subscription: Option<String>,
        reason: String,
    },
}

impl ResolutionError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ResolutionError::NotFound { .. } => FailureReason::NotFound,
            ResolutionError::AmbiguousApi { .. } => FailureReason::AmbiguousApi,
            ResolutionError::ConstraintsNotSatisfiable { .. } => {
                FailureReason::ConstraintsNotSatisfiable
            }
            ResolutionError::Forbidden { .. } => FailureReason::Forbidden,
        }
    }

    /// The subscription the failure is attributed to, if a single one is
    pub fn subscription(&self) -> Option<&str> {
        match self {
            ResolutionError::NotFound { subscription, .. }
            | ResolutionError::AmbiguousApi { subscription, .. }
            | ResolutionError::Forbidden { subscription, .. } => subscription.as_deref(),
            ResolutionError::ConstraintsNotSatisfiable { .. } => None,
        }
    }

    fn not_found(subscription: &Subscription, e: CatalogError) -> Self {
        ResolutionError::NotFound {
            subscription: Some(subscription.name.clone()),
            detail: format!("subscription {}: {}", subscription.name, e),
        }
    }
}

impl From<SolverError> for ResolutionError {
    fn from(e: SolverError) -> Self {
        match e {
            SolverError::Unsatisfiable { reasons } => {
                ResolutionError::ConstraintsNotSatisfiable { reasons }
            }
            other => ResolutionError::ConstraintsNotSatisfiable {
                reasons: vec![other.to_string()],
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolutionError>;

/// Why a bundle is part of a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The target of a subscription
    Subscribed { subscription: String },
    /// Pulled in to satisfy another bundle, from the given channel
    Dependency { channel: String },
}

/// A bundle chosen for installation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBundle {
    pub bundle: Bundle,
    pub source: SourceKey,
    pub selection: Selection,
    /// Installed CSV this bundle upgrades
    pub replaces: Option<String>,
}

/// What a single subscription resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// Installed and nothing newer applies
    UpToDate { csv: String },
    /// `csv` is to be installed, replacing `replaces` if set
    Install {
        csv: String,
        replaces: Option<String>,
    },
}

impl SubscriptionOutcome {
    pub fn csv(&self) -> &str {
        match self {
            SubscriptionOutcome::UpToDate { csv } | SubscriptionOutcome::Install { csv, .. } => csv,
        }
    }
}

/// Result of resolving one namespace
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceResolution {
    pub namespace: String,
    /// Bundles to install, dependencies before their dependents
    pub bundles: Vec<ResolvedBundle>,
    pub outcomes: BTreeMap<String, SubscriptionOutcome>,
}

impl NamespaceResolution {
    pub fn is_noop(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn csv_names(&self) -> Vec<String> {
        self.bundles.iter().map(|b| b.bundle.name.clone()).collect()
    }
}

/// Where a problem variable came from
#[derive(Debug, Clone)]
enum Origin {
    /// A bundle from a visible catalog
    Catalog { source: SourceKey, channel: String },
    /// An installed operator that is kept as it is
    Installed,
}

#[derive(Debug, Clone)]
struct Candidate {
    bundle: Bundle,
    origin: Origin,
}

/// The seed chosen for one subscription
#[derive(Debug, Clone)]
struct Seed {
    subscription: String,
    var: VarId,
    replaces: Option<String>,
    up_to_date: bool,
}

/// Resolves subscriptions against the catalogs of a [`SourceRegistry`]
pub struct Resolver<'a> {
    config: &'a ResolverConfig,
    registry: &'a SourceRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a ResolverConfig, registry: &'a SourceRegistry) -> Self {
        Resolver { config, registry }
    }

    /// Resolve every subscription of `namespace` against the cluster state
    pub fn resolve_namespace(
        &self,
        state: &ClusterState,
        namespace: &str,
    ) -> Result<NamespaceResolution> {
        let mut subscriptions: Vec<&Subscription> = state.subscriptions_in(namespace).collect();
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name));
        if subscriptions.is_empty() {
            return Ok(NamespaceResolution {
                namespace: namespace.to_string(),
                ..Default::default()
            });
        }

        let group = scope::operator_group_for(state, namespace)?;
        let snapshot = self
            .registry
            .visible_from(namespace, &self.config.global_catalog_namespace);
        let installed: Vec<&InstalledOperator> = state.installed_in(namespace).collect();

        let mut pass = Pass::new(&snapshot);
        let mut seeds = Vec::new();
        let subscribed: BTreeSet<&str> = subscriptions
            .iter()
            .map(|s| s.spec.package.as_str())
            .collect();

        for sub in &subscriptions {
            let seed = self.seed(&mut pass, sub, &installed)?;
            if !seed.up_to_date {
                let bundle = &pass.candidates[seed.var].bundle;
                scope::check_install_mode(bundle, group, Some(&sub.name))?;
            }
            pass.problem
                .mandatory(vec![seed.var], format!("subscription {}", sub.name));
            seeds.push(seed);
        }

        for op in &installed {
            if subscribed.contains(op.package()) {
                continue;
            }
            let var = pass.add(op.bundle.clone(), Origin::Installed);
            pass.problem
                .mandatory(vec![var], format!("installed operator {}", op.name()));
        }

        pass.check_fixed_ownership(&seeds)?;
        pass.close(group)?;

        let satisfier = satisfier_for(self.config);
        debug!(
            namespace,
            solver = satisfier.name(),
            variables = pass.problem.variables().len(),
            requirements = pass.problem.requirements().len(),
            "solving"
        );
        let assignment = satisfier.satisfy(&pass.problem)?;

        let seeded: BTreeMap<VarId, &Seed> = seeds.iter().map(|s| (s.var, s)).collect();
        let mut resolution = NamespaceResolution {
            namespace: namespace.to_string(),
            ..Default::default()
        };
        for seed in &seeds {
            let csv = pass.candidates[seed.var].bundle.name.clone();
            let outcome = if seed.up_to_date {
                SubscriptionOutcome::UpToDate { csv }
            } else {
                SubscriptionOutcome::Install {
                    csv,
                    replaces: seed.replaces.clone(),
                }
            };
            resolution.outcomes.insert(seed.subscription.clone(), outcome);
        }

        for var in pass.install_order(&assignment.selected().copied().collect()) {
            let candidate = &pass.candidates[var];
            let Origin::Catalog { source, channel } = &candidate.origin else {
                continue;
            };
            let (selection, replaces) = match seeded.get(&var) {
                Some(seed) if seed.up_to_date => continue,
                Some(seed) => (
                    Selection::Subscribed {
                        subscription: seed.subscription.clone(),
                    },
                    seed.replaces.clone(),
                ),
                None => (
                    Selection::Dependency {
                        channel: channel.clone(),
                    },
                    None,
                ),
            };
            resolution.bundles.push(ResolvedBundle {
                bundle: candidate.bundle.clone(),
                source: source.clone(),
                selection,
                replaces,
            });
        }
        info!(
            namespace,
            install = resolution.bundles.len(),
            subscriptions = resolution.outcomes.len(),
            "resolved namespace"
        );
        Ok(resolution)
    }

    fn seed(
        &self,
        pass: &mut Pass<'_>,
        sub: &Subscription,
        installed: &[&InstalledOperator],
    ) -> Result<Seed> {
        let spec = &sub.spec;
        let key = spec.source_key();
        let catalog = pass.snapshot.get(&key).ok_or_else(|| ResolutionError::NotFound {
            subscription: Some(sub.name.clone()),
            detail: format!(
                "subscription {}: catalog source {} not found or not visible from namespace {}",
                sub.name, key, sub.namespace
            ),
        })?;
        let channel = catalog
            .channel(&spec.package, &spec.channel)
            .map_err(|e| ResolutionError::not_found(sub, e))?
            .name
            .clone();

        let current = sub
            .status
            .installed_csv
            .as_deref()
            .and_then(|name| installed.iter().find(|o| o.name() == name))
            .or_else(|| installed.iter().find(|o| o.package() == spec.package));

        let origin = Origin::Catalog {
            source: key.clone(),
            channel: channel.clone(),
        };
        let seed = match current {
            Some(op) => match next_upgrade(catalog, &spec.package, &channel, &op.bundle)
                .map_err(|e| ResolutionError::not_found(sub, e))?
            {
                Some(next) => {
                    debug!(subscription = %sub.name, from = %op.name(), to = %next.name, "upgrade available");
                    Seed {
                        subscription: sub.name.clone(),
                        var: pass.add(next.clone(), origin),
                        replaces: Some(op.name().to_string()),
                        up_to_date: false,
                    }
                }
                None => Seed {
                    subscription: sub.name.clone(),
                    var: pass.add(op.bundle.clone(), Origin::Installed),
                    replaces: None,
                    up_to_date: true,
                },
            },
            None => {
                let target = match &spec.starting_csv {
                    Some(start) => catalog
                        .graph(&spec.package)
                        .and_then(|g| g.get(start))
                        .ok_or_else(|| {
                            ResolutionError::not_found(
                                sub,
                                CatalogError::BundleNotFound(start.clone()),
                            )
                        })?,
                    None => {
                        let head = &catalog
                            .channel(&spec.package, &channel)
                            .map_err(|e| ResolutionError::not_found(sub, e))?
                            .current_csv_name;
                        catalog
                            .graph(&spec.package)
                            .and_then(|g| g.get(head))
                            .ok_or_else(|| {
                                ResolutionError::not_found(
                                    sub,
                                    CatalogError::BundleNotFound(head.clone()),
                                )
                            })?
                    }
                };
                Seed {
                    subscription: sub.name.clone(),
                    var: pass.add(target.clone(), origin),
                    replaces: None,
                    up_to_date: false,
                }
            }
        };
        Ok(seed)
    }
}

/// Working state of one resolution pass
struct Pass<'s> {
    snapshot: &'s RegistrySnapshot,
    problem: Problem,
    candidates: Vec<Candidate>,
    index: BTreeMap<(Option<SourceKey>, String), VarId>,
    /// var -> vars it may depend on, for ordering
    edges: BTreeMap<VarId, BTreeSet<VarId>>,
}

impl<'s> Pass<'s> {
    fn new(snapshot: &'s RegistrySnapshot) -> Self {
        Pass {
            snapshot,
            problem: Problem::new(),
            candidates: Vec::new(),
            index: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    fn add(&mut self, bundle: Bundle, origin: Origin) -> VarId {
        let source = match &origin {
            Origin::Catalog { source, .. } => Some(source.clone()),
            Origin::Installed => None,
        };
        let key = (source, bundle.name.clone());
        if let Some(&var) = self.index.get(&key) {
            return var;
        }
        let var = self
            .problem
            .add_variable(bundle.name.clone(), bundle.package.clone());
        self.index.insert(key, var);
        self.candidates.push(Candidate { bundle, origin });
        var
    }

    fn source_of(&self, var: VarId) -> Option<&SourceKey> {
        match &self.candidates[var].origin {
            Origin::Catalog { source, .. } => Some(source),
            Origin::Installed => None,
        }
    }

    /// Seeds and fixed installs may not share an owned API
    fn check_fixed_ownership(&self, seeds: &[Seed]) -> Result<()> {
        let mut owners: BTreeMap<&Api, Vec<VarId>> = BTreeMap::new();
        for (var, candidate) in self.candidates.iter().enumerate() {
            for api in &candidate.bundle.provided_apis {
                owners.entry(api).or_default().push(var);
            }
        }
        for (api, vars) in owners {
            let packages: BTreeSet<&str> = vars
                .iter()
                .map(|&v| self.candidates[v].bundle.package.as_str())
                .collect();
            if packages.len() < 2 {
                continue;
            }
            let subscription = seeds
                .iter()
                .find(|s| vars.contains(&s.var))
                .map(|s| s.subscription.clone());
            let mut providers: Vec<String> = vars
                .iter()
                .map(|&v| self.candidates[v].bundle.name.clone())
                .collect();
            providers.sort();
            warn!(api = %api, providers = ?providers, "api has more than one owner");
            return Err(ResolutionError::AmbiguousApi {
                subscription,
                api: api.clone(),
                providers,
            });
        }
        Ok(())
    }

    /// Catalog bundles ordered by preference for a requirement of `requester`
    fn rank(&self, requester: VarId, mut found: Vec<(&'s SourceKey, &'s Bundle)>) -> Vec<(&'s SourceKey, &'s Bundle)> {
        let home = self.source_of(requester).cloned();
        found.sort_by(|(ka, a), (kb, b)| {
            let away_a = Some(*ka) != home.as_ref();
            let away_b = Some(*kb) != home.as_ref();
            (away_a, &a.package, Reverse(&a.version), &a.name, *ka)
                .cmp(&(away_b, &b.package, Reverse(&b.version), &b.name, *kb))
        });
        found
    }

    /// The channel a dependency is tracked in: the default if it is a member
    /// or if the bundle carries no membership at all
    fn channel_for(&self, source: &SourceKey, bundle: &Bundle) -> Option<String> {
        let catalog: &Catalog = self.snapshot.get(source)?;
        let package = catalog.package(&bundle.package)?;
        if bundle.channels.is_empty() || bundle.channels.contains(&package.default_channel_name) {
            return Some(package.default_channel_name.clone());
        }
        bundle.channels.iter().next().cloned()
    }

    /// Vars already in the problem satisfying `pred`, in var order
    fn existing(&self, pred: impl Fn(&Bundle) -> bool) -> Vec<VarId> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| pred(&c.bundle))
            .map(|(v, _)| v)
            .collect()
    }

    fn catalog_candidates(
        &mut self,
        requester: VarId,
        found: Vec<(&'s SourceKey, &'s Bundle)>,
        group: &crate::cluster::OperatorGroup,
        filtered: &mut usize,
    ) -> Vec<VarId> {
        let mut vars = Vec::new();
        for (source, bundle) in self.rank(requester, found) {
            let Some(channel) = self.channel_for(source, bundle) else {
                continue;
            };
            if !bundle.supports(group.install_mode()) {
                *filtered += 1;
                continue;
            }
            let var = self.add(
                bundle.clone(),
                Origin::Catalog {
                    source: source.clone(),
                    channel,
                },
            );
            vars.push(var);
        }
        vars
    }

    /// Expand requirements breadth first until no new candidates appear
    fn close(&mut self, group: &crate::cluster::OperatorGroup) -> Result<()> {
        let snapshot = self.snapshot;
        let mut queue: VecDeque<VarId> = (0..self.candidates.len()).collect();
        let mut expanded = BTreeSet::new();

        while let Some(var) = queue.pop_front() {
            if !expanded.insert(var) {
                continue;
            }
            let bundle = self.candidates[var].bundle.clone();
            let before = self.candidates.len();

            for api in &bundle.required_apis {
                let mut filtered = 0;
                let mut vars = self.existing(|b| b.provides(api));
                let found = snapshot.providers_of(api);
                for v in self.catalog_candidates(var, found, group, &mut filtered) {
                    if !vars.contains(&v) {
                        vars.push(v);
                    }
                }
                let mut description = format!("{} requires api {}", bundle.name, api);
                if vars.is_empty() && filtered > 0 {
                    description.push_str(&format!(
                        " (no provider supports install mode {})",
                        group.install_mode()
                    ));
                }
                self.edges.entry(var).or_default().extend(vars.iter().copied());
                self.problem.require(var, vars, description);
            }

            for req in &bundle.required_packages {
                let mut filtered = 0;
                let range: &VersionRange = &req.version_range;
                let matches = |b: &Bundle| b.package == req.package_name && range.matches(&b.version);
                let mut vars = self.existing(matches);
                let found: Vec<(&SourceKey, &Bundle)> = snapshot
                    .bundles_of(&req.package_name)
                    .into_iter()
                    .filter(|(_, b)| range.matches(&b.version))
                    .collect();
                for v in self.catalog_candidates(var, found, group, &mut filtered) {
                    if !vars.contains(&v) {
                        vars.push(v);
                    }
                }
                self.edges.entry(var).or_default().extend(vars.iter().copied());
                self.problem
                    .require(var, vars, format!("{} requires {}", bundle.name, req));
            }

            queue.extend(before..self.candidates.len());
        }

        // Owners of the same API from different packages exclude each other
        let mut owners: BTreeMap<Api, Vec<VarId>> = BTreeMap::new();
        for (var, candidate) in self.candidates.iter().enumerate() {
            for api in &candidate.bundle.provided_apis {
                owners.entry(api.clone()).or_default().push(var);
            }
        }
        for (api, vars) in owners {
            let packages: BTreeSet<&str> = vars
                .iter()
                .map(|&v| self.candidates[v].bundle.package.as_str())
                .collect();
            if packages.len() > 1 {
                let description = format!(
                    "api {} is provided by {}",
                    api,
                    packages.into_iter().collect::<Vec<_>>().join(" and ")
                );
                self.problem.at_most_one(vars, description);
            }
        }
        Ok(())
    }

    /// Selected vars with dependencies ahead of dependents.
    ///
    /// A depth-first post-order from each selected var in var order; vars
    /// already on the stack are skipped so dependency cycles terminate.
    fn install_order(&self, selected: &BTreeSet<VarId>) -> Vec<VarId> {
        fn visit(
            var: VarId,
            pass: &Pass<'_>,
            selected: &BTreeSet<VarId>,
            done: &mut BTreeSet<VarId>,
            out: &mut Vec<VarId>,
        ) {
            if !done.insert(var) {
                return;
            }
            if let Some(deps) = pass.edges.get(&var) {
                for &dep in deps {
                    if selected.contains(&dep) {
                        visit(dep, pass, selected, done, out);
                    }
                }
            }
            out.push(var);
        }

        let mut done = BTreeSet::new();
        let mut out = Vec::new();
        for &var in selected {
            visit(var, self, selected, &mut done, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests;

//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! The per-namespace sync loop body.
//!
//! [`Operator::sync_namespace`] resolves a namespace, writes the outcome back
//! into the Subscription statuses and makes sure an InstallPlan exists for any
//! pending install. [`Operator::sync_install_plans`] drives those plans
//! through a [`StepExecutor`] and records completed installs. Both operate on
//! a [`ClusterState`] snapshot that the caller persists.

use crate::catalog::Querier;
use crate::cluster::{
    remove_condition, set_condition, ApprovalMode, ClusterState, Condition, ConditionStatus,
    FailureReason, InstalledOperator, SubscriptionState, SubscriptionStatus,
};
use crate::config::ResolverConfig;
use crate::plan::execute::{check_crd, mark_failed};
use crate::plan::{self, ExecutionOutcome, InstallPlanPhase, PlanError, StepExecutor};
use crate::registry::SourceRegistry;
use crate::resolver::{NamespaceResolution, ResolutionError, Resolver, SubscriptionOutcome};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub const CONDITION_RESOLUTION_FAILED: &str = "ResolutionFailed";

/// Result of one namespace sync
#[derive(Debug)]
pub enum SyncOutcome {
    /// Every subscription is at its latest known CSV
    UpToDate,
    /// A new InstallPlan was added to the cluster state
    PlanCreated { name: String },
    /// An InstallPlan for the same CSVs already exists and was kept
    PlanInFlight { name: String },
    /// Resolution failed; the subscriptions carry the reason
    ResolutionFailed(ResolutionError),
    /// The resolution could not be rendered into steps
    PlanFailed(PlanError),
}

/// Drives resolution and installation for the namespaces of a cluster
pub struct Operator<'a> {
    config: &'a ResolverConfig,
    registry: &'a SourceRegistry,
}

impl<'a> Operator<'a> {
    pub fn new(config: &'a ResolverConfig, registry: &'a SourceRegistry) -> Self {
        Operator { config, registry }
    }

    /// Resolve `namespace` and bring subscription statuses and plans in line
    pub fn sync_namespace(
        &self,
        state: &mut ClusterState,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> SyncOutcome {
        let resolution = Resolver::new(self.config, self.registry).resolve_namespace(state, namespace);
        let resolution = match resolution {
            Ok(r) => r,
            Err(e) => {
                warn!(namespace, reason = %e.reason(), error = %e, "resolution failed");
                record_failure(state, namespace, &e, now);
                return SyncOutcome::ResolutionFailed(e);
            }
        };

        let plan_ref = if resolution.is_noop() {
            None
        } else {
            Some(plan::plan_name(namespace, &resolution.csv_names()))
        };
        record_resolution(state, &resolution, plan_ref.as_deref(), now);

        let Some(name) = plan_ref else {
            debug!(namespace, "all subscriptions up to date");
            return SyncOutcome::UpToDate;
        };
        if let Some(existing) = state.install_plan(namespace, &name) {
            if existing.installs(&resolution.csv_names())
                && existing.status.failure_reason() != Some(FailureReason::Superseded)
            {
                debug!(namespace, plan = %name, phase = %existing.phase(), "reusing install plan");
                return SyncOutcome::PlanInFlight { name };
            }
        }

        let approval = approval_for(state, &resolution);
        let mut plan = match plan::generate(&resolution, approval) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(namespace, error = %e, "failed to render install plan");
                return SyncOutcome::PlanFailed(e);
            }
        };
        info!(namespace, plan = %plan.name, steps = plan.steps.len(), %approval, "created install plan");

        let narrowing = plan
            .steps
            .iter()
            .filter(|s| s.is_crd())
            .find_map(|s| check_crd(s, state.crds.get(&s.resource.name)).err());
        if let Some(e) = narrowing {
            mark_failed(&mut plan, &e, &self.config.backoff, now);
        }

        state
            .install_plans
            .retain(|p| !(p.namespace == namespace && p.name == name));
        for old in state
            .install_plans
            .iter_mut()
            .filter(|p| p.namespace == namespace && !p.is_terminal())
        {
            info!(namespace, plan = %old.name, by = %name, "superseding install plan");
            old.supersede(&name, now);
        }
        state.install_plans.push(plan);
        SyncOutcome::PlanCreated { name }
    }

    /// Execute every unfinished plan a subscription still points at; installs
    /// of completed plans are recorded as installed operators, replacing the
    /// CSVs they upgrade
    pub fn sync_install_plans<E: StepExecutor + ?Sized>(
        &self,
        state: &mut ClusterState,
        executor: &mut E,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, ExecutionOutcome> {
        let mut outcomes = BTreeMap::new();
        let mut completed = Vec::new();
        let referenced: BTreeSet<(&str, &str)> = state
            .subscriptions
            .iter()
            .filter_map(|s| {
                s.status
                    .install_plan_ref
                    .as_deref()
                    .map(|name| (s.namespace.as_str(), name))
            })
            .collect();
        for plan in state.install_plans.iter_mut() {
            if plan.is_terminal() {
                continue;
            }
            if !referenced.contains(&(plan.namespace.as_str(), plan.name.as_str())) {
                debug!(plan = %plan.name, namespace = %plan.namespace, "skipping unreferenced install plan");
                continue;
            }
            let outcome = plan::execute(plan, &mut *executor, &self.config.backoff, now);
            if outcome == ExecutionOutcome::Complete && plan.phase() == InstallPlanPhase::Complete {
                completed.push(plan.clone());
            }
            outcomes.insert(format!("{}/{}", plan.namespace, plan.name), outcome);
        }
        for plan in completed {
            self.record_installed(state, &plan);
        }
        outcomes
    }

    fn record_installed(&self, state: &mut ClusterState, plan: &plan::InstallPlan) {
        let snapshot = self.registry.snapshot();
        for csv in &plan.spec.cluster_service_version_names {
            let Some((_, step)) = plan.step(crate::catalog::csv::CSV_KIND, csv) else {
                continue;
            };
            let source = step.source();
            let bundle = match snapshot.get(&source).map(|c| c.find_csv_by_name(csv)) {
                Some(Ok(b)) => b,
                _ => {
                    warn!(csv = %csv, source = %source, "installed CSV no longer in its catalog");
                    continue;
                }
            };
            state
                .installed
                .retain(|o| !(o.namespace == plan.namespace && o.package() == bundle.package));
            info!(namespace = %plan.namespace, csv = %csv, "recorded installed operator");
            let mut op = InstalledOperator::new(plan.namespace.clone(), bundle);
            op.source = Some(source);
            state.installed.push(op);
        }
    }
}

/// Manual if any subscription whose CSV is in the plan asks for it
fn approval_for(state: &ClusterState, resolution: &NamespaceResolution) -> ApprovalMode {
    let manual = state
        .subscriptions_in(&resolution.namespace)
        .filter(|s| s.spec.install_plan_approval == ApprovalMode::Manual)
        .any(|s| {
            matches!(
                resolution.outcomes.get(&s.name),
                Some(SubscriptionOutcome::Install { .. })
            )
        });
    if manual {
        ApprovalMode::Manual
    } else {
        ApprovalMode::Automatic
    }
}

/// Apply `update` and bump `last_updated` only if the status changed
fn update_status(status: &mut SubscriptionStatus, now: DateTime<Utc>, update: impl FnOnce(&mut SubscriptionStatus)) {
    let before = status.clone();
    update(status);
    if *status != before {
        status.last_updated = Some(now);
    }
}

fn record_failure(state: &mut ClusterState, namespace: &str, error: &ResolutionError, now: DateTime<Utc>) {
    let blocker = error.subscription().map(str::to_string);
    for sub in state.subscriptions.iter_mut().filter(|s| s.namespace == namespace) {
        let (failed, message) = match &blocker {
            Some(name) if *name == sub.name => (true, error.to_string()),
            Some(name) => (
                false,
                format!("blocked by subscription {}: {}", name, error),
            ),
            None => (true, error.to_string()),
        };
        let condition = Condition::new(CONDITION_RESOLUTION_FAILED, ConditionStatus::True)
            .with_reason(error.reason().to_string(), message);
        update_status(&mut sub.status, now, |status| {
            if failed {
                status.state = SubscriptionState::Failed;
            }
            set_condition(&mut status.conditions, condition, now);
        });
    }
}

fn record_resolution(
    state: &mut ClusterState,
    resolution: &NamespaceResolution,
    plan_ref: Option<&str>,
    now: DateTime<Utc>,
) {
    for sub in state
        .subscriptions
        .iter_mut()
        .filter(|s| s.namespace == resolution.namespace)
    {
        let Some(outcome) = resolution.outcomes.get(&sub.name) else {
            continue;
        };
        update_status(&mut sub.status, now, |status| {
            remove_condition(&mut status.conditions, CONDITION_RESOLUTION_FAILED);
            match outcome {
                SubscriptionOutcome::UpToDate { csv } => {
                    status.state = SubscriptionState::AtLatestKnown;
                    status.current_csv = Some(csv.clone());
                    status.installed_csv = Some(csv.clone());
                }
                SubscriptionOutcome::Install { csv, replaces } => {
                    status.state = SubscriptionState::UpgradePending;
                    status.current_csv = Some(csv.clone());
                    status.installed_csv = replaces.clone();
                    status.install_plan_ref = plan_ref.map(str::to_string);
                }
            }
        });
    }
}

//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{InstallPlan, InstallPlanPhase, Step, StepStatus, CONDITION_INSTALLED};
use crate::cluster::{set_condition, ApprovalMode, Condition, ConditionStatus, FailureReason};
use crate::config::BackoffConfig;
use crate::crd::{ensure_v1_crd_versions, parse_crd, CrdError};
use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a step could not be applied
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error(
        "{resource} \"{name}\" is forbidden: User \"{user}\" cannot {verb} resource \"{resource}\" in API group \"{group}\"{}",
        namespace.as_ref().map(|n| format!(" in the namespace \"{}\"", n)).unwrap_or_default()
    )]
    #[diagnostic(
        code(olm::apply_error::forbidden),
        help("Grant the missing permission to the installing service account; the plan is retried")
    )]
    Forbidden {
        user: String,
        verb: String,
        resource: String,
        group: String,
        namespace: Option<String>,
        name: String,
    },

    #[error("transient failure: {0}")]
    #[diagnostic(code(olm::apply_error::transient))]
    Transient(String),

    #[error("invalid manifest: {0}")]
    #[diagnostic(code(olm::apply_error::invalid))]
    Invalid(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Crd(#[from] CrdError),
}

impl ApplyError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ApplyError::Forbidden { .. } => FailureReason::Forbidden,
            ApplyError::Transient(_) => FailureReason::Transient,
            ApplyError::Invalid(_) => FailureReason::Invalid,
            ApplyError::Crd(CrdError::DataLossRisk { .. }) => FailureReason::DataLossRisk,
            ApplyError::Crd(CrdError::Invalid { .. }) => FailureReason::Invalid,
        }
    }
}

/// Applies plan steps to a cluster
pub trait StepExecutor {
    /// Create the step's resource, or report that it already exists
    fn apply(&mut self, step: &Step) -> Result<StepStatus, ApplyError>;

    /// The live CRD of that name, if there is one
    fn existing_crd(&self, name: &str) -> Option<CustomResourceDefinition>;
}

/// What the caller should do after an [`execute`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Manual approval outstanding
    AwaitingApproval,
    /// Call again once `after` has passed
    Requeue { after: Duration },
    Complete,
    /// `retryable` failures are re-attempted by the next call
    Failed {
        reason: FailureReason,
        retryable: bool,
    },
}

/// Fail the plan. Retryable failures are not re-attempted before the
/// backoff delay for the current attempt count has passed.
pub(crate) fn mark_failed(
    plan: &mut InstallPlan,
    error: &ApplyError,
    backoff: &BackoffConfig,
    now: DateTime<Utc>,
) -> ExecutionOutcome {
    let reason = error.reason();
    let status = &mut plan.status;
    status.phase = InstallPlanPhase::Failed;
    status.retry_after = if reason.is_retryable() {
        chrono::Duration::from_std(backoff.delay(status.attempts))
            .ok()
            .map(|d| now + d)
    } else {
        None
    };
    status.attempts += 1;
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_INSTALLED, ConditionStatus::False)
            .with_reason(reason.to_string(), error.to_string()),
        now,
    );
    warn!(plan = %plan.name, namespace = %plan.namespace, %reason, error = %error, "install plan failed");
    ExecutionOutcome::Failed {
        reason,
        retryable: reason.is_retryable(),
    }
}

fn requeue(
    plan: &mut InstallPlan,
    backoff: &BackoffConfig,
    reason: FailureReason,
    message: String,
    now: DateTime<Utc>,
) -> ExecutionOutcome {
    let status = &mut plan.status;
    let delay = backoff.delay(status.attempts);
    status.attempts += 1;
    status.retry_after = chrono::Duration::from_std(delay).ok().map(|d| now + d);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_INSTALLED, ConditionStatus::False).with_reason(reason.to_string(), message),
        now,
    );
    debug!(plan = %plan.name, attempts = status.attempts, delay_ms = delay.as_millis() as u64, "requeueing install plan");
    ExecutionOutcome::Requeue { after: delay }
}

/// Time left until the plan may be attempted again
fn wait_for(plan: &InstallPlan, now: DateTime<Utc>) -> Option<Duration> {
    plan.status
        .retry_after
        .filter(|at| *at > now)
        .map(|at| (at - now).to_std().unwrap_or_default())
}

/// Check a CRD step against the live CRD of the same name, if any
pub(crate) fn check_crd(step: &Step, existing: Option<&CustomResourceDefinition>) -> Result<(), ApplyError> {
    let new = parse_crd(&step.resource.manifest)?;
    if let Some(existing) = existing {
        ensure_v1_crd_versions(existing, &new)?;
    }
    Ok(())
}

/// Move `plan` through its phases as far as it can go right now.
///
/// `Planning` goes to `RequiresApproval` for unapproved manual plans and to
/// `Installing` otherwise. While installing, steps are applied in order and
/// the first error stops the pass:
/// - transient errors keep the plan installing and ask to be called again
///   after an exponential delay
/// - forbidden and data loss errors fail the plan; a call after the backoff
///   delay tries again, since permissions may be granted or stored versions
///   migrated meanwhile
/// - invalid manifests fail the plan for good
///
/// Steps already `Created` or `Present` are never applied twice.
pub fn execute<E: StepExecutor + ?Sized>(
    plan: &mut InstallPlan,
    executor: &mut E,
    backoff: &BackoffConfig,
    now: DateTime<Utc>,
) -> ExecutionOutcome {
    match plan.status.phase {
        InstallPlanPhase::Complete => return ExecutionOutcome::Complete,
        InstallPlanPhase::Failed => match plan.status.failure_reason() {
            Some(reason) if reason.is_retryable() => {
                if let Some(after) = wait_for(plan, now) {
                    return ExecutionOutcome::Requeue { after };
                }
                info!(plan = %plan.name, %reason, "re-attempting failed install plan");
                plan.status.phase = InstallPlanPhase::Installing;
            }
            reason => {
                return ExecutionOutcome::Failed {
                    reason: reason.unwrap_or(FailureReason::Invalid),
                    retryable: false,
                }
            }
        },
        InstallPlanPhase::Planning | InstallPlanPhase::RequiresApproval => {
            if plan.spec.approval == ApprovalMode::Manual && !plan.spec.approved {
                plan.status.phase = InstallPlanPhase::RequiresApproval;
                return ExecutionOutcome::AwaitingApproval;
            }
            info!(plan = %plan.name, namespace = %plan.namespace, "installing");
            plan.status.phase = InstallPlanPhase::Installing;
        }
        InstallPlanPhase::Installing => {}
    }

    if let Some(after) = wait_for(plan, now) {
        return ExecutionOutcome::Requeue { after };
    }

    for i in 0..plan.steps.len() {
        if plan.steps[i].status.is_done() {
            continue;
        }
        let step = &plan.steps[i];
        if step.is_crd() {
            let live = executor.existing_crd(&step.resource.name);
            if let Err(e) = check_crd(step, live.as_ref()) {
                return mark_failed(plan, &e, backoff, now);
            }
        }
        match executor.apply(step) {
            Ok(status) if status.is_done() => {
                debug!(plan = %plan.name, kind = %plan.steps[i].resource.kind, name = %plan.steps[i].resource.name, %status, "applied step");
                plan.steps[i].status = status;
                plan.status.attempts = 0;
            }
            Ok(status) => {
                let message = format!(
                    "{} {} reported {}",
                    step.resource.kind, step.resource.name, status
                );
                plan.steps[i].status = status;
                return requeue(plan, backoff, FailureReason::Transient, message, now);
            }
            Err(e @ ApplyError::Transient(_)) => {
                return requeue(plan, backoff, FailureReason::Transient, e.to_string(), now);
            }
            Err(e) => return mark_failed(plan, &e, backoff, now),
        }
    }

    let status = &mut plan.status;
    status.phase = InstallPlanPhase::Complete;
    status.attempts = 0;
    status.retry_after = None;
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_INSTALLED, ConditionStatus::True)
            .with_reason("AllStepsApplied", format!("{} steps applied", plan.steps.len())),
        now,
    );
    info!(plan = %plan.name, namespace = %plan.namespace, "install plan complete");
    ExecutionOutcome::Complete
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{Bundle, SourceKey, StrategyPermission};
    use crate::crd::tests::{crd, crd_manifest};
    use crate::plan::generate;
    use crate::resolver::{NamespaceResolution, ResolvedBundle, Selection};
    use chrono::TimeZone;
    use semver::Version;
    use std::collections::{BTreeMap, BTreeSet};

    /// An in-memory cluster where the installer may lack permissions
    #[derive(Default)]
    pub(crate) struct FakeCluster {
        pub(crate) objects: BTreeSet<(String, String)>,
        pub(crate) crds: BTreeMap<String, CustomResourceDefinition>,
        pub(crate) denied: bool,
        pub(crate) transient: u32,
        pub(crate) invalid: bool,
        pub(crate) applied: usize,
    }

    impl StepExecutor for FakeCluster {
        fn apply(&mut self, step: &Step) -> Result<StepStatus, ApplyError> {
            let r = &step.resource;
            if self.denied {
                return Err(ApplyError::Forbidden {
                    user: "system:serviceaccount:operators:installer".to_string(),
                    verb: "create".to_string(),
                    resource: format!("{}s", r.kind.to_lowercase()),
                    group: r.group.clone(),
                    namespace: r.namespace.clone(),
                    name: r.name.clone(),
                });
            }
            if self.transient > 0 {
                self.transient -= 1;
                return Err(ApplyError::Transient("etcdserver: request timed out".to_string()));
            }
            if self.invalid {
                return Err(ApplyError::Invalid(format!("{} is malformed", r.name)));
            }
            self.applied += 1;
            if self.objects.insert((r.kind.clone(), r.name.clone())) {
                Ok(StepStatus::Created)
            } else {
                Ok(StepStatus::Present)
            }
        }

        fn existing_crd(&self, name: &str) -> Option<CustomResourceDefinition> {
            self.crds.get(name).cloned()
        }
    }

    pub(crate) fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn plan(approval: ApprovalMode) -> InstallPlan {
        let mut b = Bundle::new("etcd.v0.9.2", "etcd", Version::new(0, 9, 2));
        b.crds.push(crd_manifest(&[("v1beta2", true)], &[]));
        b.strategy.permissions.push(StrategyPermission {
            service_account_name: "etcd-operator".to_string(),
            rules: Vec::new(),
        });
        let resolution = NamespaceResolution {
            namespace: "operators".to_string(),
            bundles: vec![ResolvedBundle {
                bundle: b,
                source: SourceKey::new("community", "olm"),
                selection: Selection::Subscribed {
                    subscription: "etcd".to_string(),
                },
                replaces: None,
            }],
            outcomes: Default::default(),
        };
        generate(&resolution, approval).unwrap()
    }

    #[test]
    fn automatic_plan_installs_every_step() {
        let mut p = plan(ApprovalMode::Automatic);
        let mut cluster = FakeCluster::default();
        let backoff = BackoffConfig::default();
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(0)), ExecutionOutcome::Complete);
        assert_eq!(p.phase(), InstallPlanPhase::Complete);
        assert!(p.steps.iter().all(|s| s.status == StepStatus::Created));
        assert!(p.is_terminal());

        let applied = cluster.applied;
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(1)), ExecutionOutcome::Complete);
        assert_eq!(cluster.applied, applied);
    }

    #[test]
    fn existing_objects_are_present() {
        let mut p = plan(ApprovalMode::Automatic);
        let mut cluster = FakeCluster::default();
        cluster
            .objects
            .insert(("ServiceAccount".to_string(), "etcd-operator".to_string()));
        execute(&mut p, &mut cluster, &BackoffConfig::default(), t(0));
        let (_, sa) = p.step("ServiceAccount", "etcd-operator").unwrap();
        assert_eq!(sa.status, StepStatus::Present);
    }

    #[test]
    fn manual_plan_waits_for_approval() {
        let mut p = plan(ApprovalMode::Manual);
        let mut cluster = FakeCluster::default();
        let backoff = BackoffConfig::default();
        assert_eq!(
            execute(&mut p, &mut cluster, &backoff, t(0)),
            ExecutionOutcome::AwaitingApproval
        );
        assert_eq!(p.phase(), InstallPlanPhase::RequiresApproval);
        assert_eq!(cluster.applied, 0);

        p.spec.approved = true;
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(1)), ExecutionOutcome::Complete);
    }

    #[test]
    fn forbidden_fails_then_recovers_once_granted() {
        let mut p = plan(ApprovalMode::Automatic);
        let mut cluster = FakeCluster {
            denied: true,
            ..Default::default()
        };
        let backoff = BackoffConfig::default();
        assert_eq!(
            execute(&mut p, &mut cluster, &backoff, t(0)),
            ExecutionOutcome::Failed {
                reason: FailureReason::Forbidden,
                retryable: true
            }
        );
        assert_eq!(p.phase(), InstallPlanPhase::Failed);
        assert!(p.status.message().unwrap().contains("cannot create resource"));
        assert!(p.steps.iter().all(|s| s.status == StepStatus::Unknown));
        assert!(!p.is_terminal());
        assert_eq!(p.status.retry_after, Some(t(1)));

        // Still denied after the delay: the next attempt waits twice as long
        assert!(matches!(
            execute(&mut p, &mut cluster, &backoff, t(1)),
            ExecutionOutcome::Failed { retryable: true, .. }
        ));
        assert_eq!(p.status.retry_after, Some(t(3)));

        // Granted, but retried only once the delay has passed
        cluster.denied = false;
        assert_eq!(
            execute(&mut p, &mut cluster, &backoff, t(2)),
            ExecutionOutcome::Requeue {
                after: Duration::from_secs(1)
            }
        );
        assert_eq!(p.phase(), InstallPlanPhase::Failed);
        assert_eq!(cluster.applied, 0);
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(3)), ExecutionOutcome::Complete);
        assert_eq!(p.status.retry_after, None);
        assert!(p.steps.iter().all(|s| s.status.is_done()));
    }

    #[test]
    fn transient_errors_back_off() {
        let mut p = plan(ApprovalMode::Automatic);
        let mut cluster = FakeCluster {
            transient: 2,
            ..Default::default()
        };
        let backoff = BackoffConfig {
            initial_ms: 1_000,
            max_ms: 60_000,
        };
        assert_eq!(
            execute(&mut p, &mut cluster, &backoff, t(0)),
            ExecutionOutcome::Requeue {
                after: Duration::from_secs(1)
            }
        );
        assert_eq!(p.phase(), InstallPlanPhase::Installing);
        // Too early: nothing is attempted
        assert!(matches!(
            execute(&mut p, &mut cluster, &backoff, t(0)),
            ExecutionOutcome::Requeue { .. }
        ));
        assert_eq!(cluster.transient, 1);
        assert_eq!(
            execute(&mut p, &mut cluster, &backoff, t(1)),
            ExecutionOutcome::Requeue {
                after: Duration::from_secs(2)
            }
        );
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(3)), ExecutionOutcome::Complete);
        assert_eq!(p.status.attempts, 0);
    }

    #[test]
    fn crd_narrowing_fails_until_migrated() {
        let mut p = plan(ApprovalMode::Automatic);
        let name = "etcdclusters.etcd.database.coreos.com";
        let mut cluster = FakeCluster::default();
        cluster
            .crds
            .insert(name.to_string(), crd(&[("v1beta1", true)], &["v1beta1"]));
        let backoff = BackoffConfig::default();

        assert_eq!(
            execute(&mut p, &mut cluster, &backoff, t(0)),
            ExecutionOutcome::Failed {
                reason: FailureReason::DataLossRisk,
                retryable: true
            }
        );
        assert!(p.status.message().unwrap().contains("v1beta1"));
        assert_eq!(cluster.applied, 0);

        // Stored objects migrated out of band
        cluster
            .crds
            .insert(name.to_string(), crd(&[("v1beta2", true)], &["v1beta2"]));
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(60)), ExecutionOutcome::Complete);
    }

    #[test]
    fn invalid_manifest_is_terminal() {
        let mut p = plan(ApprovalMode::Automatic);
        let mut cluster = FakeCluster {
            invalid: true,
            ..Default::default()
        };
        let backoff = BackoffConfig::default();
        let failed = ExecutionOutcome::Failed {
            reason: FailureReason::Invalid,
            retryable: false,
        };
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(0)), failed);
        assert!(p.is_terminal());
        assert_eq!(p.status.retry_after, None);
        cluster.invalid = false;
        assert_eq!(execute(&mut p, &mut cluster, &backoff, t(60)), failed);
        assert_eq!(cluster.applied, 0);
    }
}

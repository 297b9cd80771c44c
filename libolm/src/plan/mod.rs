//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! InstallPlans: the ordered resource steps a resolution turns into.
//!
//! [`generate`] renders a [`NamespaceResolution`](crate::resolver::NamespaceResolution)
//! into steps. [`execute`] drives a plan's phase machine against a
//! [`StepExecutor`].

pub(crate) mod execute;
mod generate;

pub use execute::{execute, ApplyError, ExecutionOutcome, StepExecutor};
pub use generate::{generate, plan_name};

use crate::catalog::SourceKey;
use crate::cluster::{
    find_condition, set_condition, ApprovalMode, Condition, ConditionStatus, FailureReason,
};
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

pub const CONDITION_INSTALLED: &str = "Installed";

#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("bundle {bundle} carries an invalid manifest: {reason}")]
    #[diagnostic(
        code(olm::plan_error::invalid_manifest),
        help("Fix the manifest in the catalog; the plan can not be applied as is")
    )]
    InvalidManifest { bundle: String, reason: String },

    #[error("failed to encode {kind} {name}")]
    #[diagnostic(code(olm::plan_error::encode))]
    Encode {
        kind: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum StepStatus {
    #[default]
    Unknown,
    NotPresent,
    Present,
    Created,
}

impl StepStatus {
    /// The resource exists on the cluster
    pub fn is_done(self) -> bool {
        matches!(self, StepStatus::Present | StepStatus::Created)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum InstallPlanPhase {
    #[default]
    Planning,
    RequiresApproval,
    Installing,
    Complete,
    Failed,
}

/// A single Kubernetes object to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    /// Unset for cluster scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub catalog_source: String,
    pub catalog_source_namespace: String,
    pub manifest: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// CSV this step belongs to
    pub resolving: String,
    pub resource: StepResource,
    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    pub fn is_crd(&self) -> bool {
        self.resource.kind == crate::catalog::csv::CRD_KIND
    }

    pub fn source(&self) -> SourceKey {
        SourceKey::new(
            self.resource.catalog_source.clone(),
            self.resource.catalog_source_namespace.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanSpec {
    pub cluster_service_version_names: Vec<String>,
    #[serde(default)]
    pub approval: ApprovalMode,
    #[serde(default)]
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanStatus {
    #[serde(default)]
    pub phase: InstallPlanPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Failed apply attempts since the plan last made progress
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl InstallPlanStatus {
    /// Reason recorded by the last failed attempt, if the plan failed
    pub fn failure_reason(&self) -> Option<FailureReason> {
        if self.phase != InstallPlanPhase::Failed {
            return None;
        }
        find_condition(&self.conditions, CONDITION_INSTALLED)
            .and_then(|c| c.reason.as_deref())
            .and_then(|r| r.parse().ok())
    }

    pub fn message(&self) -> Option<&str> {
        find_condition(&self.conditions, CONDITION_INSTALLED).and_then(|c| c.message.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlan {
    pub name: String,
    pub namespace: String,
    pub spec: InstallPlanSpec,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub status: InstallPlanStatus,
}

impl InstallPlan {
    pub fn phase(&self) -> InstallPlanPhase {
        self.status.phase
    }

    /// Complete, or failed for a reason no later attempt can change
    pub fn is_terminal(&self) -> bool {
        match self.status.phase {
            InstallPlanPhase::Complete => true,
            InstallPlanPhase::Failed => !self
                .status
                .failure_reason()
                .is_some_and(|r| r.is_retryable()),
            _ => false,
        }
    }

    /// True when the plan installs exactly `csvs`, ignoring order
    pub fn installs(&self, csvs: &[String]) -> bool {
        let mut mine = self.spec.cluster_service_version_names.clone();
        let mut theirs = csvs.to_vec();
        mine.sort();
        theirs.sort();
        mine == theirs
    }

    /// Fail the plan for good in favour of the plan named `by`. Steps it
    /// already applied stay applied.
    pub fn supersede(&mut self, by: &str, now: DateTime<Utc>) {
        let status = &mut self.status;
        status.phase = InstallPlanPhase::Failed;
        status.retry_after = None;
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_INSTALLED, ConditionStatus::False).with_reason(
                FailureReason::Superseded.to_string(),
                format!("superseded by install plan {}", by),
            ),
            now,
        );
    }

    pub fn step(&self, kind: &str, name: &str) -> Option<(usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.resource.kind == kind && s.resource.name == name)
    }
}

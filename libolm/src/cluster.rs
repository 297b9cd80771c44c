//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster objects the resolver reads and writes.
//!
//! These are the semantic fields of the Subscription, OperatorGroup and
//! installed CSV objects. [`ClusterState`] bundles them into a serializable
//! snapshot that stands in for the informer caches of a running controller.

use crate::catalog::{Api, Bundle, InstallModeType, SourceKey};
use crate::plan::InstallPlan;
use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumString};

/// How InstallPlans of a subscription get approved
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum ApprovalMode {
    #[default]
    Automatic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Package name
    #[serde(rename = "name")]
    pub package: String,
    /// Channel to follow; empty follows the package default
    #[serde(default)]
    pub channel: String,
    /// Name of the catalog source
    pub source: String,
    pub source_namespace: String,
    #[serde(default)]
    pub install_plan_approval: ApprovalMode,
    /// Install this CSV first instead of the channel head
    #[serde(default, rename = "startingCSV", skip_serializing_if = "Option::is_none")]
    pub starting_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

impl SubscriptionSpec {
    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(self.source.clone(), self.source_namespace.clone())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum SubscriptionState {
    #[default]
    None,
    UpgradePending,
    AtLatestKnown,
    Failed,
}

/// Why a resolution or plan failed, as written into condition reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum FailureReason {
    NotFound,
    #[serde(rename = "AmbiguousAPI")]
    #[strum(serialize = "AmbiguousAPI")]
    AmbiguousApi,
    ConstraintsNotSatisfiable,
    Forbidden,
    DataLossRisk,
    Transient,
    Invalid,
    /// A newer resolution replaced the plan before it completed
    Superseded,
}

impl FailureReason {
    /// Failures a later attempt may get past without a catalog change
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureReason::Forbidden | FailureReason::DataLossRisk | FailureReason::Transient
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A status condition in the usual Kubernetes shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(kind: impl Into<String>, status: ConditionStatus) -> Self {
        Condition {
            kind: kind.into(),
            status,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }

    /// Same type, status, reason and message; the timestamp is ignored
    fn same_as(&self, other: &Condition) -> bool {
        self.kind == other.kind
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Insert or replace the condition of the same type.
///
/// The transition time only moves when something other than the time changed,
/// so repeated reconciles of an unchanged state do not rewrite status.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|c| c.kind == condition.kind) {
        Some(existing) if existing.same_as(&condition) => {}
        Some(existing) => {
            condition.last_transition_time = Some(now);
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, kind: &str) {
    conditions.retain(|c| c.kind != kind);
}

pub fn find_condition<'a>(conditions: &'a [Condition], kind: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.kind == kind)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(default)]
    pub state: SubscriptionState,
    /// CSV the subscription currently wants installed
    #[serde(default, rename = "currentCSV", skip_serializing_if = "Option::is_none")]
    pub current_csv: Option<String>,
    /// CSV found installed on the cluster
    #[serde(default, rename = "installedCSV", skip_serializing_if = "Option::is_none")]
    pub installed_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_plan_ref: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub name: String,
    pub namespace: String,
    pub spec: SubscriptionSpec,
    #[serde(default)]
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroup {
    pub name: String,
    pub namespace: String,
    /// Namespaces the group's operators watch; empty means all namespaces
    #[serde(default)]
    pub target_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

impl OperatorGroup {
    /// The install mode an operator in this group runs under
    pub fn install_mode(&self) -> InstallModeType {
        match self.target_namespaces.as_slice() {
            [] => InstallModeType::AllNamespaces,
            [t] if t.is_empty() => InstallModeType::AllNamespaces,
            [t] if *t == self.namespace => InstallModeType::OwnNamespace,
            [_] => InstallModeType::SingleNamespace,
            _ => InstallModeType::MultiNamespace,
        }
    }
}

/// A CSV found running on the cluster.
///
/// Wraps the catalog bundle it was installed from together with where it runs
/// and which source, if any, it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledOperator {
    pub namespace: String,
    pub bundle: Bundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKey>,
}

impl InstalledOperator {
    pub fn new(namespace: impl Into<String>, bundle: Bundle) -> Self {
        InstalledOperator {
            namespace: namespace.into(),
            bundle,
            source: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.bundle.name
    }

    pub fn package(&self) -> &str {
        &self.bundle.package
    }

    pub fn provides(&self, api: &Api) -> bool {
        self.bundle.provides(api)
    }
}

/// Everything the resolver and plan executor read from the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub operator_groups: Vec<OperatorGroup>,
    #[serde(default)]
    pub installed: Vec<InstalledOperator>,
    /// Live CRDs by name
    #[serde(default)]
    pub crds: BTreeMap<String, CustomResourceDefinition>,
    #[serde(default)]
    pub install_plans: Vec<InstallPlan>,
}

impl ClusterState {
    /// Namespaces holding at least one subscription, sorted
    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.subscriptions.iter().map(|s| s.namespace.as_str()).collect()
    }

    pub fn subscriptions_in(&self, namespace: &str) -> impl Iterator<Item = &Subscription> + '_ {
        let namespace = namespace.to_string();
        self.subscriptions.iter().filter(move |s| s.namespace == namespace)
    }

    pub fn operator_groups_in(&self, namespace: &str) -> impl Iterator<Item = &OperatorGroup> + '_ {
        let namespace = namespace.to_string();
        self.operator_groups.iter().filter(move |g| g.namespace == namespace)
    }

    pub fn installed_in(&self, namespace: &str) -> impl Iterator<Item = &InstalledOperator> + '_ {
        let namespace = namespace.to_string();
        self.installed.iter().filter(move |o| o.namespace == namespace)
    }

    pub fn installed_csv(&self, namespace: &str, name: &str) -> Option<&InstalledOperator> {
        self.installed_in(namespace).find(|o| o.name() == name)
    }

    pub fn install_plan(&self, namespace: &str, name: &str) -> Option<&InstallPlan> {
        self.install_plans
            .iter()
            .find(|p| p.namespace == namespace && p.name == name)
    }
}

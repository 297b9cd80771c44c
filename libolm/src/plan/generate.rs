//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{InstallPlan, InstallPlanSpec, InstallPlanStatus, PlanError, Result, Step, StepResource, StepStatus};
use crate::catalog::csv::{name_of, CRD_KIND, CSV_KIND};
use crate::catalog::{SourceKey, StrategyPermission};
use crate::cluster::{ApprovalMode, SubscriptionSpec};
use crate::resolver::{NamespaceResolution, ResolvedBundle, Selection};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const OPERATORS_GROUP: &str = "operators.coreos.com";

/// Coarse ordering of steps: every CRD goes first, then cluster RBAC, then
/// the namespaced objects of each bundle in install order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
enum StepPhase {
    Crd = 0,
    ClusterRbac = 1,
    Bundle = 2,
}

fn kind_rank(kind: &str) -> u8 {
    match kind {
        "ServiceAccount" => 0,
        "Role" => 1,
        "RoleBinding" => 2,
        CSV_KIND => 3,
        "Deployment" => 4,
        "Subscription" => 5,
        _ => 6,
    }
}

/// Deterministic plan name for a set of CSVs in a namespace
pub fn plan_name(namespace: &str, csvs: &[String]) -> String {
    let mut sorted: Vec<&str> = csvs.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for csv in sorted {
        hasher.update(b"\n");
        hasher.update(csv.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("install-{}", &digest[..10])
}

struct PendingStep {
    phase: StepPhase,
    bundle_index: usize,
    step: Step,
}

impl PendingStep {
    fn sort_key(&self) -> (StepPhase, usize, u8, &str, Option<&str>, &str) {
        let r = &self.step.resource;
        // Only bundle objects keep the resolved install order
        let index = match self.phase {
            StepPhase::Bundle => self.bundle_index,
            _ => 0,
        };
        (
            self.phase,
            index,
            kind_rank(&r.kind),
            r.kind.as_str(),
            r.namespace.as_deref(),
            r.name.as_str(),
        )
    }
}

/// Collects the steps of one plan, dropping repeats of the same object
struct StepWriter<'r> {
    namespace: &'r str,
    steps: Vec<PendingStep>,
    seen: BTreeSet<(String, Option<String>, String)>,
}

impl<'r> StepWriter<'r> {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        phase: StepPhase,
        bundle_index: usize,
        resolved: &ResolvedBundle,
        (group, version, kind): (&str, &str, &str),
        name: String,
        namespaced: bool,
        manifest: Value,
    ) {
        let namespace = namespaced.then(|| self.namespace.to_string());
        if !self
            .seen
            .insert((kind.to_string(), namespace.clone(), name.clone()))
        {
            return;
        }
        let source: &SourceKey = &resolved.source;
        self.steps.push(PendingStep {
            phase,
            bundle_index,
            step: Step {
                resolving: resolved.bundle.name.clone(),
                resource: StepResource {
                    group: group.to_string(),
                    version: version.to_string(),
                    kind: kind.to_string(),
                    name,
                    namespace,
                    catalog_source: source.name.clone(),
                    catalog_source_namespace: source.namespace.clone(),
                    manifest,
                },
                status: StepStatus::Unknown,
            },
        });
    }
}

fn encode<T: Serialize>(kind: &str, name: &str, object: &T) -> Result<Value> {
    serde_json::to_value(object).map_err(|source| PlanError::Encode {
        kind: kind.to_string(),
        name: name.to_string(),
        source,
    })
}

fn owner_meta(name: &str, namespace: Option<&str>, csv: &str, csv_namespace: &str) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert("olm.owner".to_string(), csv.to_string());
    labels.insert("olm.owner.namespace".to_string(), csv_namespace.to_string());
    labels.insert("olm.owner.kind".to_string(), CSV_KIND.to_string());
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Set `metadata.namespace` on a manifest that must be a JSON object
fn with_namespace(bundle: &str, mut manifest: Value, namespace: &str) -> Result<Value> {
    let invalid = |reason: &str| PlanError::InvalidManifest {
        bundle: bundle.to_string(),
        reason: reason.to_string(),
    };
    let object = manifest
        .as_object_mut()
        .ok_or_else(|| invalid("manifest is not an object"))?;
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| invalid("metadata is not an object"))?;
    metadata.insert("namespace".to_string(), json!(namespace));
    Ok(manifest)
}

fn csv_manifest(resolved: &ResolvedBundle, namespace: &str) -> Result<Value> {
    let bundle = &resolved.bundle;
    let manifest = match &bundle.csv {
        Some(csv) => csv.clone(),
        None => {
            let mut spec = json!({ "version": bundle.version.to_string() });
            if let Some(replaces) = &bundle.replaces {
                spec["replaces"] = json!(replaces);
            }
            json!({
                "apiVersion": "operators.coreos.com/v1alpha1",
                "kind": CSV_KIND,
                "metadata": { "name": bundle.name },
                "spec": spec,
            })
        }
    };
    with_namespace(&bundle.name, manifest, namespace)
}

fn rbac_steps(
    w: &mut StepWriter<'_>,
    index: usize,
    resolved: &ResolvedBundle,
    permission: &StrategyPermission,
    cluster: bool,
) -> Result<()> {
    let csv = resolved.bundle.name.as_str();
    let ns = w.namespace;
    let sa = permission.service_account_name.as_str();
    let name = format!("{}-{}", csv, sa);
    let subjects = Some(vec![service_account_subject(sa, ns)]);
    if cluster {
        let role = ClusterRole {
            metadata: owner_meta(&name, None, csv, ns),
            rules: Some(permission.rules.clone()),
            ..Default::default()
        };
        let binding = ClusterRoleBinding {
            metadata: owner_meta(&name, None, csv, ns),
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: name.clone(),
            },
            subjects,
        };
        let role = encode("ClusterRole", &name, &role)?;
        let binding = encode("ClusterRoleBinding", &name, &binding)?;
        w.push(StepPhase::ClusterRbac, index, resolved, (RBAC_GROUP, "v1", "ClusterRole"), name.clone(), false, role);
        w.push(StepPhase::ClusterRbac, index, resolved, (RBAC_GROUP, "v1", "ClusterRoleBinding"), name, false, binding);
    } else {
        let role = Role {
            metadata: owner_meta(&name, Some(ns), csv, ns),
            rules: Some(permission.rules.clone()),
        };
        let binding = RoleBinding {
            metadata: owner_meta(&name, Some(ns), csv, ns),
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "Role".to_string(),
                name: name.clone(),
            },
            subjects,
        };
        let role = encode("Role", &name, &role)?;
        let binding = encode("RoleBinding", &name, &binding)?;
        w.push(StepPhase::Bundle, index, resolved, (RBAC_GROUP, "v1", "Role"), name.clone(), true, role);
        w.push(StepPhase::Bundle, index, resolved, (RBAC_GROUP, "v1", "RoleBinding"), name, true, binding);
    }
    Ok(())
}

fn bundle_steps(
    w: &mut StepWriter<'_>,
    index: usize,
    resolved: &ResolvedBundle,
    approval: ApprovalMode,
) -> Result<()> {
    let bundle = &resolved.bundle;
    let ns = w.namespace;

    for crd in &bundle.crds {
        let name = name_of(crd).ok_or_else(|| PlanError::InvalidManifest {
            bundle: bundle.name.clone(),
            reason: "CustomResourceDefinition without metadata.name".to_string(),
        })?;
        w.push(
            StepPhase::Crd,
            index,
            resolved,
            ("apiextensions.k8s.io", "v1", CRD_KIND),
            name.to_string(),
            false,
            crd.clone(),
        );
    }

    for permission in &bundle.strategy.cluster_permissions {
        rbac_steps(w, index, resolved, permission, true)?;
    }
    for permission in &bundle.strategy.permissions {
        rbac_steps(w, index, resolved, permission, false)?;
    }

    for sa in bundle.strategy.service_accounts() {
        let account = ServiceAccount {
            metadata: owner_meta(sa, Some(ns), &bundle.name, ns),
            ..Default::default()
        };
        let manifest = encode("ServiceAccount", sa, &account)?;
        w.push(StepPhase::Bundle, index, resolved, ("", "v1", "ServiceAccount"), sa.to_string(), true, manifest);
    }

    let csv = csv_manifest(resolved, ns)?;
    w.push(
        StepPhase::Bundle,
        index,
        resolved,
        (OPERATORS_GROUP, "v1alpha1", CSV_KIND),
        bundle.name.clone(),
        true,
        csv,
    );

    for deployment in &bundle.strategy.deployments {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": deployment.name, "namespace": ns },
            "spec": deployment.spec,
        });
        w.push(StepPhase::Bundle, index, resolved, ("apps", "v1", "Deployment"), deployment.name.clone(), true, manifest);
    }

    if let Selection::Dependency { channel } = &resolved.selection {
        let source = &resolved.source;
        let name = format!("{}-{}-{}-{}", bundle.package, channel, source.name, source.namespace);
        let spec = SubscriptionSpec {
            package: bundle.package.clone(),
            channel: channel.clone(),
            source: source.name.clone(),
            source_namespace: source.namespace.clone(),
            install_plan_approval: approval,
            starting_csv: Some(bundle.name.clone()),
            service_account_name: None,
        };
        let manifest = json!({
            "apiVersion": "operators.coreos.com/v1alpha1",
            "kind": "Subscription",
            "metadata": { "name": name, "namespace": ns },
            "spec": encode("Subscription", &name, &spec)?,
        });
        w.push(StepPhase::Bundle, index, resolved, (OPERATORS_GROUP, "v1alpha1", "Subscription"), name, true, manifest);
    }
    Ok(())
}

/// Render a resolution into an InstallPlan in phase Planning.
///
/// Steps are ordered CRDs first, then cluster RBAC, then each bundle's
/// namespaced objects in the resolution's install order. Ties are broken by
/// kind, namespace and name, so equal resolutions render equal plans.
pub fn generate(resolution: &NamespaceResolution, approval: ApprovalMode) -> Result<InstallPlan> {
    let namespace = resolution.namespace.as_str();
    let mut writer = StepWriter {
        namespace,
        steps: Vec::new(),
        seen: BTreeSet::new(),
    };
    for (index, resolved) in resolution.bundles.iter().enumerate() {
        bundle_steps(&mut writer, index, resolved, approval)?;
    }
    let mut pending = writer.steps;
    pending.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let csvs = resolution.csv_names();
    let name = plan_name(namespace, &csvs);
    debug!(namespace, plan = %name, steps = pending.len(), csvs = ?csvs, "generated install plan");
    Ok(InstallPlan {
        name,
        namespace: namespace.to_string(),
        spec: InstallPlanSpec {
            cluster_service_version_names: csvs,
            approval,
            approved: approval == ApprovalMode::Automatic,
        },
        steps: pending.into_iter().map(|p| p.step).collect(),
        status: InstallPlanStatus::default(),
    })
}

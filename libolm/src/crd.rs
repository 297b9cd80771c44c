//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Guard against CRD updates that would orphan stored objects.
//!
//! The API server keeps objects of a CRD in every version listed in
//! `status.storedVersions` until they are migrated. Dropping one of those
//! versions from the CRD makes the stored objects unreadable, so an update
//! is only allowed when the new manifest still lists every stored version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum CrdError {
    #[error(
        "risk of data loss updating {crd}: stored version(s) {} missing from the new CRD",
        missing.join(", ")
    )]
    #[diagnostic(
        code(olm::crd_error::data_loss_risk),
        help("Migrate the stored objects and edit status.storedVersions, or publish a catalog revision that keeps the old versions")
    )]
    DataLossRisk { crd: String, missing: Vec<String> },

    #[error("invalid CRD {crd}: {reason}")]
    #[diagnostic(code(olm::crd_error::invalid))]
    Invalid { crd: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CrdError>;

fn crd_name(crd: &CustomResourceDefinition) -> String {
    crd.metadata.name.clone().unwrap_or_default()
}

/// Versions for which objects may be persisted
pub fn stored_versions(crd: &CustomResourceDefinition) -> Vec<String> {
    crd.status
        .as_ref()
        .and_then(|s| s.stored_versions.clone())
        .unwrap_or_default()
}

/// Check that `new` keeps every version `existing` has stored objects in.
///
/// Pure predicate; neither CRD is modified.
pub fn ensure_v1_crd_versions(
    existing: &CustomResourceDefinition,
    new: &CustomResourceDefinition,
) -> Result<()> {
    let name = crd_name(existing);
    let missing: Vec<String> = stored_versions(existing)
        .into_iter()
        .filter(|stored| !new.spec.versions.iter().any(|v| v.name == *stored))
        .collect();
    if missing.is_empty() {
        debug!(crd = %name, "crd update keeps all stored versions");
        return Ok(());
    }
    warn!(crd = %name, missing = ?missing, "crd update would drop stored versions");
    Err(CrdError::DataLossRisk { crd: name, missing })
}

/// Decode a CRD manifest and check it names exactly one storage version
pub fn parse_crd(manifest: &serde_json::Value) -> Result<CustomResourceDefinition> {
    let name = manifest
        .pointer("/metadata/name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let crd: CustomResourceDefinition =
        serde_json::from_value(manifest.clone()).map_err(|e| CrdError::Invalid {
            crd: name.clone(),
            reason: e.to_string(),
        })?;
    let storage = crd.spec.versions.iter().filter(|v| v.storage).count();
    if storage != 1 {
        return Err(CrdError::Invalid {
            crd: name,
            reason: format!("expected exactly one storage version, found {}", storage),
        });
    }
    Ok(crd)
}

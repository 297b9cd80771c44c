//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! OperatorGroup scoping checks.

use super::ResolutionError;
use crate::catalog::Bundle;
use crate::cluster::{ClusterState, OperatorGroup};

/// The single OperatorGroup of `namespace`
pub fn operator_group_for<'s>(
    state: &'s ClusterState,
    namespace: &str,
) -> Result<&'s OperatorGroup, ResolutionError> {
    let groups: Vec<&OperatorGroup> = state.operator_groups_in(namespace).collect();
    match groups.as_slice() {
        [group] => Ok(*group),
        [] => Err(ResolutionError::Forbidden {
            subscription: None,
            reason: format!("no OperatorGroup found in namespace {}", namespace),
        }),
        _ => Err(ResolutionError::Forbidden {
            subscription: None,
            reason: format!(
                "{} OperatorGroups found in namespace {}: {}",
                groups.len(),
                namespace,
                groups
                    .iter()
                    .map(|g| g.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }),
    }
}

/// Reject bundles that can not run under the group's install mode
pub fn check_install_mode(
    bundle: &Bundle,
    group: &OperatorGroup,
    subscription: Option<&str>,
) -> Result<(), ResolutionError> {
    let mode = group.install_mode();
    if bundle.supports(mode) {
        return Ok(());
    }
    Err(ResolutionError::Forbidden {
        subscription: subscription.map(str::to_string),
        reason: format!(
            "{} does not support install mode {} required by OperatorGroup {}/{}",
            bundle.name, mode, group.namespace, group.name
        ),
    })
}

//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::{Catalog, Querier, Result};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// A bundle in a new release whose `replaces` chain never reaches the previous release
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContinuityIssue {
    pub package: String,
    pub bundle: String,
    pub replaces: String,
}

impl fmt::Display for ContinuityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) replaces {}, which does not lead back to the previous release",
            self.bundle, self.package, self.replaces
        )
    }
}

/// Compare two sequential releases of a catalog.
///
/// For every bundle of `next` with a `replaces` edge, the target must be found
/// by name in `previous`. A target that is itself new in `next` is accepted
/// when following its own edges eventually lands in `previous`; packages that
/// `previous` does not know at all are new and exempt. Lookup failures other
/// than "not found" are returned as errors.
pub fn check_continuity<Q: Querier + ?Sized>(
    previous: &Q,
    next: &Catalog,
) -> Result<Vec<ContinuityIssue>> {
    let known_packages: BTreeSet<String> = previous
        .list_packages()?
        .into_iter()
        .map(|p| p.name)
        .collect();
    let mut issues = Vec::new();

    for bundle in next.bundles() {
        let Some(replaces) = bundle.replaces.as_deref() else {
            continue;
        };
        if !known_packages.contains(&bundle.package) {
            continue;
        }
        let mut seen = BTreeSet::new();
        let mut cursor = Some(replaces.to_string());
        let mut connected = false;
        while let Some(name) = cursor.take() {
            if !seen.insert(name.clone()) {
                break;
            }
            match previous.find_csv_by_name(&name) {
                Ok(_) => {
                    connected = true;
                    break;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            cursor = next
                .graph(&bundle.package)
                .and_then(|g| g.get(&name))
                .and_then(|b| b.replaces.clone());
        }
        if !connected {
            issues.push(ContinuityIssue {
                package: bundle.package.clone(),
                bundle: bundle.name.clone(),
                replaces: replaces.to_string(),
            });
        }
    }
    issues.sort();
    debug!(issues = issues.len(), "checked release continuity");
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{etcd_catalog, v};
    use super::super::{Bundle, Catalog, Channel, Package, SourceKey};
    use super::*;

    fn etcd_package(head: &str) -> Package {
        Package {
            name: "etcd".to_string(),
            default_channel_name: "stable".to_string(),
            channels: vec![Channel {
                name: "stable".to_string(),
                package: "etcd".to_string(),
                current_csv_name: head.to_string(),
            }],
            description: None,
        }
    }

    #[test]
    fn successor_release_is_continuous() {
        let previous = etcd_catalog();
        let mut next = etcd_catalog();
        let mut v3 = Bundle::new("etcd.v0.9.4", "etcd", v("0.9.4"));
        v3.replaces = Some("etcd.v0.9.2".to_string());
        next.add_bundle(v3).unwrap();
        // Two new bundles chained in one release still reach the previous one
        let mut v4 = Bundle::new("etcd.v0.9.6", "etcd", v("0.9.6"));
        v4.replaces = Some("etcd.v0.9.4".to_string());
        next.add_bundle(v4).unwrap();
        assert!(check_continuity(&previous, &next).unwrap().is_empty());
    }

    #[test]
    fn detached_chain_is_reported() {
        let previous = etcd_catalog();

        // The new release restarts etcd from a fresh root
        let mut next = Catalog::new(SourceKey::new("community", "olm"));
        next.add_package(etcd_package("etcd.v1.0.1"));
        next.add_bundle(Bundle::new("etcd.v1.0.0", "etcd", v("1.0.0")))
            .unwrap();
        let mut b = Bundle::new("etcd.v1.0.1", "etcd", v("1.0.1"));
        b.replaces = Some("etcd.v1.0.0".to_string());
        next.add_bundle(b).unwrap();

        let issues = check_continuity(&previous, &next).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].bundle, "etcd.v1.0.1");
        assert!(issues[0].to_string().contains("etcd.v1.0.0"));
    }

    #[test]
    fn new_packages_are_exempt() {
        let previous = Catalog::new(SourceKey::new("community", "olm"));
        let next = etcd_catalog();
        assert!(check_continuity(&previous, &next).unwrap().is_empty());
    }
}

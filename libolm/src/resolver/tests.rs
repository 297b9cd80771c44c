//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::catalog::tests::{etcd_catalog, v};
use crate::catalog::{Channel, InstallMode, InstallModeType, Package};
use crate::cluster::{OperatorGroup, SubscriptionSpec, SubscriptionStatus};
use crate::config::SolverBackend;

const NS: &str = "operators";

fn etcd_api() -> Api {
    Api::new("etcd.database.coreos.com", "v1beta2", "EtcdCluster")
}

fn add_single(catalog: &mut Catalog, bundle: Bundle) {
    catalog.add_package(Package {
        name: bundle.package.clone(),
        default_channel_name: "stable".to_string(),
        channels: vec![Channel {
            name: "stable".to_string(),
            package: bundle.package.clone(),
            current_csv_name: bundle.name.clone(),
        }],
        description: None,
    });
    catalog.add_bundle(bundle).unwrap();
}

/// etcd (two versions) plus vault, which needs an EtcdCluster
fn community() -> Catalog {
    let mut catalog = etcd_catalog();
    let mut vault = Bundle::new("vault.v0.1.0", "vault", v("0.1.0"));
    vault.required_apis.insert(etcd_api());
    add_single(&mut catalog, vault);
    catalog
}

fn registry_with(catalog: Catalog) -> SourceRegistry {
    let registry = SourceRegistry::new();
    registry.register(catalog);
    registry
}

fn sub(name: &str, package: &str) -> Subscription {
    Subscription {
        name: name.to_string(),
        namespace: NS.to_string(),
        spec: SubscriptionSpec {
            package: package.to_string(),
            source: "community".to_string(),
            source_namespace: "olm".to_string(),
            ..Default::default()
        },
        status: SubscriptionStatus::default(),
    }
}

fn state(subscriptions: Vec<Subscription>) -> ClusterState {
    ClusterState {
        subscriptions,
        operator_groups: vec![OperatorGroup {
            name: "global".to_string(),
            namespace: NS.to_string(),
            target_namespaces: Vec::new(),
            service_account_name: None,
        }],
        ..Default::default()
    }
}

fn installed(catalog: &Catalog, package: &str, name: &str) -> InstalledOperator {
    let bundle = catalog.graph(package).unwrap().get(name).unwrap().clone();
    InstalledOperator::new(NS, bundle)
}

fn resolve(registry: &SourceRegistry, state: &ClusterState) -> Result<NamespaceResolution> {
    Resolver::new(&ResolverConfig::default(), registry).resolve_namespace(state, NS)
}

#[test]
fn fresh_install_takes_channel_head() {
    let registry = registry_with(community());
    let res = resolve(&registry, &state(vec![sub("etcd", "etcd")])).unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.2"]);
    assert_eq!(
        res.outcomes["etcd"],
        SubscriptionOutcome::Install {
            csv: "etcd.v0.9.2".to_string(),
            replaces: None
        }
    );
    assert_eq!(
        res.bundles[0].selection,
        Selection::Subscribed {
            subscription: "etcd".to_string()
        }
    );
    assert_eq!(res.bundles[0].source, SourceKey::new("community", "olm"));
}

#[test]
fn starting_csv_pins_the_first_install() {
    let registry = registry_with(community());
    let mut s = sub("etcd", "etcd");
    s.spec.starting_csv = Some("etcd.v0.9.0".to_string());
    let res = resolve(&registry, &state(vec![s])).unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.0"]);

    let mut s = sub("etcd", "etcd");
    s.spec.starting_csv = Some("etcd.v0.0.1".to_string());
    let err = resolve(&registry, &state(vec![s])).unwrap_err();
    assert_eq!(err.reason(), FailureReason::NotFound);
    assert_eq!(err.subscription(), Some("etcd"));
}

#[test]
fn installed_operator_upgrades_towards_head() {
    let catalog = community();
    let mut st = state(vec![sub("etcd", "etcd")]);
    st.installed.push(installed(&catalog, "etcd", "etcd.v0.9.0"));
    let registry = registry_with(catalog);

    let res = resolve(&registry, &st).unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.2"]);
    assert_eq!(res.bundles[0].replaces.as_deref(), Some("etcd.v0.9.0"));
    assert_eq!(
        res.outcomes["etcd"],
        SubscriptionOutcome::Install {
            csv: "etcd.v0.9.2".to_string(),
            replaces: Some("etcd.v0.9.0".to_string())
        }
    );
}

#[test]
fn operator_at_head_is_a_noop() {
    let catalog = community();
    let mut st = state(vec![sub("etcd", "etcd")]);
    st.installed.push(installed(&catalog, "etcd", "etcd.v0.9.2"));
    let registry = registry_with(catalog);

    let res = resolve(&registry, &st).unwrap();
    assert!(res.is_noop());
    assert_eq!(
        res.outcomes["etcd"],
        SubscriptionOutcome::UpToDate {
            csv: "etcd.v0.9.2".to_string()
        }
    );
}

#[test]
fn install_newer_than_head_is_not_downgraded() {
    let mut catalog = Catalog::new(SourceKey::new("community", "olm"));
    let mut head = Bundle::new("etcd.v1.2.0", "etcd", v("1.2.0"));
    head.skip_range = Some("<2.0.0".parse().unwrap());
    add_single(&mut catalog, head);
    let mut st = state(vec![sub("etcd", "etcd")]);
    st.installed.push(InstalledOperator::new(
        NS,
        Bundle::new("etcd.v1.5.0", "etcd", v("1.5.0")),
    ));
    let registry = registry_with(catalog);

    let res = resolve(&registry, &st).unwrap();
    assert!(res.is_noop());
    assert_eq!(
        res.outcomes["etcd"],
        SubscriptionOutcome::UpToDate {
            csv: "etcd.v1.5.0".to_string()
        }
    );
}

#[test]
fn required_api_pulls_in_newest_provider_first() {
    let registry = registry_with(community());
    let res = resolve(&registry, &state(vec![sub("vault", "vault")])).unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.2", "vault.v0.1.0"]);
    assert_eq!(
        res.bundles[0].selection,
        Selection::Dependency {
            channel: "stable".to_string()
        }
    );
    assert_eq!(res.outcomes.len(), 1);
}

#[test]
fn installed_provider_satisfies_dependency() {
    let catalog = community();
    let mut st = state(vec![sub("vault", "vault")]);
    st.installed.push(installed(&catalog, "etcd", "etcd.v0.9.0"));
    let registry = registry_with(catalog);

    let res = resolve(&registry, &st).unwrap();
    assert_eq!(res.csv_names(), vec!["vault.v0.1.0"]);
}

#[test]
fn required_package_honors_version_range() {
    let mut catalog = community();
    let mut backup = Bundle::new("backup.v1.0.0", "backup", v("1.0.0"));
    backup.required_packages.push(crate::catalog::PackageRequirement {
        package_name: "etcd".to_string(),
        version_range: "<0.9.1".parse().unwrap(),
    });
    add_single(&mut catalog, backup);
    let registry = registry_with(catalog);

    let res = resolve(&registry, &state(vec![sub("backup", "backup")])).unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.0", "backup.v1.0.0"]);
}

#[test]
fn second_owner_of_installed_api_is_ambiguous() {
    let catalog = community();
    let mut fork = Bundle::new("etcd-fork.v1.0.0", "etcd-fork", v("1.0.0"));
    fork.provided_apis.insert(etcd_api());
    let mut st = state(vec![sub("etcd", "etcd")]);
    st.installed.push(InstalledOperator::new(NS, fork));
    let registry = registry_with(catalog);

    let err = resolve(&registry, &st).unwrap_err();
    assert_eq!(err.reason(), FailureReason::AmbiguousApi);
    assert_eq!(err.subscription(), Some("etcd"));
    let ResolutionError::AmbiguousApi { api, providers, .. } = err else {
        panic!("expected AmbiguousApi");
    };
    assert_eq!(api, etcd_api());
    assert_eq!(providers, vec!["etcd-fork.v1.0.0", "etcd.v0.9.2"]);
}

#[test]
fn competing_providers_in_catalog_are_exclusive() {
    let mut catalog = community();
    let mut fork = Bundle::new("etcd-fork.v1.0.0", "etcd-fork", v("1.0.0"));
    fork.provided_apis.insert(etcd_api());
    add_single(&mut catalog, fork);
    let registry = registry_with(catalog);

    // Both packages could satisfy vault; exactly one gets installed
    let res = resolve(&registry, &state(vec![sub("vault", "vault")])).unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.2", "vault.v0.1.0"]);

    // With etcd already installed the fork can not be selected
    let mut st = state(vec![sub("vault", "vault")]);
    st.installed.push(installed(&community(), "etcd", "etcd.v0.9.2"));
    let res = resolve(&registry, &st).unwrap();
    assert_eq!(res.csv_names(), vec!["vault.v0.1.0"]);
}

#[test]
fn missing_package_and_source_are_not_found() {
    let registry = registry_with(community());
    let err = resolve(&registry, &state(vec![sub("nope", "nope")])).unwrap_err();
    assert_eq!(err.reason(), FailureReason::NotFound);
    assert!(err.to_string().contains("package nope not found"));

    let mut s = sub("etcd", "etcd");
    s.spec.source = "missing".to_string();
    let err = resolve(&registry, &state(vec![s])).unwrap_err();
    assert_eq!(err.subscription(), Some("etcd"));
    assert!(err.to_string().contains("olm/missing"));

    let mut s = sub("etcd", "etcd");
    s.spec.channel = "alpha".to_string();
    let err = resolve(&registry, &state(vec![s])).unwrap_err();
    assert!(err.to_string().contains("channel alpha not found"));
}

#[test]
fn catalogs_of_other_namespaces_are_invisible() {
    let mut catalog = Catalog::new(SourceKey::new("private", "team-b"));
    add_single(&mut catalog, Bundle::new("etcd.v1.0.0", "etcd", v("1.0.0")));
    let registry = registry_with(catalog);
    let mut s = sub("etcd", "etcd");
    s.spec.source = "private".to_string();
    s.spec.source_namespace = "team-b".to_string();
    let err = resolve(&registry, &state(vec![s])).unwrap_err();
    assert_eq!(err.reason(), FailureReason::NotFound);
}

#[test]
fn namespace_without_operator_group_is_forbidden() {
    let registry = registry_with(community());
    let mut st = state(vec![sub("etcd", "etcd")]);
    st.operator_groups.clear();
    let err = resolve(&registry, &st).unwrap_err();
    assert_eq!(err.reason(), FailureReason::Forbidden);
    assert_eq!(err.subscription(), None);
}

#[test]
fn unsupported_install_mode_is_forbidden() {
    let mut catalog = Catalog::new(SourceKey::new("community", "olm"));
    let mut own_only = Bundle::new("local.v1.0.0", "local", v("1.0.0"));
    own_only.install_modes = vec![InstallMode {
        mode: InstallModeType::OwnNamespace,
        supported: true,
    }];
    add_single(&mut catalog, own_only);
    let registry = registry_with(catalog);

    let err = resolve(&registry, &state(vec![sub("local", "local")])).unwrap_err();
    assert_eq!(err.reason(), FailureReason::Forbidden);
    assert_eq!(err.subscription(), Some("local"));
}

#[test]
fn dependency_in_wrong_install_mode_is_filtered() {
    let mut catalog = Catalog::new(SourceKey::new("community", "olm"));
    let mut provider = Bundle::new("etcd.v1.0.0", "etcd", v("1.0.0"));
    provider.provided_apis.insert(etcd_api());
    provider.install_modes = vec![InstallMode {
        mode: InstallModeType::OwnNamespace,
        supported: true,
    }];
    add_single(&mut catalog, provider);
    let mut vault = Bundle::new("vault.v0.1.0", "vault", v("0.1.0"));
    vault.required_apis.insert(etcd_api());
    add_single(&mut catalog, vault);
    let registry = registry_with(catalog);

    let err = resolve(&registry, &state(vec![sub("vault", "vault")])).unwrap_err();
    assert_eq!(err.reason(), FailureReason::ConstraintsNotSatisfiable);
    assert!(err
        .to_string()
        .contains("no provider supports install mode AllNamespaces"));
}

#[test]
fn missing_api_is_unsatisfiable() {
    let mut catalog = Catalog::new(SourceKey::new("community", "olm"));
    let mut vault = Bundle::new("vault.v0.1.0", "vault", v("0.1.0"));
    vault.required_apis.insert(etcd_api());
    add_single(&mut catalog, vault);
    let registry = registry_with(catalog);

    let err = resolve(&registry, &state(vec![sub("vault", "vault")])).unwrap_err();
    let ResolutionError::ConstraintsNotSatisfiable { reasons } = err else {
        panic!("expected ConstraintsNotSatisfiable");
    };
    assert_eq!(
        reasons,
        vec!["vault.v0.1.0 requires api etcd.database.coreos.com/v1beta2/EtcdCluster".to_string()]
    );
}

#[test]
fn resolution_is_deterministic() {
    let registry = registry_with(community());
    let st = state(vec![sub("vault", "vault"), sub("etcd", "etcd")]);
    let first = resolve(&registry, &st).unwrap();
    for _ in 0..5 {
        assert_eq!(resolve(&registry, &st).unwrap(), first);
    }
    // The subscribed etcd head doubles as vault's provider
    assert_eq!(first.csv_names(), vec!["etcd.v0.9.2", "vault.v0.1.0"]);
    assert_eq!(
        first.bundles[0].selection,
        Selection::Subscribed {
            subscription: "etcd".to_string()
        }
    );
}

#[test]
fn empty_namespace_resolves_to_nothing() {
    let registry = registry_with(community());
    let res = resolve(&registry, &ClusterState::default()).unwrap();
    assert!(res.is_noop());
    assert!(res.outcomes.is_empty());
}

#[test]
fn sat_backend_agrees_on_simple_dependency() {
    let registry = registry_with(community());
    let config = ResolverConfig {
        solver: SolverBackend::Sat,
        ..Default::default()
    };
    let res = Resolver::new(&config, &registry)
        .resolve_namespace(&state(vec![sub("vault", "vault")]), NS)
        .unwrap();
    assert_eq!(res.csv_names(), vec!["etcd.v0.9.2", "vault.v0.1.0"]);
}

#[test]
fn home_catalog_provider_wins_on_every_backend() {
    let mut other = Catalog::new(SourceKey::new("other", "olm"));
    let mut early = Bundle::new("aaa-etcd.v9.0.0", "aaa-etcd", v("9.0.0"));
    early.provided_apis.insert(etcd_api());
    add_single(&mut other, early);
    let mut newer = Bundle::new("etcd.v1.0.0", "etcd", v("1.0.0"));
    newer.provided_apis.insert(etcd_api());
    add_single(&mut other, newer);
    let registry = registry_with(community());
    registry.register(other);

    for solver in [SolverBackend::Greedy, SolverBackend::Sat] {
        let config = ResolverConfig {
            solver,
            ..Default::default()
        };
        let res = Resolver::new(&config, &registry)
            .resolve_namespace(&state(vec![sub("vault", "vault")]), NS)
            .unwrap();
        assert_eq!(res.csv_names(), vec!["etcd.v0.9.2", "vault.v0.1.0"], "{}", solver);
        let etcd = res.bundles.iter().find(|b| b.bundle.name == "etcd.v0.9.2").unwrap();
        assert_eq!(etcd.source, SourceKey::new("community", "olm"), "{}", solver);
    }
}

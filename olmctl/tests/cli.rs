//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CATALOG: &str = r#"
schema: olm.package
name: etcd
defaultChannel: stable
---
schema: olm.channel
package: etcd
name: stable
entries:
  - name: etcd.v0.9.0
  - name: etcd.v0.9.2
    replaces: etcd.v0.9.0
---
schema: olm.bundle
name: etcd.v0.9.0
package: etcd
properties:
  - {type: olm.package, value: {packageName: etcd, version: 0.9.0}}
  - {type: olm.gvk, value: {group: etcd.database.coreos.com, version: v1beta2, kind: EtcdCluster}}
---
schema: olm.bundle
name: etcd.v0.9.2
package: etcd
properties:
  - {type: olm.package, value: {packageName: etcd, version: 0.9.2}}
  - {type: olm.gvk, value: {group: etcd.database.coreos.com, version: v1beta2, kind: EtcdCluster}}
"#;

const STATE: &str = r#"
subscriptions:
  - name: etcd
    namespace: operators
    spec:
      name: etcd
      source: community
      sourceNamespace: olm
operatorGroups:
  - name: global-operators
    namespace: operators
"#;

fn olmctl() -> Command {
    let mut cmd = Command::cargo_bin("olmctl").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn crd(versions: &[&str], stored: &[&str]) -> String {
    let last = versions.len() - 1;
    let mut out = String::from(
        "apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: etcdclusters.etcd.database.coreos.com
spec:
  group: etcd.database.coreos.com
  names:
    plural: etcdclusters
    kind: EtcdCluster
  scope: Namespaced
  versions:
",
    );
    for (i, v) in versions.iter().enumerate() {
        out.push_str(&format!(
            "  - name: {v}\n    served: true\n    storage: {}\n",
            i == last
        ));
    }
    if !stored.is_empty() {
        out.push_str(&format!("status:\n  storedVersions: [{}]\n", stored.join(", ")));
    }
    out
}

fn write_release(root: &Path, bundles: &[(&str, &str, Option<&str>)], head: &str) {
    let pkg = root.join("etcd");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(
        pkg.join("etcd.package.yaml"),
        format!("packageName: etcd\nchannels:\n- name: alpha\n  currentCSV: {head}\n"),
    )
    .unwrap();
    for (name, version, replaces) in bundles {
        let dir = pkg.join(version);
        fs::create_dir_all(&dir).unwrap();
        let replaces = replaces
            .map(|r| format!("  replaces: {r}\n"))
            .unwrap_or_default();
        fs::write(
            dir.join(format!("{name}.clusterserviceversion.yaml")),
            format!(
                "apiVersion: operators.coreos.com/v1alpha1
kind: ClusterServiceVersion
metadata:
  name: {name}
spec:
  version: {version}
{replaces}"
            ),
        )
        .unwrap();
    }
}

#[test]
fn validate_lists_channel_heads() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.yaml", CATALOG);
    olmctl()
        .arg("validate")
        .arg(&catalog)
        .assert()
        .success()
        .stdout(predicate::str::contains("etcd\tstable (default)\tetcd.v0.9.2"))
        .stdout(predicate::str::contains("1 package(s), 2 bundle(s)"));
}

#[test]
fn validate_rejects_dangling_replaces() {
    let dir = TempDir::new().unwrap();
    write_release(
        dir.path(),
        &[("etcdoperator.v0.9.2", "0.9.2", Some("etcdoperator.v0.9.0"))],
        "etcdoperator.v0.9.2",
    );
    olmctl()
        .arg("validate")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("etcdoperator.v0.9.0"));
}

#[test]
fn continuity_passes_and_fails() {
    let previous = TempDir::new().unwrap();
    let next = TempDir::new().unwrap();
    let broken = TempDir::new().unwrap();
    write_release(
        previous.path(),
        &[("etcdoperator.v0.9.0", "0.9.0", None)],
        "etcdoperator.v0.9.0",
    );
    write_release(
        next.path(),
        &[
            ("etcdoperator.v0.9.0", "0.9.0", None),
            ("etcdoperator.v0.9.2", "0.9.2", Some("etcdoperator.v0.9.0")),
        ],
        "etcdoperator.v0.9.2",
    );
    write_release(
        broken.path(),
        &[
            ("etcdoperator.v1.0.0", "1.0.0", None),
            ("etcdoperator.v1.1.0", "1.1.0", Some("etcdoperator.v1.0.0")),
        ],
        "etcdoperator.v1.1.0",
    );

    olmctl()
        .args(["continuity", "--format", "manifests"])
        .arg(previous.path())
        .arg(next.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("connect to the previous release"));

    olmctl()
        .arg("continuity")
        .arg(next.path())
        .arg(broken.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains(
            "etcdoperator.v1.1.0 (etcd) replaces etcdoperator.v1.0.0",
        ));
}

#[test]
fn resolve_prints_install_plan() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.yaml", CATALOG);
    let state = write(&dir, "state.yaml", STATE);
    olmctl()
        .arg("resolve")
        .arg(&state)
        .arg("--catalog")
        .arg(format!("community/olm={}", catalog.display()))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"installPlans\""))
        .stdout(predicate::str::contains("\"currentCSV\": \"etcd.v0.9.2\""))
        .stdout(predicate::str::contains("\"state\": \"UpgradePending\""));
}

#[test]
fn resolve_reads_catalogs_from_config() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.yaml", CATALOG);
    let state = write(&dir, "state.yaml", STATE);
    let config = write(
        &dir,
        "olmctl.kdl",
        &format!(
            "catalog \"community\" namespace=\"olm\" path=\"{}\" format=\"declcfg\"\nresolver {{\n    solver \"sat\"\n}}\n",
            catalog.display()
        ),
    );
    olmctl()
        .arg("--config")
        .arg(&config)
        .arg("resolve")
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("etcd.v0.9.2"));
}

#[test]
fn resolve_reports_missing_package() {
    let dir = TempDir::new().unwrap();
    let catalog = write(&dir, "catalog.yaml", CATALOG);
    let state = write(&dir, "state.yaml", &STATE.replace("name: etcd\n      source", "name: vault\n      source"));
    olmctl()
        .arg("resolve")
        .arg(&state)
        .arg("-k")
        .arg(format!("community/olm={}", catalog.display()))
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"reason\": \"NotFound\""))
        .stderr(predicate::str::contains("resolution failed in 1 namespace(s)"));
}

#[test]
fn check_crd_guards_stored_versions() {
    let dir = TempDir::new().unwrap();
    let existing = write(&dir, "existing.yaml", &crd(&["v1beta1", "v1beta2"], &["v1beta1", "v1beta2"]));
    let widened = write(&dir, "widened.yaml", &crd(&["v1beta1", "v1beta2", "v1"], &[]));
    let narrowed = write(&dir, "narrowed.yaml", &crd(&["v1beta2"], &[]));

    olmctl()
        .arg("check-crd")
        .arg(&existing)
        .arg(&widened)
        .assert()
        .success()
        .stdout(predicate::str::contains("keeps stored version(s) v1beta1, v1beta2"));

    olmctl()
        .arg("check-crd")
        .arg(&existing)
        .arg(&narrowed)
        .assert()
        .failure()
        .stderr(predicate::str::contains("risk of data loss"));
}

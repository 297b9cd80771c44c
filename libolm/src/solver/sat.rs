//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! resolvo-backed satisfiability.
//!
//! Groups become resolvo names and variables become solvables, so resolvo's
//! one-solvable-per-name rule carries the group constraint. A requirement is a
//! union of per-group version sets listing the allowed candidates. A conflict
//! is expressed through `constrains`: selecting one member constrains every
//! other group of the conflict to the variables outside of it.

use super::{Assignment, Problem, Result, Satisfier, SolverError, VarId};
use resolvo::{
    Candidates, Condition, ConditionId, ConditionalRequirement, Dependencies as RDependencies,
    DependencyProvider, HintDependenciesAvailable, Interner, KnownDependencies, Mapping, NameId,
    Problem as RProblem, Requirement as RRequirement, SolvableId, Solver as RSolver, SolverCache,
    StringId, UnsolvableOrCancelled, VersionSetId, VersionSetUnionId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use tracing::debug;

/// Satisfier delegating to resolvo's CDCL solver
#[derive(Debug, Clone, Copy, Default)]
pub struct SatSatisfier;

impl Satisfier for SatSatisfier {
    fn name(&self) -> &'static str {
        "sat"
    }

    fn satisfy(&self, problem: &Problem) -> Result<Assignment> {
        problem.check()?;
        if let Some(r) = problem
            .mandatory_requirements()
            .find(|r| r.candidates.is_empty())
        {
            return Err(SolverError::Unsatisfiable {
                reasons: vec![r.description.clone()],
            });
        }

        let mut provider = ProblemProvider::new(problem);
        let roots = provider.encode();
        let mut solver = RSolver::new(provider);
        let solved = solver
            .solve(RProblem::default().requirements(roots))
            .map_err(|e| match e {
                UnsolvableOrCancelled::Unsolvable(u) => SolverError::Unsatisfiable {
                    reasons: vec![u.display_user_friendly(&solver).to_string()],
                },
                UnsolvableOrCancelled::Cancelled(_) => SolverError::Unsatisfiable {
                    reasons: vec!["resolution cancelled".to_string()],
                },
            })?;

        let assignment = Assignment::new(solved.into_iter().map(|s| s.0 as VarId));
        if let Some(violation) = problem.violation(&assignment) {
            return Err(SolverError::InvalidProblem(format!(
                "solver returned a model violating: {}",
                violation
            )));
        }
        debug!(selected = assignment.len(), "sat search found a model");
        Ok(assignment)
    }
}

#[derive(Debug, Clone)]
struct VersionSet {
    name: NameId,
    members: BTreeSet<VarId>,
    label: String,
}

struct ProblemProvider<'p> {
    problem: &'p Problem,
    names: Mapping<NameId, String>,
    name_ids: BTreeMap<String, NameId>,
    solvable_names: Mapping<SolvableId, NameId>,
    candidates: BTreeMap<NameId, Vec<SolvableId>>,
    version_sets: Mapping<VersionSetId, VersionSet>,
    unions: Mapping<VersionSetUnionId, Vec<VersionSetId>>,
    requirements: BTreeMap<VarId, Vec<ConditionalRequirement>>,
    constrains: BTreeMap<VarId, Vec<VersionSetId>>,
}

impl<'p> ProblemProvider<'p> {
    fn new(problem: &'p Problem) -> Self {
        let mut provider = ProblemProvider {
            problem,
            names: Mapping::default(),
            name_ids: BTreeMap::new(),
            solvable_names: Mapping::default(),
            candidates: BTreeMap::new(),
            version_sets: Mapping::default(),
            unions: Mapping::default(),
            requirements: BTreeMap::new(),
            constrains: BTreeMap::new(),
        };
        for (v, variable) in problem.variables().iter().enumerate() {
            let name = provider.intern_name(&variable.group);
            let sid = SolvableId(v as u32);
            provider.solvable_names.insert(sid, name);
            provider.candidates.entry(name).or_default().push(sid);
        }
        provider
    }

    fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(id) = self.name_ids.get(name).copied() {
            return id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.insert(id, name.to_string());
        self.name_ids.insert(name.to_string(), id);
        id
    }

    fn name_of(&self, v: VarId) -> NameId {
        self.solvable_names
            .get(SolvableId(v as u32))
            .copied()
            .unwrap_or(NameId(0))
    }

    fn version_set(&mut self, name: NameId, members: BTreeSet<VarId>) -> VersionSetId {
        let labels: Vec<&str> = members
            .iter()
            .filter_map(|&m| self.problem.variable(m))
            .map(|v| v.label.as_str())
            .collect();
        let label = if labels.is_empty() {
            "nothing".to_string()
        } else {
            labels.join(" | ")
        };
        let id = VersionSetId(self.version_sets.len() as u32);
        self.version_sets.insert(
            id,
            VersionSet {
                name,
                members,
                label,
            },
        );
        id
    }

    /// Turn a candidate list into a single requirement spanning its groups
    fn requirement(&mut self, candidates: &[VarId], fallback: NameId) -> ConditionalRequirement {
        let mut per_name: Vec<(NameId, BTreeSet<VarId>)> = Vec::new();
        for &c in candidates {
            let name = self.name_of(c);
            match per_name.iter_mut().find(|(n, _)| *n == name) {
                Some((_, set)) => {
                    set.insert(c);
                }
                None => per_name.push((name, BTreeSet::from([c]))),
            }
        }
        if per_name.is_empty() {
            // Nothing can satisfy it; an empty set on the subject's own name
            // makes the subject uninstallable
            per_name.push((fallback, BTreeSet::new()));
        }
        let sets: Vec<VersionSetId> = per_name
            .into_iter()
            .map(|(name, members)| self.version_set(name, members))
            .collect();
        if sets.len() == 1 {
            return ConditionalRequirement::from(sets[0]);
        }
        let union = VersionSetUnionId(self.unions.len() as u32);
        self.unions.insert(union, sets);
        ConditionalRequirement {
            condition: None,
            requirement: RRequirement::Union(union),
        }
    }

    /// Build all dependency data and return the root requirements
    fn encode(&mut self) -> Vec<ConditionalRequirement> {
        let problem = self.problem;
        let mut roots = Vec::new();
        for r in problem.requirements() {
            match r.subject {
                None => {
                    let req = self.requirement(&r.candidates, NameId(0));
                    roots.push(req);
                }
                Some(subject) => {
                    let req = self.requirement(&r.candidates, self.name_of(subject));
                    self.requirements.entry(subject).or_default().push(req);
                }
            }
        }

        for conflict in problem.conflicts() {
            let members: BTreeSet<VarId> = conflict.members.iter().copied().collect();
            let groups: BTreeSet<NameId> = members.iter().map(|&m| self.name_of(m)).collect();
            for &member in &members {
                let own = self.name_of(member);
                for &group in groups.iter().filter(|&&g| g != own) {
                    let allowed: BTreeSet<VarId> = self
                        .candidates
                        .get(&group)
                        .into_iter()
                        .flatten()
                        .map(|s| s.0 as VarId)
                        .filter(|v| !members.contains(v))
                        .collect();
                    let set = self.version_set(group, allowed);
                    self.constrains.entry(member).or_default().push(set);
                }
            }
        }
        roots
    }
}

impl Interner for ProblemProvider<'_> {
    fn display_solvable(&self, solvable: SolvableId) -> impl Display + '_ {
        self.problem
            .variable(solvable.0 as VarId)
            .map(|v| v.label.clone())
            .unwrap_or_default()
    }

    fn display_solvable_name(&self, solvable: SolvableId) -> impl Display + '_ {
        let name = self.solvable_name(solvable);
        self.display_name(name).to_string()
    }

    fn display_merged_solvables(&self, solvables: &[SolvableId]) -> impl Display + '_ {
        solvables
            .iter()
            .map(|s| self.display_solvable(*s).to_string())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn display_name(&self, name: NameId) -> impl Display + '_ {
        self.names.get(name).cloned().unwrap_or_default()
    }

    fn display_version_set(&self, version_set: VersionSetId) -> impl Display + '_ {
        self.version_sets
            .get(version_set)
            .map(|vs| vs.label.clone())
            .unwrap_or_default()
    }

    fn display_string(&self, _string_id: StringId) -> impl Display + '_ {
        String::new()
    }

    fn version_set_name(&self, version_set: VersionSetId) -> NameId {
        self.version_sets
            .get(version_set)
            .map(|vs| vs.name)
            .unwrap_or(NameId(0))
    }

    fn solvable_name(&self, solvable: SolvableId) -> NameId {
        self.name_of(solvable.0 as VarId)
    }

    fn version_sets_in_union(
        &self,
        version_set_union: VersionSetUnionId,
    ) -> impl Iterator<Item = VersionSetId> {
        self.unions
            .get(version_set_union)
            .cloned()
            .unwrap_or_default()
            .into_iter()
    }

    fn resolve_condition(&self, condition: ConditionId) -> Condition {
        // No conditional requirements are generated
        Condition::Requirement(VersionSetId(condition.as_u32()))
    }
}

impl DependencyProvider for ProblemProvider<'_> {
    async fn filter_candidates(
        &self,
        candidates: &[SolvableId],
        version_set: VersionSetId,
        inverse: bool,
    ) -> Vec<SolvableId> {
        let Some(set) = self.version_sets.get(version_set) else {
            return if inverse { candidates.to_vec() } else { vec![] };
        };
        candidates
            .iter()
            .copied()
            .filter(|s| set.members.contains(&(s.0 as VarId)) != inverse)
            .collect()
    }

    async fn get_candidates(&self, name: NameId) -> Option<Candidates> {
        let list = self.candidates.get(&name)?;
        Some(Candidates {
            candidates: list.clone(),
            favored: None,
            locked: None,
            hint_dependencies_available: HintDependenciesAvailable::None,
            excluded: vec![],
        })
    }

    async fn sort_candidates(&self, _solver: &SolverCache<Self>, solvables: &mut [SolvableId]) {
        // Variables are declared most preferred first, and every requirement
        // lists its candidates in ascending variable order
        solvables.sort_by_key(|s| s.0);
    }

    async fn get_dependencies(&self, solvable: SolvableId) -> RDependencies {
        let v = solvable.0 as VarId;
        RDependencies::Known(KnownDependencies {
            requirements: self.requirements.get(&v).cloned().unwrap_or_default(),
            constrains: self.constrains.get(&v).cloned().unwrap_or_default(),
        })
    }
}

//! Staleness classification and update planning
//!
//! Planning is pure: it takes the scanned records together with their
//! staleness assessments and produces an ordered list of steps. Nothing
//! here talks to the runtime.

use crate::error::PlanError;
use crate::models::{Action, ContainerRecord, CycleKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Result of comparing a container against its registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Stale { current: String, latest: String },
    Fresh,
    /// Locally built image, nothing to compare against
    NoDigest,
    LookupFailed(String),
}

impl Assessment {
    pub fn classify(current: Option<&str>, latest: Result<String, String>) -> Self {
        match (current, latest) {
            (None, _) => Assessment::NoDigest,
            (Some(_), Err(e)) => Assessment::LookupFailed(e),
            (Some(current), Ok(latest)) if current == latest => Assessment::Fresh,
            (Some(current), Ok(latest)) => Assessment::Stale {
                current: current.to_string(),
                latest,
            },
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Assessment::Stale { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub container: String,
    pub action: Action,
    pub reason: String,
    /// Recreated containers this restart exists for. Empty for targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePlan {
    pub steps: Vec<PlanStep>,
}

impl UpdatePlan {
    fn push(&mut self, container: &str, action: Action, reason: impl Into<String>) {
        self.steps.push(PlanStep {
            container: container.to_string(),
            action,
            reason: reason.into(),
            after: Vec::new(),
        });
    }

    fn push_restart(&mut self, container: &str, action: Action, after: &[String]) {
        self.steps.push(PlanStep {
            container: container.to_string(),
            action,
            reason: format!("depends on {}", after.join(", ")),
            after: after.to_vec(),
        });
    }

    pub fn actions_for(&self, container: &str) -> Vec<Action> {
        self.steps
            .iter()
            .filter(|s| s.container == container)
            .map(|s| s.action)
            .collect()
    }

    /// Containers whose only step is `Skip`
    pub fn skipped(&self) -> usize {
        let mut acting = HashSet::new();
        let mut skipping = HashSet::new();
        for step in &self.steps {
            if step.action == Action::Skip {
                skipping.insert(step.container.as_str());
            } else {
                acting.insert(step.container.as_str());
            }
        }
        skipping.difference(&acting).count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub monitor_only: bool,
    pub rolling_restart: bool,
}

/// Order records so every container follows the containers it depends on.
///
/// Edges to containers outside the batch are ignored. Among containers
/// whose dependencies are satisfied, the earliest scanned goes first.
pub fn topo_sort(records: &[ContainerRecord]) -> Result<Vec<usize>, PlanError> {
    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; records.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for (i, record) in records.iter().enumerate() {
        let deps: BTreeSet<usize> = record
            .spec
            .depends_on
            .iter()
            .filter_map(|name| index.get(name.as_str()).copied())
            .collect();
        for dep in deps {
            indegree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..records.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(records.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < records.len() {
        let members = (0..records.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| records[i].name.clone())
            .collect();
        return Err(PlanError::DependencyCycle(members));
    }
    Ok(order)
}

/// Fresh active containers that transitively depend on one of `targets`,
/// each with the targets it depends on in scan order
fn affected_dependents(
    records: &[ContainerRecord],
    targets: &HashSet<usize>,
) -> HashMap<usize, Vec<String>> {
    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for (i, record) in records.iter().enumerate() {
        for dep in &record.spec.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut found: HashMap<usize, Vec<String>> = HashMap::new();
    let mut ordered: Vec<usize> = targets.iter().copied().collect();
    ordered.sort_unstable();
    for target in ordered {
        let mut queue = VecDeque::from([target]);
        let mut seen = HashSet::from([target]);
        while let Some(current) = queue.pop_front() {
            for &dependent in &dependents[current] {
                if targets.contains(&dependent) || !seen.insert(dependent) {
                    continue;
                }
                let record = &records[dependent];
                if record.is_self || !record.status.is_active() {
                    continue;
                }
                found
                    .entry(dependent)
                    .or_default()
                    .push(records[target].name.clone());
                queue.push_back(dependent);
            }
        }
    }
    found
}

fn skip_reason(record: &ContainerRecord, assessment: &Assessment) -> Option<String> {
    if record.is_self {
        return Some("agent's own container".to_string());
    }
    match assessment {
        Assessment::Fresh => Some("up to date".to_string()),
        Assessment::NoDigest => Some("no registry digest".to_string()),
        Assessment::LookupFailed(e) => Some(format!("registry lookup failed: {e}")),
        Assessment::Stale { .. } if !record.status.is_active() => {
            Some(format!("not running ({})", record.status))
        }
        Assessment::Stale { .. } => None,
    }
}

fn stale_reason(assessment: &Assessment) -> String {
    match assessment {
        Assessment::Stale { current, latest } => format!("stale: {current} -> {latest}"),
        _ => String::new(),
    }
}

/// Build the ordered plan for one cycle.
///
/// `assessments[i]` belongs to `records[i]`.
pub fn build_plan(
    records: &[ContainerRecord],
    assessments: &[Assessment],
    kind: CycleKind,
    options: PlanOptions,
) -> Result<UpdatePlan, PlanError> {
    let order = topo_sort(records)?;
    let mut plan = UpdatePlan::default();

    let mut targets = HashSet::new();
    for (i, (record, assessment)) in records.iter().zip(assessments).enumerate() {
        match skip_reason(record, assessment) {
            Some(reason) => plan.push(&record.name, Action::Skip, reason),
            None if options.monitor_only => plan.push(&record.name, Action::Skip, "monitor only"),
            None => {
                targets.insert(i);
            }
        }
    }

    if kind == CycleKind::Download {
        for &i in order.iter().filter(|i| targets.contains(i)) {
            plan.push(&records[i].name, Action::Pull, stale_reason(&assessments[i]));
        }
        return Ok(plan);
    }

    let dependents = affected_dependents(records, &targets);
    // Fresh dependents already carry a Skip; they still get restarted.
    let affected: Vec<usize> = order
        .iter()
        .copied()
        .filter(|i| targets.contains(i) || dependents.contains_key(i))
        .collect();

    if options.rolling_restart {
        for &i in &affected {
            let name = &records[i].name;
            if targets.contains(&i) {
                let reason = stale_reason(&assessments[i]);
                plan.push(name, Action::Pull, reason.clone());
                plan.push(name, Action::Stop, reason.clone());
                plan.push(name, Action::Recreate, reason.clone());
                plan.push(name, Action::Start, reason);
            } else {
                plan.push_restart(name, Action::Stop, &dependents[&i]);
                plan.push_restart(name, Action::Start, &dependents[&i]);
            }
        }
        return Ok(plan);
    }

    for &i in affected.iter().filter(|i| targets.contains(i)) {
        plan.push(&records[i].name, Action::Pull, stale_reason(&assessments[i]));
    }
    for &i in affected.iter().rev() {
        let name = &records[i].name;
        if targets.contains(&i) {
            plan.push(name, Action::Stop, stale_reason(&assessments[i]));
        } else {
            plan.push_restart(name, Action::Stop, &dependents[&i]);
        }
    }
    for &i in &affected {
        let name = &records[i].name;
        if targets.contains(&i) {
            let reason = stale_reason(&assessments[i]);
            plan.push(name, Action::Recreate, reason.clone());
            plan.push(name, Action::Start, reason);
        } else {
            plan.push_restart(name, Action::Start, &dependents[&i]);
        }
    }
    Ok(plan)
}

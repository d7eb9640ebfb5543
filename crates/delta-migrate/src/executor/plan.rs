//! Dependency wave planning.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MigrateError, Result};

/// One schedulable entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveNode {
    pub name: String,
    pub dependencies: Vec<String>,
    pub priority: i32,
}

/// Partition nodes into dependency waves.
///
/// Every node lands in the wave after the latest wave of its dependencies.
/// Dependencies on names outside `nodes` are treated as already satisfied
/// (the parent has nothing to sync in this run). Within a wave, nodes are
/// ordered by priority (higher first), then name.
pub fn dependency_waves(nodes: &[WaveNode]) -> Result<Vec<Vec<String>>> {
    let known: BTreeMap<&str, &WaveNode> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = known
        .values()
        .map(|n| {
            let deps = n
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| known.contains_key(d))
                .collect();
            (n.name.as_str(), deps)
        })
        .collect();

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<&WaveNode> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .filter_map(|(name, _)| known.get(name).copied())
            .collect();

        if ready.is_empty() {
            return Err(MigrateError::DependencyCycle(describe_cycle(&remaining)));
        }

        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        let done: BTreeSet<&str> = ready.iter().map(|n| n.name.as_str()).collect();
        for name in &done {
            remaining.remove(name);
        }
        for deps in remaining.values_mut() {
            deps.retain(|d| !done.contains(d));
        }
        waves.push(ready.into_iter().map(|n| n.name.clone()).collect());
    }
    Ok(waves)
}

/// Walk unresolved edges from the first blocked node until a name repeats.
fn describe_cycle(remaining: &BTreeMap<&str, BTreeSet<&str>>) -> String {
    let Some(start) = remaining.keys().next() else {
        return String::new();
    };
    let mut path = vec![*start];
    let mut current = *start;
    loop {
        let Some(next) = remaining.get(current).and_then(|d| d.iter().next()) else {
            break;
        };
        if let Some(pos) = path.iter().position(|p| p == next) {
            let mut cycle: Vec<&str> = path[pos..].to_vec();
            cycle.push(next);
            return cycle.join(" -> ");
        }
        path.push(next);
        current = next;
    }
    path.join(" -> ")
}

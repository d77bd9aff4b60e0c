//! Deterministic Kahn ordering shared by every sort strategy.

use std::collections::{BTreeMap, BTreeSet};

use super::SchedulerError;

/// Orders nodes whose blocking units are listed in `remaining`.
///
/// Each pass takes every node with no blocking unit left, appends them in name
/// order, then removes the units they release (as reported by `released_by`)
/// from the nodes still waiting. A pass that frees nothing while nodes remain
/// means the rest form a cycle.
pub(crate) fn kahn_order<F>(
    mut remaining: BTreeMap<String, BTreeSet<String>>,
    mut released_by: F,
) -> Result<Vec<String>, SchedulerError>
where
    F: FnMut(&str) -> Vec<String>,
{
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        // BTreeMap iteration is already sorted by name.
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, blockers)| blockers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        if ready.is_empty() {
            return Err(SchedulerError::CyclicDependency {
                unresolved: remaining.keys().cloned().collect(),
            });
        }

        for name in &ready {
            remaining.remove(name);
        }
        for name in &ready {
            for unit in released_by(name) {
                for blockers in remaining.values_mut() {
                    blockers.remove(&unit);
                }
            }
        }
        order.extend(ready);
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(n, deps)| {
                (
                    n.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_ready_set_is_sorted() {
        let order = kahn_order(graph(&[("c", &[]), ("a", &[]), ("b", &[])]), |n| {
            vec![n.to_string()]
        })
        .unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_reports_unresolved_nodes() {
        let err = kahn_order(
            graph(&[("x", &[]), ("d", &["e"]), ("e", &["d"])]),
            |n| vec![n.to_string()],
        )
        .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::CyclicDependency {
                unresolved: vec!["d".into(), "e".into()]
            }
        );
    }
}

//! The three subtask ordering strategies.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::topo::kahn_order;
use super::SchedulerError;
use crate::plugin::SubTaskMeta;

fn ensure_unique(metas: &[SubTaskMeta]) -> Result<(), SchedulerError> {
    let mut seen = HashSet::with_capacity(metas.len());
    for meta in metas {
        if !seen.insert(meta.name.as_str()) {
            return Err(SchedulerError::DuplicateName(meta.name.clone()));
        }
    }
    Ok(())
}

fn collect_in_order(metas: &[SubTaskMeta], order: Vec<String>) -> Vec<SubTaskMeta> {
    let by_name: HashMap<&str, &SubTaskMeta> =
        metas.iter().map(|m| (m.name.as_str(), m)).collect();
    order
        .iter()
        .filter_map(|name| by_name.get(name.as_str()).map(|m| (*m).clone()))
        .collect()
}

/// Orders metas using their explicit `dependencies`.
///
/// Dependencies naming a subtask outside the input set are treated as
/// already satisfied.
pub fn sort_by_dependencies(metas: &[SubTaskMeta]) -> Result<Vec<SubTaskMeta>, SchedulerError> {
    ensure_unique(metas)?;
    let names: HashSet<&str> = metas.iter().map(|m| m.name.as_str()).collect();

    let remaining: BTreeMap<String, BTreeSet<String>> = metas
        .iter()
        .map(|m| {
            let deps = m
                .dependencies
                .iter()
                .filter(|d| names.contains(d.as_str()) && **d != m.name)
                .cloned()
                .collect();
            (m.name.clone(), deps)
        })
        .collect();

    let order = kahn_order(remaining, |name| vec![name.to_string()])?;
    Ok(collect_in_order(metas, order))
}

/// Orders metas by inferring an edge A→B whenever B reads a table A writes.
pub fn sort_by_tables(metas: &[SubTaskMeta]) -> Result<Vec<SubTaskMeta>, SchedulerError> {
    ensure_unique(metas)?;

    let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
    for meta in metas {
        for table in &meta.product_tables {
            producers
                .entry(table.as_str())
                .or_default()
                .push(meta.name.as_str());
        }
    }

    let remaining: BTreeMap<String, BTreeSet<String>> = metas
        .iter()
        .map(|m| {
            let preds = m
                .dependency_tables
                .iter()
                .filter_map(|t| producers.get(t.as_str()))
                .flatten()
                .filter(|p| **p != m.name)
                .map(|p| p.to_string())
                .collect();
            (m.name.clone(), preds)
        })
        .collect();

    let order = kahn_order(remaining, |name| vec![name.to_string()])?;
    Ok(collect_in_order(metas, order))
}

/// Orders metas by the tables they still wait for.
///
/// A table becomes available once every meta producing it has been
/// scheduled, so several siblings can jointly unblock a consumer. Tables no
/// meta in the set produces, and tables a meta produces itself, never block.
pub fn sort_by_dependency_and_product(
    metas: &[SubTaskMeta],
) -> Result<Vec<SubTaskMeta>, SchedulerError> {
    ensure_unique(metas)?;

    let mut pending: HashMap<String, usize> = HashMap::new();
    for meta in metas {
        let distinct: BTreeSet<&String> = meta.product_tables.iter().collect();
        for table in distinct {
            *pending.entry(table.clone()).or_default() += 1;
        }
    }

    let remaining: BTreeMap<String, BTreeSet<String>> = metas
        .iter()
        .map(|m| {
            let tables = m
                .dependency_tables
                .iter()
                .filter(|t| pending.contains_key(t.as_str()) && !m.product_tables.contains(t))
                .cloned()
                .collect();
            (m.name.clone(), tables)
        })
        .collect();

    let products: HashMap<&str, BTreeSet<&String>> = metas
        .iter()
        .map(|m| (m.name.as_str(), m.product_tables.iter().collect()))
        .collect();

    let order = kahn_order(remaining, |name| {
        let mut released = Vec::new();
        if let Some(tables) = products.get(name) {
            for table in tables {
                if let Some(count) = pending.get_mut(table.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        released.push((*table).clone());
                    }
                }
            }
        }
        released
    })?;
    Ok(collect_in_order(metas, order))
}

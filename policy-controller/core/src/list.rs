//! Order-insensitive comparison of sequences.
//!
//! Desired entries are paired with observed entries in three passes, each
//! consuming an observed entry at most once:
//!
//! 1. an observed entry that is structurally equal;
//! 2. an observed entry that already satisfies the desired entry;
//! 3. for maps, the observed entry that satisfies the most desired keys.
//!
//! Ties always go to the first candidate in observed order.

use crate::{
    merge::{self, without_nulls},
    value::Value,
};
use config_policy_controller_k8s_api::ComplianceType;

#[derive(Clone, Debug, PartialEq)]
pub struct ListComparison {
    pub merged: Vec<Value>,
    pub compliant: bool,
}

pub fn compare_lists(desired: &[Value], observed: &[Value], mode: ComplianceType) -> ListComparison {
    let desired = desired.iter().filter(|v| !v.is_null()).collect::<Vec<_>>();
    let mut matches: Vec<Option<usize>> = vec![None; desired.len()];
    let mut consumed = vec![false; observed.len()];

    let mut assign = |matches: &mut Vec<Option<usize>>,
                      find: &dyn Fn(&Value, &Value) -> Option<usize>| {
        for (d, want) in desired.iter().enumerate() {
            if matches[d].is_some() {
                continue;
            }
            let best = observed
                .iter()
                .enumerate()
                .filter(|(o, _)| !consumed[*o])
                .filter_map(|(o, have)| find(*want, have).map(|score| (o, score)))
                // `max_by_key` keeps the last maximum; reverse so the first wins.
                .rev()
                .max_by_key(|(_, score)| *score);
            if let Some((o, _)) = best {
                consumed[o] = true;
                matches[d] = Some(o);
            }
        }
    };

    assign(&mut matches, &|want, have| (want == have).then_some(0));
    assign(&mut matches, &|want, have| {
        merge::compare(want, have, mode).compliant.then_some(0)
    });
    assign(&mut matches, &|want, have| {
        let score = overlap(want, have, mode);
        (score > 0).then_some(score)
    });

    let mut compliant = true;
    let mut merged_at: Vec<Option<Value>> = vec![None; observed.len()];
    let mut entries = Vec::with_capacity(desired.len());
    for (want, matched) in desired.iter().zip(matches.iter()) {
        match *matched {
            Some(o) => {
                let cmp = merge::compare(want, &observed[o], mode);
                compliant &= cmp.compliant;
                merged_at[o] = Some(cmp.merged.clone());
                entries.push(cmp.merged);
            }
            None => {
                compliant = false;
                entries.push(without_nulls(want));
            }
        }
    }

    let merged = if mode == ComplianceType::MustOnlyHave {
        // Observed entries that no desired entry claimed are not allowed.
        compliant &= consumed.iter().all(|c| *c);
        entries
    } else {
        let unmatched = desired
            .iter()
            .zip(matches.iter())
            .zip(entries)
            .filter(|((_, m), _)| m.is_none())
            .map(|(_, entry)| entry);
        observed
            .iter()
            .zip(merged_at)
            .map(|(have, merged)| merged.unwrap_or_else(|| have.clone()))
            .chain(unmatched)
            .collect()
    };

    ListComparison { merged, compliant }
}

/// Merges a desired list into an existing one, returning the list that would
/// satisfy the desired list.
pub fn merge_arrays(desired: &[Value], existing: &[Value], mode: ComplianceType) -> Vec<Value> {
    compare_lists(desired, existing, mode).merged
}

/// Counts the desired keys that the observed map satisfies individually.
fn overlap(desired: &Value, observed: &Value, mode: ComplianceType) -> usize {
    let (Some(want), Some(have)) = (desired.as_map(), observed.as_map()) else {
        return 0;
    };
    want.iter()
        .filter(|(_, v)| !v.is_null())
        .filter(|(k, v)| {
            have.get(*k)
                .is_some_and(|h| merge::compare(v, h, mode).compliant)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use pretty_assertions::assert_eq;

    fn seq(v: Value) -> Vec<Value> {
        match v {
            Value::Seq(items) => items,
            _ => panic!("not a sequence"),
        }
    }

    #[test]
    fn merge_arrays_by_mode() {
        let new = seq(doc!([{ "a": "a", "b": "b" }]));
        let old = seq(doc!([{ "a": "a", "b": "b" }, { "c": "c", "d": "d" }]));

        assert_eq!(merge_arrays(&new, &old, ComplianceType::MustHave), old);
        assert_eq!(merge_arrays(&new, &old, ComplianceType::MustOnlyHave), new);
    }

    #[test]
    fn musthave_partial_entries_merge_in_place() {
        let old = seq(doc!([
            { "a": "a", "b": "b" },
            { "c": "c", "d": "d" },
        ]));
        for new in [doc!([{ "b": "b" }]), doc!([{ "a": "a" }, { "c": "c" }])] {
            let res = compare_lists(&seq(new), &old, ComplianceType::MustHave);
            assert!(res.compliant);
            assert_eq!(res.merged, old);
        }
    }

    #[test]
    fn musthave_appends_missing_entries() {
        let old = seq(doc!([{ "name": "a", "port": 80 }]));
        let new = seq(doc!([{ "name": "b", "port": 81 }]));
        let res = compare_lists(&new, &old, ComplianceType::MustHave);
        assert!(!res.compliant);
        assert_eq!(
            res.merged,
            seq(doc!([{ "name": "a", "port": 80 }, { "name": "b", "port": 81 }]))
        );
    }

    #[test]
    fn merges_best_overlap() {
        let old = seq(doc!([
            { "name": "web", "image": "nginx:1", "port": 80 },
            { "name": "sidecar", "image": "envoy", "port": 9901 },
        ]));
        let new = seq(doc!([{ "name": "web", "image": "nginx:2" }]));
        let res = compare_lists(&new, &old, ComplianceType::MustHave);
        assert!(!res.compliant);
        assert_eq!(
            res.merged,
            seq(doc!([
                { "name": "web", "image": "nginx:2", "port": 80 },
                { "name": "sidecar", "image": "envoy", "port": 9901 },
            ]))
        );
    }

    #[test]
    fn mustonlyhave_drops_extra_entries() {
        let old = seq(doc!(["a", "b", "c"]));
        let new = seq(doc!(["c", "a"]));
        let res = compare_lists(&new, &old, ComplianceType::MustOnlyHave);
        assert!(!res.compliant);
        assert_eq!(res.merged, new);

        let res = compare_lists(&new, &seq(doc!(["a", "c"])), ComplianceType::MustOnlyHave);
        assert!(res.compliant, "order is irrelevant");
    }

    #[test]
    fn ties_go_to_the_first_entry() {
        let old = seq(doc!([
            { "name": "x", "value": "1" },
            { "name": "x", "value": "2" },
        ]));
        let new = seq(doc!([{ "name": "x", "value": "3" }]));
        let res = compare_lists(&new, &old, ComplianceType::MustHave);
        assert_eq!(
            res.merged,
            seq(doc!([
                { "name": "x", "value": "3" },
                { "name": "x", "value": "2" },
            ]))
        );
    }

    #[test]
    fn observed_entries_are_claimed_once() {
        let old = seq(doc!([{ "k": "v" }]));
        let new = seq(doc!([{ "k": "v" }, { "k": "v" }]));
        let res = compare_lists(&new, &old, ComplianceType::MustHave);
        assert!(!res.compliant);
        assert_eq!(res.merged, new);
    }

    #[test]
    fn merging_is_idempotent() {
        let lists = [
            doc!([]),
            doc!([1, 2, 2, 3]),
            doc!([{ "a": 1 }, { "a": 1, "b": [{ "c": true }] }]),
            doc!([{ "name": "x", "env": [{ "name": "A", "value": "1" }] }, "scalar"]),
        ];
        for mode in [ComplianceType::MustHave, ComplianceType::MustOnlyHave] {
            for l in lists.iter() {
                let l = seq(l.clone());
                let once = compare_lists(&l, &l, mode);
                assert!(once.compliant);
                let twice = compare_lists(&l, &once.merged, mode);
                assert_eq!(twice.merged, once.merged);
            }
        }
    }
}

//! Is-a closure computation.
//!
//! Upstream feeds usually ship the closure precomputed. When a bundle only
//! lists direct parents, [`transitive_closure`] derives one row per
//! (descendant, ancestor) pair so `ancestors_of` never walks the graph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Expand direct `(child, parent)` edges into closure rows
/// `(descendant, ancestor, level)`.
///
/// `level` is the shortest path length (≥ 1) between the pair. Cycles are
/// tolerated: a concept never appears as its own ancestor. Output is sorted
/// by descendant, then level, then ancestor.
pub fn transitive_closure<K>(edges: &[(K, K)]) -> Vec<(K, K, u32)>
where
    K: Clone + Eq + Hash + Ord,
{
    let mut parents: HashMap<&K, Vec<&K>> = HashMap::new();
    for (child, parent) in edges {
        if child != parent {
            parents.entry(child).or_default().push(parent);
        }
    }

    let mut rows = Vec::new();
    let mut children: Vec<&K> = parents.keys().copied().collect();
    children.sort();

    for child in children {
        let mut seen: HashSet<&K> = HashSet::from([child]);
        let mut found: BTreeSet<(u32, &K)> = BTreeSet::new();
        let mut queue: VecDeque<(&K, u32)> = VecDeque::from([(child, 0)]);

        while let Some((node, depth)) = queue.pop_front() {
            let Some(ps) = parents.get(node) else { continue };
            for &p in ps {
                if seen.insert(p) {
                    found.insert((depth + 1, p));
                    queue.push_back((p, depth + 1));
                }
            }
        }

        rows.extend(
            found
                .into_iter()
                .map(|(level, ancestor)| (child.clone(), ancestor.clone(), level)),
        );
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(c: &'static str, p: &'static str) -> (&'static str, &'static str) {
        (c, p)
    }

    #[test]
    fn chain_of_depth_three() {
        let rows = transitive_closure(&[e("d", "c"), e("c", "b"), e("b", "a")]);
        let of_d: Vec<_> = rows.iter().filter(|r| r.0 == "d").collect();
        assert_eq!(of_d.len(), 3);
        assert_eq!(
            of_d.iter().map(|r| (r.1, r.2)).collect::<Vec<_>>(),
            vec![("c", 1), ("b", 2), ("a", 3)]
        );
    }

    #[test]
    fn diamond_keeps_shortest_level_once() {
        // d -> b -> a, d -> c -> a, d -> a
        let rows = transitive_closure(&[e("d", "b"), e("d", "c"), e("b", "a"), e("c", "a"), e("d", "a")]);
        let to_a: Vec<_> = rows.iter().filter(|r| r.0 == "d" && r.1 == "a").collect();
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].2, 1);
    }

    #[test]
    fn cycle_terminates_without_self_rows() {
        let rows = transitive_closure(&[e("a", "b"), e("b", "a")]);
        assert!(rows.iter().all(|r| r.0 != r.1));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn roots_have_no_rows() {
        let rows = transitive_closure(&[e("b", "a")]);
        assert!(rows.iter().all(|r| r.0 != "a"));
    }
}

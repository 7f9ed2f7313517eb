use std::collections::HashSet;

use ulid::Ulid;

use crate::model::Span;

/// Partition records into clusters of transitively overlapping spans.
/// Adjacent spans (`a.end == b.start`) do not join a cluster.
pub fn group_overlapping(records: &[(Ulid, Span)]) -> Vec<Vec<Ulid>> {
    let mut sorted: Vec<&(Ulid, Span)> = records.iter().collect();
    sorted.sort_by_key(|(id, span)| (span.start, span.end, *id));

    let mut clusters: Vec<Vec<Ulid>> = Vec::new();
    let mut current_end = i64::MIN;
    for (id, span) in sorted {
        match clusters.last_mut() {
            Some(cluster) if span.start < current_end => {
                cluster.push(*id);
                current_end = current_end.max(span.end);
            }
            _ => {
                clusters.push(vec![*id]);
                current_end = span.end;
            }
        }
    }
    clusters
}

/// Ids sharing a cluster with any of `seeds`.
pub fn cluster_members(records: &[(Ulid, Span)], seeds: &[Ulid]) -> HashSet<Ulid> {
    group_overlapping(records)
        .into_iter()
        .filter(|cluster| cluster.iter().any(|id| seeds.contains(id)))
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(start: i64, end: i64) -> (Ulid, Span) {
        (Ulid::new(), Span::new(start, end))
    }

    #[test]
    fn empty_input() {
        assert!(group_overlapping(&[]).is_empty());
    }

    #[test]
    fn transitive_chain_forms_one_cluster() {
        let a = rec(0, 10);
        let b = rec(5, 15);
        let c = rec(14, 20);
        let clusters = group_overlapping(&[c, a, b]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], vec![a.0, b.0, c.0]);
    }

    #[test]
    fn adjacent_spans_stay_apart() {
        let a = rec(0, 10);
        let b = rec(10, 20);
        let clusters = group_overlapping(&[a, b]);
        assert_eq!(clusters, vec![vec![a.0], vec![b.0]]);
    }

    #[test]
    fn long_span_bridges_later_records() {
        let long = rec(0, 100);
        let x = rec(10, 20);
        let y = rec(50, 60);
        let z = rec(100, 110);
        let clusters = group_overlapping(&[long, x, y, z]);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 3);
        assert_eq!(clusters[1], vec![z.0]);
    }

    #[test]
    fn members_of_seed_clusters() {
        let a = rec(0, 10);
        let b = rec(5, 15);
        let c = rec(30, 40);
        let members = cluster_members(&[a, b, c], &[b.0]);
        assert!(members.contains(&a.0));
        assert!(members.contains(&b.0));
        assert!(!members.contains(&c.0));
    }
}

//! Deterministic partition assigner.

use rebalancer_common::{ClientAssignment, ClientId, ResourceId};

/// Split resources into contiguous blocks over clients.
///
/// `clients` must be in ascending join-sequence order and `resources`
/// sorted. With `m` resources over `n` clients the first `m % n` clients get
/// `m / n + 1` resources and the rest `m / n`. Every client appears in the
/// output, possibly with an empty list.
pub fn assign(clients: &[ClientId], resources: &[ResourceId]) -> Vec<ClientAssignment> {
    let n = clients.len();
    if n == 0 {
        return Vec::new();
    }
    let base = resources.len() / n;
    let extra = resources.len() % n;

    let mut offset = 0;
    clients
        .iter()
        .enumerate()
        .map(|(idx, client)| {
            let take = if idx < extra { base + 1 } else { base };
            let slice = resources[offset..offset + take].to_vec();
            offset += take;
            ClientAssignment::new(client.clone(), slice)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn clients(n: usize) -> Vec<ClientId> {
        (0..n).map(|i| ClientId::new(format!("c_{:010}", i))).collect()
    }

    fn resources(m: usize) -> Vec<ResourceId> {
        let mut r: Vec<ResourceId> = (0..m).map(|i| ResourceId::new(format!("res{:03}", i))).collect();
        r.sort();
        r
    }

    fn sizes(assignments: &[ClientAssignment]) -> Vec<usize> {
        assignments.iter().map(|a| a.resources.len()).collect()
    }

    #[test]
    fn test_even_split() {
        let result = assign(&clients(3), &resources(6));
        assert_eq!(sizes(&result), vec![2, 2, 2]);
        assert_eq!(result[0].resources, resources(6)[0..2].to_vec());
    }

    #[test]
    fn test_remainder_goes_first() {
        let result = assign(&clients(3), &resources(7));
        assert_eq!(sizes(&result), vec![3, 2, 2]);
    }

    #[test]
    fn test_more_clients_than_resources() {
        let result = assign(&clients(3), &resources(1));
        assert_eq!(sizes(&result), vec![1, 0, 0]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_no_clients() {
        assert!(assign(&[], &resources(4)).is_empty());
    }

    #[test]
    fn test_no_resources() {
        assert_eq!(sizes(&assign(&clients(2), &[])), vec![0, 0]);
    }

    proptest! {
        #[test]
        fn prop_covers_every_resource_once(n in 1usize..12, m in 0usize..40) {
            let result = assign(&clients(n), &resources(m));
            let mut seen = HashSet::new();
            for a in &result {
                for r in &a.resources {
                    prop_assert!(seen.insert(r.clone()));
                }
            }
            prop_assert_eq!(seen.len(), m);
        }

        #[test]
        fn prop_balanced_with_extra_first(n in 1usize..12, m in 0usize..40) {
            let result = assign(&clients(n), &resources(m));
            prop_assert_eq!(result.len(), n);
            for (idx, a) in result.iter().enumerate() {
                let expected = m / n + usize::from(idx < m % n);
                prop_assert_eq!(a.resources.len(), expected);
            }
        }

        #[test]
        fn prop_contiguous_in_order(n in 1usize..12, m in 0usize..40) {
            let result = assign(&clients(n), &resources(m));
            let flattened: Vec<ResourceId> =
                result.iter().flat_map(|a| a.resources.clone()).collect();
            prop_assert_eq!(flattened, resources(m));
        }

        #[test]
        fn prop_deterministic(n in 0usize..12, m in 0usize..40) {
            prop_assert_eq!(assign(&clients(n), &resources(m)), assign(&clients(n), &resources(m)));
        }
    }
}

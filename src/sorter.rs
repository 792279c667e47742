use std::cmp::Ordering;

use crate::peer::PeerIdentity;

/// Reorder a destination list so that peers topologically close to the local node come first
///  in the chain.
///
/// Identities are grouped by their locality tag, with the local node's own locality ordered
///  before all others and the remaining groups in lexicographic order. Within a group, peers
///  whose name shares the longest common prefix with the local name are biased toward the
///  front - names on the same machine / rack typically share a prefix, so this keeps early hops
///  nearby. Ties fall back to lexicographic name order.
///
/// This is a heuristic tie-break only: any total order is safe for correctness, the sort just
///  reduces wide-area hops. The result is deterministic for a given input set.
pub fn sort_destinations(local: &PeerIdentity, destinations: &mut [PeerIdentity]) {
    destinations.sort_by(|a, b| compare(local, a, b));
}

fn compare(local: &PeerIdentity, a: &PeerIdentity, b: &PeerIdentity) -> Ordering {
    if a.location == b.location {
        let prefix_a = common_prefix_len(&local.name, &a.name);
        let prefix_b = common_prefix_len(&local.name, &b.name);

        // longer common prefix means "more similar to me", so it sorts earlier
        return prefix_b.cmp(&prefix_a)
            .then_with(|| a.name.cmp(&b.name));
    }

    if a.location == local.location {
        return Ordering::Less;
    }
    if b.location == local.location {
        return Ordering::Greater;
    }

    a.location.cmp(&b.location)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

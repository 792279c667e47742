use rustc_hash::FxHashMap;

use crate::peer::{PeerId, PeerIdentity};
use crate::sorter;

/// Maps opaque peer identities to small dense [PeerId]s and back, driven by membership events.
///
/// Ids are assigned in observation order and never reused - a removed peer's slot stays empty
///  so packets still in flight that reference the id resolve to "unknown" rather than to a
///  different peer.
pub struct PeerRegistry {
    local: PeerIdentity,
    known: FxHashMap<PeerIdentity, PeerId>,
    identities: Vec<Option<PeerIdentity>>,
    next_id: u16,
    self_id: Option<PeerId>,

    /// set on every membership change, cleared when a destination snapshot is taken - this is
    ///  what lets delta-aware callers ask "only if changed"
    dirty: bool,
}

impl PeerRegistry {
    pub fn new(local: PeerIdentity) -> PeerRegistry {
        PeerRegistry {
            local,
            known: FxHashMap::default(),
            identities: Vec::new(),
            next_id: 0,
            self_id: None,
            dirty: false,
        }
    }

    /// Register a peer, assigning the next unused id on first sight. Idempotent.
    pub fn add_peer(&mut self, identity: PeerIdentity) {
        if self.known.contains_key(&identity) {
            return;
        }

        let id = PeerId::from_raw(self.next_id);
        self.next_id += 1;

        if identity == self.local {
            self.self_id = Some(id);
        }

        self.identities.push(Some(identity.clone()));
        self.known.insert(identity, id);
        self.dirty = true;
    }

    /// Remove a peer. Removing an unknown peer is a no-op; the numeric id is not reused.
    pub fn remove_peer(&mut self, identity: &PeerIdentity) {
        if let Some(id) = self.known.remove(identity) {
            self.identities[id.to_raw() as usize] = None;
            self.dirty = true;
        }
    }

    pub fn resolve(&self, identity: &PeerIdentity) -> Option<PeerId> {
        self.known.get(identity).copied()
    }

    pub fn identity_of(&self, id: PeerId) -> Option<&PeerIdentity> {
        self.identities.get(id.to_raw() as usize)
            .and_then(|opt| opt.as_ref())
    }

    pub fn self_id(&self) -> Option<PeerId> {
        self.self_id
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// All currently known peers except the local node, in a deterministic order; with `sort`
    ///  the locality-aware order (own location first, most similar names first) is applied.
    pub fn current_destinations(&mut self, sort: bool) -> Vec<PeerIdentity> {
        self.dirty = false;

        let mut result: Vec<PeerIdentity> = self.known.keys()
            .filter(|&identity| *identity != self.local)
            .cloned()
            .collect();
        result.sort();

        if sort {
            sorter::sort_destinations(&self.local, &mut result);
        }
        result
    }

    /// Like [Self::current_destinations], but returns `None` if membership has not changed
    ///  since the last snapshot was taken.
    pub fn destinations_if_changed(&mut self, sort: bool) -> Option<Vec<PeerIdentity>> {
        if !self.dirty {
            return None;
        }
        Some(self.current_destinations(sort))
    }
}

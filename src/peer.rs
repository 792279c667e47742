use std::fmt::{Debug, Display, Formatter};

/// A peer's stable identity as handed out by the membership service: a unique name plus the
///  locality tag (cluster / site) it belongs to. The identity never goes on the wire for data
///  packets - those carry the short [PeerId] instead.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerIdentity {
    pub name: String,
    pub location: String,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> PeerIdentity {
        PeerIdentity {
            name: name.into(),
            location: location.into(),
        }
    }
}

impl Debug for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{}]", self.name, self.location)
    }
}

/// The small dense id assigned to a peer the first time it is observed locally. Ids are handed
///  out in membership event order, which the membership service delivers consistently to all
///  peers, so the same peer gets the same id everywhere and the id can be used on the wire.
///
/// An id is never reused after its peer leaves - packets referencing it may still be in flight.
///
/// "Unknown / not yet resolved" is expressed as `Option<PeerId>` = `None` rather than a sentinel
///  value, so an unresolved peer can never be dereferenced for connection lookup by accident.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PeerId(u16);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerId {
    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }
}

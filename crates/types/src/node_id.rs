//! Node identity.

/// Length in bytes of a node id.
pub const NODE_ID_LENGTH: usize = 128;

/// A node's session identity: 128 random bytes chosen at startup. Not
/// tied to any cryptographic key; used only to recognise connections
/// that loop back to ourselves and peers reachable over several links.
///
/// The all-zeroes id is reserved as "unset"; locally generated ids set
/// the low bit of the last byte so they can never be all zeroes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Wrap freshly generated random bytes, forcing the low bit of the
    /// last byte so the id cannot be all zeroes.
    pub fn from_random_bytes(mut bytes: [u8; NODE_ID_LENGTH]) -> Self {
        bytes[NODE_ID_LENGTH - 1] |= 0x01;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first few bytes are plenty to tell peers apart in logs.
        write!(f, "{}…", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_never_all_zeroes() {
        let id = NodeId::from_random_bytes([0u8; NODE_ID_LENGTH]);
        assert_ne!(id.as_bytes(), &[0u8; NODE_ID_LENGTH]);
        assert_eq!(id.as_bytes()[NODE_ID_LENGTH - 1], 0x01);
    }
}

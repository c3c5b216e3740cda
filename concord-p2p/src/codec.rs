//! Binary wire format for cluster envelopes.

use crate::message::{Envelope, NetworkError};

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, NetworkError> {
    bincode::serialize(envelope).map_err(|e| NetworkError::SerializationError(e.to_string()))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, NetworkError> {
    bincode::deserialize(bytes).map_err(|e| NetworkError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AppendEntries, ClusterMessage};
    use concord_common::{env::LogEntry, NodeId};

    #[test]
    fn append_entries_survive_the_wire() {
        let envelope = Envelope::new(
            NodeId::from("leader"),
            ClusterMessage::AppendEntries(AppendEntries {
                term: 3,
                prev_log_index: 1,
                prev_log_term: 2,
                entries: vec![LogEntry::new(3, 2, b"set x=1".to_vec(), 42)],
                leader_commit: 1,
            }),
        );
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = decode_envelope(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, NetworkError::SerializationError(_)));
    }
}

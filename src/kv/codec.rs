use prost::Message;

use crate::error::Result;

/// Descriptor persisted at each `tenant/replicaGroup` key, identifying the
/// replica we are currently accepting samples from.
///
/// Encoded as protobuf so that fields can be added without breaking peers
/// running older builds.
#[derive(Clone, PartialEq, Message)]
pub struct ReplicaDesc {
    /// Opaque identifier of the elected replica.
    #[prost(string, tag = "1")]
    pub replica: String,
    /// Milliseconds since epoch of the most recent sample observed from
    /// the elected replica by any front-end that updated the entry.
    #[prost(int64, tag = "2")]
    pub received_at: i64,
    /// Milliseconds since epoch at which the entry was tombstoned.
    /// Zero means the entry is live.
    #[prost(int64, tag = "3")]
    pub deleted_at: i64,
}

impl ReplicaDesc {
    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self::decode(buf)?)
    }
}

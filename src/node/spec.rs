//! Node Specification
//!
//! Identity record of one cluster participant and its wire encoding.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of a cluster participant.
///
/// Serialized as a flat JSON object (`Name`, `Address`, `Port`). The election
/// key is assigned by the coordination backend and attached by whoever reads
/// the record back; it is never written by the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeSpec {
    /// Backend-assigned key of this participant's record
    #[serde(skip_serializing)]
    pub election_key: String,
    /// Name, unique per role within a cluster
    pub name: String,
    /// Address the managed service listens on
    pub address: String,
    /// Port the managed service listens on
    pub port: u16,
}

impl NodeSpec {
    /// Create a new spec without an election key
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            election_key: String::new(),
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// Attach the backend-assigned key
    pub fn with_election_key(mut self, key: impl Into<String>) -> Self {
        self.election_key = key.into();
        self
    }

    /// Encode as the campaign / record value
    pub fn marshal(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a record value
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode a record read back from the backend under `key`
    pub fn from_record(key: &str, value: &[u8]) -> Result<Self> {
        Ok(Self::unmarshal(value)?.with_election_key(key))
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl std::fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn examples() -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("Node-001", "192.168.1.1", 2222),
            NodeSpec::new("Node-002", "172.10.0.21", 8989),
            NodeSpec::new("Node-003", "10.10.0.1", 5432),
            NodeSpec::new("", "", 0),
            NodeSpec::new("ünïcode \"quoted\"", "::1", u16::MAX),
        ]
    }

    #[test]
    fn test_marshal_round_trip() {
        for spec in examples() {
            let encoded = spec.marshal().unwrap();
            assert_eq!(NodeSpec::unmarshal(encoded.as_bytes()).unwrap(), spec);
        }
    }

    #[test]
    fn test_election_key_is_not_transmitted() {
        let spec = NodeSpec::new("pg-1", "10.0.0.5", 5432).with_election_key("nominee/x/694d");
        let encoded = spec.marshal().unwrap();
        assert_eq!(encoded, r#"{"Name":"pg-1","Address":"10.0.0.5","Port":5432}"#);

        let decoded = NodeSpec::from_record("nominee/x/694d", encoded.as_bytes()).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn test_unmarshal_rejects_malformed() {
        assert!(NodeSpec::unmarshal(b"not json").is_err());
        assert!(NodeSpec::unmarshal(br#"{"Name":"pg","Port":70000}"#).is_err());
    }

    #[test]
    fn test_display_and_endpoint() {
        let spec = NodeSpec::new("pg-1", "10.0.0.5", 5432);
        assert_eq!(spec.to_string(), "pg-1@10.0.0.5:5432");
        assert_eq!(spec.endpoint(), "10.0.0.5:5432");
    }
}

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Connection ID type (nanoid, unique per accepted transport)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid!(12))
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of this relay process.
///
/// Generated once at startup and stamped on every locally originated event so
/// that the copy echoed back by the shared bus can be recognised and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Build a fresh identity: `{hostname}-{pid}-{random}`
    #[must_use]
    pub fn generate() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self(format!("{hostname}-{}-{}", std::process::id(), nanoid!(6)))
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();

        assert_ne!(a, b);
        assert!(a.as_str().contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_connection_id_serializes_transparently() {
        let id = ConnectionId::from("conn1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"conn1\"");
    }
}

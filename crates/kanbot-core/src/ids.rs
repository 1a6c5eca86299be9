use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Row identifier of a task on the board. Assigned by the store, never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('#').parse().map(Self)
    }
}

impl From<i64> for TaskId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Identifiers minted by the remote gateway. We never generate these,
/// only carry them around verbatim.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(AgentId);
opaque_id!(SessionKey);
opaque_id!(RunId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_parses_with_or_without_hash() {
        assert_eq!("14".parse::<TaskId>().unwrap(), TaskId::new(14));
        assert_eq!("#14".parse::<TaskId>().unwrap(), TaskId::new(14));
        assert!("fourteen".parse::<TaskId>().is_err());
    }

    #[test]
    fn task_id_serializes_as_number() {
        let json = serde_json::to_string(&TaskId::new(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn session_key_preserves_value() {
        let key = SessionKey::from_raw("agent:architect:subagent:42");
        assert_eq!(key.as_str(), "agent:architect:subagent:42");
        assert_eq!(key.to_string(), "agent:architect:subagent:42");
    }

    #[test]
    fn opaque_ids_serialize_transparently() {
        let id = AgentId::from_raw("architect");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"architect\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

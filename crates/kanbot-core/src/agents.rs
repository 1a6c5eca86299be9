//! Name → gateway identifier lookup for the agents that can be spawned.
//!
//! Names are stored exactly as they appear on the board and in `@mentions`:
//! multi-word names are joined with a hyphen (`UX-Manager`). Lookups are
//! exact and case-sensitive, so `"UX Manager"` or `"ux-manager"` miss.

use std::collections::BTreeMap;

use crate::ids::AgentId;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("agent name {0:?} is not a valid mention token (use hyphens, no spaces)")]
    NonCanonicalName(String),
    #[error("agent {0:?} has an empty gateway id")]
    EmptyAgentId(String),
}

/// True if `name` can be written as `@name` in a comment and be picked up
/// whole by the mention scanner: ASCII alphanumerics joined by `-` or `_`,
/// starting with an alphanumeric and not ending in a separator.
pub fn is_canonical_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && (last.is_ascii_alphanumeric() || *last == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
}

/// Immutable agent lookup table, built once at startup and shared.
#[derive(Clone, Debug, Default)]
pub struct AgentDirectory {
    entries: BTreeMap<String, AgentId>,
}

impl AgentDirectory {
    /// Build a directory, rejecting names that callers could never match.
    pub fn new<I, N, A>(entries: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = (N, A)>,
        N: Into<String>,
        A: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (name, agent_id) in entries {
            let name = name.into();
            let agent_id = agent_id.into();
            if !is_canonical_name(&name) {
                return Err(DirectoryError::NonCanonicalName(name));
            }
            if agent_id.trim().is_empty() {
                return Err(DirectoryError::EmptyAgentId(name));
            }
            map.insert(name, AgentId::from_raw(agent_id));
        }
        Ok(Self { entries: map })
    }

    pub fn resolve(&self, name: &str) -> Option<&AgentId> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> AgentDirectory {
        AgentDirectory::new([
            ("Architect", "architect"),
            ("UX-Manager", "ux-manager"),
            ("QA-Engineer", "qa-engineer"),
        ])
        .unwrap()
    }

    #[test]
    fn resolves_exact_names() {
        let dir = directory();
        assert_eq!(dir.resolve("Architect").unwrap().as_str(), "architect");
        assert_eq!(dir.resolve("UX-Manager").unwrap().as_str(), "ux-manager");
    }

    #[test]
    fn space_separated_variant_is_not_found() {
        let dir = directory();
        assert!(dir.resolve("UX Manager").is_none());
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let dir = directory();
        assert!(dir.resolve("architect").is_none());
        assert!(dir.resolve("ux-manager").is_none());
    }

    #[test]
    fn unknown_name_is_not_found() {
        assert!(directory().resolve("Nobody").is_none());
    }

    #[test]
    fn rejects_names_with_spaces() {
        let err = AgentDirectory::new([("UX Manager", "ux-manager")]).unwrap_err();
        assert_eq!(err, DirectoryError::NonCanonicalName("UX Manager".into()));
    }

    #[test]
    fn rejects_empty_agent_id() {
        let err = AgentDirectory::new([("Architect", "  ")]).unwrap_err();
        assert_eq!(err, DirectoryError::EmptyAgentId("Architect".into()));
    }

    #[test]
    fn canonical_name_rules() {
        assert!(is_canonical_name("Architect"));
        assert!(is_canonical_name("UX-Manager"));
        assert!(is_canonical_name("qa_bot"));
        assert!(!is_canonical_name(""));
        assert!(!is_canonical_name("UX Manager"));
        assert!(!is_canonical_name("-Lead"));
        assert!(!is_canonical_name("Lead-"));
        assert!(!is_canonical_name("@Architect"));
    }

    #[test]
    fn every_key_is_canonical() {
        let dir = directory();
        assert_eq!(dir.len(), 3);
        for name in dir.names() {
            assert!(is_canonical_name(name), "{name} breaks the hyphen convention");
            assert!(dir.contains(name));
        }
    }
}

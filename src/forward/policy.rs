//! Allow-list policy shared by the agent proxies.

use serde::{Deserialize, Serialize};

/// How an agent socket reaches the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardMode {
    /// Nothing is forwarded.
    #[default]
    None,
    /// The host agent socket is mounted as-is.
    Agent,
    /// A filtering proxy sits between the sandbox and the host agent.
    Proxy,
    /// Key files are mounted read-only (SSH only).
    Keys,
}

/// Key identifiers a proxy lets through.
///
/// An entry matches when it occurs as a substring of any identifier of the
/// key (comment, fingerprint, keygrip). An empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    /// Build from raw entries; blank entries are dropped.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn permits(&self, identifiers: &[&str]) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries
            .iter()
            .any(|entry| identifiers.iter().any(|id| id.contains(entry.as_str())))
    }

    /// Like [`permits`](Self::permits), ignoring ASCII case (keygrips are hex).
    pub fn permits_ignore_case(&self, identifier: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let identifier = identifier.to_ascii_uppercase();
        self.entries
            .iter()
            .any(|entry| identifier.contains(&entry.to_ascii_uppercase()))
    }
}

/// Forwarding mode plus the allow-list that applies under it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub mode: ForwardMode,
    pub allow_list: AllowList,
}

impl CredentialPolicy {
    /// An allow-list on plain agent forwarding upgrades it to a filtering proxy.
    pub fn new(mode: ForwardMode, allow_list: AllowList) -> Self {
        let mode = match mode {
            ForwardMode::Agent if !allow_list.is_empty() => ForwardMode::Proxy,
            mode => mode,
        };
        Self { mode, allow_list }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_permits_everything() {
        let list = AllowList::new(Vec::<String>::new());
        assert!(list.is_empty());
        assert!(list.permits(&["anything"]));
        assert!(list.permits(&[]));
        assert!(list.permits_ignore_case("ABCDEF"));
    }

    #[test]
    fn blank_entries_are_dropped() {
        let list = AllowList::new(["", "  ", "work"]);
        assert_eq!(list.entries(), &["work".to_string()]);
    }

    #[test]
    fn substring_match_on_any_identifier() {
        let list = AllowList::new(["work@", "SHA256:abc"]);
        assert!(list.permits(&["me@home", "SHA256:abcdef"]));
        assert!(list.permits(&["work@laptop", "SHA256:zzz"]));
        assert!(!list.permits(&["personal@laptop", "SHA256:zzz"]));
        assert!(!list.permits(&[]));
    }

    #[test]
    fn match_is_case_sensitive_by_default() {
        let list = AllowList::new(["Work"]);
        assert!(!list.permits(&["work@laptop"]));
    }

    #[test]
    fn keygrip_match_ignores_case() {
        let list = AllowList::new(["a1b2c3"]);
        assert!(list.permits_ignore_case("00A1B2C3FF"));
        assert!(!list.permits_ignore_case("00D4E5F6FF"));
    }

    #[test]
    fn agent_with_allow_list_becomes_proxy() {
        let policy = CredentialPolicy::new(ForwardMode::Agent, AllowList::new(["deploy"]));
        assert_eq!(policy.mode, ForwardMode::Proxy);

        let policy = CredentialPolicy::new(ForwardMode::Agent, AllowList::default());
        assert_eq!(policy.mode, ForwardMode::Agent);

        let policy = CredentialPolicy::new(ForwardMode::Keys, AllowList::new(["deploy"]));
        assert_eq!(policy.mode, ForwardMode::Keys);
    }

    #[test]
    fn mode_deserializes_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            forward: ForwardMode,
        }
        let w: Wrapper = toml::from_str("forward = \"proxy\"").unwrap();
        assert_eq!(w.forward, ForwardMode::Proxy);
        assert!(toml::from_str::<Wrapper>("forward = \"bogus\"").is_err());
    }
}

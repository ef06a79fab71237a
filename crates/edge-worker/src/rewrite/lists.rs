use common::handshake::ConfigHandshake;

/// Domain substrings gating interception. The deny-list wins over the
/// allow-list; an empty allow-list matches every URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowDenyList {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl AllowDenyList {
    pub fn new(allow: impl IntoIterator<Item = String>, deny: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow: normalize(allow),
            deny: normalize(deny),
        }
    }

    pub fn from_handshake(handshake: &ConfigHandshake) -> Self {
        Self::new(handshake.white_list.clone(), handshake.black_list.clone())
    }

    pub fn allow(&self) -> &[String] {
        &self.allow
    }

    pub fn deny(&self) -> &[String] {
        &self.deny
    }

    pub fn permits(&self, url: &str) -> bool {
        if self.deny.iter().any(|domain| url.contains(domain.as_str())) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|domain| url.contains(domain.as_str()))
    }
}

// An empty entry would match every URL.
fn normalize(entries: impl IntoIterator<Item = String>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

use serde::{Deserialize, Serialize};

/// Configuration message a page posts to the worker once it is registered.
///
/// The field names follow the snippet that pages embed, so the wire format is
/// camelCase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigHandshake {
    pub app_name: String,
    /// Domains to intercept (empty to match every domain)
    #[serde(default)]
    pub white_list: Vec<String>,
    /// Domains never to intercept
    #[serde(default)]
    pub black_list: Vec<String>,
}

impl ConfigHandshake {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            white_list: Vec::new(),
            black_list: Vec::new(),
        }
    }

    pub fn with_white_list(mut self, domains: Vec<String>) -> Self {
        self.white_list = domains;
        self
    }

    pub fn with_black_list(mut self, domains: Vec<String>) -> Self {
        self.black_list = domains;
        self
    }

    /// Serialized form kept in the store sentinel.
    pub fn to_sentinel(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_sentinel(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAcceptedResponse {
    pub accepted: bool,
    pub tenant_prefix: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityUpdate {
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_uses_camel_case_fields() {
        let raw = r#"{"appName":"acme","whiteList":["cdn.example.com"],"blackList":[]}"#;
        let handshake: ConfigHandshake = serde_json::from_str(raw).unwrap();
        assert_eq!(handshake.app_name, "acme");
        assert_eq!(handshake.white_list, vec!["cdn.example.com".to_string()]);
        assert!(handshake.black_list.is_empty());
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let handshake: ConfigHandshake = serde_json::from_str(r#"{"appName":"acme"}"#).unwrap();
        assert!(handshake.white_list.is_empty());
        assert!(handshake.black_list.is_empty());
    }

    #[test]
    fn sentinel_round_trip() {
        let handshake = ConfigHandshake::new("acme")
            .with_white_list(vec!["example.com".into()])
            .with_black_list(vec!["ads.example.com".into()]);
        let raw = handshake.to_sentinel().unwrap();
        assert_eq!(ConfigHandshake::from_sentinel(&raw).unwrap(), handshake);
    }
}

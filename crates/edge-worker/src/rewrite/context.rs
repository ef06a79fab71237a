use url::Url;

use crate::error::RewriteError;

/// Placeholder in the tenant URL template replaced by the app name.
pub const APP_PLACEHOLDER: &str = "{app}";

/// Tenant endpoint layout every rewrite is relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    scheme: String,
    tenant_prefix: String,
    api_prefix: String,
    asset_prefix: String,
    script_url: String,
    bloom_filter_url: String,
}

impl RewriteContext {
    /// `tenant_prefix` must be an absolute http(s) URL; a trailing slash is
    /// added when missing.
    pub fn new(tenant_prefix: &str, script_name: &str) -> Result<Self, RewriteError> {
        let parsed = Url::parse(tenant_prefix)
            .map_err(|_| RewriteError::UnsupportedUrl(tenant_prefix.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RewriteError::UnsupportedUrl(tenant_prefix.to_string()));
        }

        let mut tenant_prefix = tenant_prefix.to_string();
        if !tenant_prefix.ends_with('/') {
            tenant_prefix.push('/');
        }
        let api_prefix = format!("{tenant_prefix}v1/");
        Ok(Self {
            asset_prefix: format!("{api_prefix}asset/"),
            bloom_filter_url: format!("{api_prefix}bloomfilter"),
            script_url: format!("{tenant_prefix}{}", script_name.trim_start_matches('/')),
            api_prefix,
            tenant_prefix,
            scheme: parsed.scheme().to_string(),
        })
    }

    pub fn for_app(template: &str, app_name: &str, script_name: &str) -> Result<Self, RewriteError> {
        let app_name = app_name.trim();
        if app_name.is_empty() || app_name.contains(['/', '?', '#', '@', ':']) {
            return Err(RewriteError::UnsupportedUrl(app_name.to_string()));
        }
        Self::new(&template.replace(APP_PLACEHOLDER, app_name), script_name)
    }

    /// Scheme of the tenant endpoint, used for targets that carry none.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn tenant_prefix(&self) -> &str {
        &self.tenant_prefix
    }

    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    pub fn asset_prefix(&self) -> &str {
        &self.asset_prefix
    }

    pub fn script_url(&self) -> &str {
        &self.script_url
    }

    pub fn bloom_filter_url(&self) -> &str {
        &self.bloom_filter_url
    }

    /// `<asset prefix><url without scheme>`.
    pub fn asset_url(&self, url: &str) -> String {
        format!("{}{}", self.asset_prefix, strip_scheme(url))
    }

    /// Inverse of [`Self::asset_url`], minus the scheme. URLs outside the
    /// asset prefix come back unchanged.
    pub fn extract_url<'a>(&self, url: &'a str) -> &'a str {
        url.strip_prefix(self.asset_prefix.as_str()).unwrap_or(url)
    }
}

/// Drops a leading `http://`, `https://` or scheme-relative `//`.
pub fn strip_scheme(url: &str) -> &str {
    for scheme in ["https://", "http://"] {
        if let Some(head) = url.get(..scheme.len()) {
            if head.eq_ignore_ascii_case(scheme) {
                return &url[scheme.len()..];
            }
        }
    }
    url.strip_prefix("//").unwrap_or(url)
}

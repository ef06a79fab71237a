use axum::http::{
    header::{self, AsHeaderName, HeaderName},
    HeaderMap, Method,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Headers dropped whenever a message crosses the proxy.
static HOP_BY_HOP: [HeaderName; 11] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Copy of `headers` without hop-by-hop fields.
pub fn without_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut cleaned = headers.clone();
    for name in HOP_BY_HOP.iter() {
        cleaned.remove(name);
    }
    cleaned
}

/// An outgoing request as seen by the interception boundary.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InterceptedRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Key of an entry in the response store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub method: String,
    pub url: String,
}

impl RequestIdentity {
    pub fn new(method: &Method, url: impl Into<String>) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// A complete response, as stored and as served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(with = "header_map", default)]
    pub headers: HeaderMap,
    #[serde(with = "body_base64", default)]
    pub body: Bytes,
}

impl StoredResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers,
            body: body.into(),
        }
    }

    /// Value of `name`, when present and visible ASCII.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// Applies the headers of a `304 Not Modified` to this stored response.
    ///
    /// The stored body is kept. A stale `age` is dropped unless the
    /// revalidation response carries a new one.
    pub fn refreshed_by(&self, not_modified: &StoredResponse) -> StoredResponse {
        let keep = |name: &HeaderName| !is_hop_by_hop(name) && *name != header::CONTENT_ENCODING;

        let mut headers = self.headers.clone();
        headers.remove(header::AGE);
        for name in not_modified.headers.keys().filter(|name| keep(name)) {
            headers.remove(name);
        }
        for (name, value) in not_modified.headers.iter().filter(|(name, _)| keep(name)) {
            headers.append(name.clone(), value.clone());
        }

        StoredResponse {
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}

/// Header maps as a list of `[name, value]` pairs. Values that are not
/// valid UTF-8 are written as byte arrays so nothing is lost on disk.
mod header_map {
    use axum::http::{HeaderMap, HeaderName, HeaderValue};
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Value {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = match std::str::from_utf8(value.as_bytes()) {
                    Ok(text) => Value::Text(text.to_string()),
                    Err(_) => Value::Bytes(value.as_bytes().to_vec()),
                };
                (name.as_str(), value)
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let pairs = Vec::<(String, Value)>::deserialize(deserializer)?;
        let mut headers = HeaderMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(D::Error::custom)?;
            let value = match value {
                Value::Text(text) => HeaderValue::from_str(&text),
                Value::Bytes(bytes) => HeaderValue::from_bytes(&bytes),
            }
            .map_err(D::Error::custom)?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn header_map<V: AsRef<str>>(pairs: &[(&str, V)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.as_ref().parse().unwrap(),
        );
    }
    headers
}

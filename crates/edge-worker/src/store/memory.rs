use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ResponseStore, StoreError};
use crate::message::{RequestIdentity, StoredResponse};

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<RequestIdentity, StoredResponse>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn get(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError> {
        Ok(self.entries.read().await.get(identity).cloned())
    }

    async fn put(&self, identity: &RequestIdentity, response: &StoredResponse) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(identity.clone(), response.clone());
        Ok(())
    }

    async fn delete(&self, identity: &RequestIdentity) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(identity).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::http::Method;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        let identity = RequestIdentity::get("https://acme.example/v1/asset/example.com/a.png");
        let response = StoredResponse::new(200, HeaderMap::new(), "body");

        assert!(store.get(&identity).await.unwrap().is_none());
        store.put(&identity, &response).await.unwrap();
        assert_eq!(store.get(&identity).await.unwrap(), Some(response));
        assert_eq!(store.len().await, 1);

        assert!(store.delete(&identity).await.unwrap());
        assert!(!store.delete(&identity).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn method_is_part_of_the_identity() {
        let store = MemoryStore::new();
        let url = "https://example.com/a.png";
        store
            .put(&RequestIdentity::get(url), &StoredResponse::new(200, HeaderMap::new(), "get"))
            .await
            .unwrap();

        let head = RequestIdentity::new(&Method::HEAD, url);
        assert!(store.get(&head).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = MemoryStore::new();
        let identity = RequestIdentity::get("https://example.com/");
        store
            .put(&identity, &StoredResponse::new(200, HeaderMap::new(), "v1"))
            .await
            .unwrap();
        store
            .put(&identity, &StoredResponse::new(200, HeaderMap::new(), "v2"))
            .await
            .unwrap();
        let body = store.get(&identity).await.unwrap().unwrap().body;
        assert_eq!(body, bytes::Bytes::from("v2"));
    }
}

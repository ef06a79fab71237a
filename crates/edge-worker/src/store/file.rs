use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::{ResponseStore, StoreError};
use crate::message::{RequestIdentity, StoredResponse};

/// One JSON file per entry under a root directory.
///
/// Entries are written to a temporary file and renamed into place, so a
/// reader never observes a half-written entry.
pub struct FileStore {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    identity: RequestIdentity,
    response: StoredResponse,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, identity: &RequestIdentity) -> PathBuf {
        let name = Uuid::new_v5(&Uuid::NAMESPACE_URL, identity.key().as_bytes());
        self.root.join(format!("{}.json", name.simple()))
    }
}

#[async_trait]
impl ResponseStore for FileStore {
    async fn get(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError> {
        let raw = match fs::read(self.entry_path(identity)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: FileRecord = serde_json::from_slice(&raw)?;
        if &record.identity != identity {
            return Ok(None);
        }
        Ok(Some(record.response))
    }

    async fn put(&self, identity: &RequestIdentity, response: &StoredResponse) -> Result<(), StoreError> {
        let record = FileRecord {
            identity: identity.clone(),
            response: response.clone(),
        };
        let raw = serde_json::to_vec(&record)?;

        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, &raw).await?;
        if let Err(err) = fs::rename(&tmp, self.entry_path(identity)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn delete(&self, identity: &RequestIdentity) -> Result<bool, StoreError> {
        match fs::remove_file(self.entry_path(identity)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::header_map;
    use axum::http::{HeaderMap, HeaderValue};
    use tempfile::TempDir;

    fn png_response() -> StoredResponse {
        StoredResponse::new(
            200,
            header_map(&[("content-type", "image/png"), ("cache-control", "max-age=60")]),
            vec![0x89, b'P', b'N', b'G'],
        )
    }

    #[tokio::test]
    async fn entries_survive_reopening() {
        let dir = TempDir::new().unwrap();
        let identity = RequestIdentity::get("https://acme.example/v1/asset/example.com/a.png");

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put(&identity, &png_response()).await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(&identity).await.unwrap(), Some(png_response()));
    }

    #[tokio::test]
    async fn opaque_header_values_survive_reopening() {
        let dir = TempDir::new().unwrap();
        let identity = RequestIdentity::get("https://acme.example/v1/asset/example.com/b.png");
        let mut response = png_response();
        response
            .headers
            .insert("content-disposition", HeaderValue::from_bytes(b"inline; filename=\"f\xfc.png\"").unwrap());

        FileStore::open(dir.path())
            .await
            .unwrap()
            .put(&identity, &response)
            .await
            .unwrap();

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let stored = reopened.get(&identity).await.unwrap().unwrap();
        assert_eq!(
            stored.headers["content-disposition"].as_bytes(),
            b"inline; filename=\"f\xfc.png\""
        );
        assert_eq!(stored, response);
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store
            .get(&RequestIdentity::get("https://example.com/none"))
            .await
            .unwrap()
            .is_none());
        assert!(!store
            .delete(&RequestIdentity::get("https://example.com/none"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn no_temporary_files_are_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        for i in 0..5 {
            let identity = RequestIdentity::get(format!("https://example.com/{i}"));
            store
                .put(&identity, &StoredResponse::new(200, HeaderMap::new(), "x"))
                .await
                .unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|name| name.ends_with(".json")));
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let identity = RequestIdentity::get("https://example.com/broken");
        std::fs::write(store.entry_path(&identity), b"{not json").unwrap();

        assert!(matches!(
            store.get(&identity).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}

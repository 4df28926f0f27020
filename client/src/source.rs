use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use common::helpers::is_image_file;
use tokio::sync::Mutex;
use url::Url;

use crate::{api::ApiClient, error::UploadError};

/// Where the bytes of one file are read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSource {
    Local(PathBuf),
    Remote(Url),
}

impl FileSource {
    pub async fn load(&self, api: &ApiClient) -> Result<Bytes, UploadError> {
        match self {
            Self::Local(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            Self::Remote(url) => api.fetch(url).await,
        }
    }
}

/// A logical file name paired with where to read it from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub source: FileSource,
}

/// Image files directly inside `dir`, sorted by name.
pub async fn list_local_images(dir: &Path) -> Result<Vec<SourceFile>, UploadError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_image_file(&name) || !tokio::fs::metadata(entry.path()).await?.is_file() {
            continue;
        }
        files.push(SourceFile {
            name,
            source: FileSource::Local(entry.path()),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// The descriptive parts of a STAC collection used for dataset metadata and filtering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub license_href: Option<String>,
    pub citation: Option<String>,
    pub created: Option<NaiveDateTime>,
    pub updated: Option<NaiveDateTime>,
}

impl CollectionInfo {
    /// Description followed by the license name and link, when present.
    pub fn description_with_license(&self) -> String {
        let mut text = self.description.clone().unwrap_or_default();
        if let Some(license) = &self.license {
            text.push_str("\n\nLicense: ");
            text.push_str(license);
        }
        if let Some(href) = &self.license_href {
            text.push_str("\n\nLicense href: ");
            text.push_str(href);
        }
        text
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedCollection {
    pub info: CollectionInfo,
    /// Image assets only, with absolute URLs.
    pub files: Vec<SourceFile>,
}

/// Turns a collection reference into its metadata and asset list.
#[async_trait]
pub trait CollectionResolver: Send + Sync {
    async fn resolve(&self, collection: &Url) -> Result<ResolvedCollection, UploadError>;
}

/// Keeps collections fetched while jobs are planned, so the upload of the same
/// collection does not fetch it again. Each kept collection is handed out once.
pub struct PrefetchingResolver<R> {
    inner: R,
    fetched: Mutex<HashMap<Url, ResolvedCollection>>,
}

impl<R: CollectionResolver> PrefetchingResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            fetched: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Fetches `collection` now and holds it for the next [`resolve`](CollectionResolver::resolve).
    pub async fn prefetch(&self, collection: &Url) -> Result<CollectionInfo, UploadError> {
        let resolved = self.inner.resolve(collection).await?;
        let info = resolved.info.clone();
        self.fetched.lock().await.insert(collection.clone(), resolved);
        Ok(info)
    }

    /// Drops a prefetched collection that will not be uploaded.
    pub async fn discard(&self, collection: &Url) {
        self.fetched.lock().await.remove(collection);
    }
}

#[async_trait]
impl<R: CollectionResolver> CollectionResolver for PrefetchingResolver<R> {
    async fn resolve(&self, collection: &Url) -> Result<ResolvedCollection, UploadError> {
        if let Some(resolved) = self.fetched.lock().await.remove(collection) {
            return Ok(resolved);
        }
        self.inner.resolve(collection).await
    }
}

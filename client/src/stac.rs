use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::Arc,
};

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use common::{
    helpers::{clean_dataset_name, is_image_file, sanitize_dataset_name},
    RetryPolicy,
};
use futures_util::Stream;
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    error::UploadError,
    source::{CollectionInfo, CollectionResolver, FileSource, ResolvedCollection, SourceFile},
    transport::{ApiRequest, RetryingTransport, Transport},
};

#[derive(Deserialize, Debug)]
struct Link {
    rel: String,
    href: String,
}

#[derive(Deserialize, Debug)]
struct Asset {
    href: String,
}

#[derive(Deserialize, Debug)]
struct Catalog {
    #[serde(default)]
    links: Vec<Link>,
}

/// The subset of a STAC collection document this tool reads.
#[derive(Deserialize, Debug)]
struct Collection {
    title: Option<String>,
    description: Option<String>,
    license: Option<String>,
    #[serde(rename = "sci:citation")]
    citation: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    assets: BTreeMap<String, Asset>,
    #[serde(default)]
    summaries: Map<String, Value>,
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS[.f]` and plain dates.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn canonical(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Reads STAC catalogs and collections over HTTP.
pub struct StacResolver {
    transport: RetryingTransport,
}

impl StacResolver {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport: RetryingTransport::new(transport, policy),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, UploadError> {
        self.transport
            .execute(&ApiRequest::get(url.as_str()))
            .await?
            .json()
    }

    /// Collection URLs reachable from `root`, produced lazily. Sub-catalogs are
    /// queued on a worklist and every URL is visited at most once, so cyclic
    /// links terminate. The first failing fetch ends the stream with an error.
    pub fn walk_catalog(&self, root: Url) -> impl Stream<Item = Result<Url, UploadError>> + '_ {
        try_stream! {
            let root = canonical(root);
            let mut visited = HashSet::from([root.clone()]);
            let mut pending = VecDeque::from([root]);
            while let Some(catalog_url) = pending.pop_front() {
                info!("getting child collection urls from {catalog_url}");
                let catalog: Catalog = self.get_json(&catalog_url).await?;
                for link in catalog.links.iter().filter(|link| link.rel == "child") {
                    let child = canonical(catalog_url.join(&link.href).map_err(UploadError::from)?);
                    if !visited.insert(child.clone()) {
                        debug!("skipping already visited {child}");
                        continue;
                    }
                    if link.href.ends_with("collection.json") {
                        yield child;
                    } else if link.href.ends_with("catalog.json") {
                        pending.push_back(child);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CollectionResolver for StacResolver {
    async fn resolve(&self, collection_url: &Url) -> Result<ResolvedCollection, UploadError> {
        let collection: Collection = self.get_json(collection_url).await?;
        let license_href = collection
            .links
            .iter()
            .find(|link| link.rel == "license")
            .map(|link| link.href.clone());
        if license_href.is_none() {
            warn!("Can't find license href in {collection_url}");
        }
        let timestamp = |key: &str| {
            collection
                .summaries
                .get(key)
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
        };
        let info = CollectionInfo {
            title: collection.title.clone(),
            description: collection.description.clone(),
            license: collection.license.clone(),
            license_href,
            citation: collection.citation.clone(),
            created: timestamp("created"),
            updated: timestamp("updated"),
        };
        let mut files = Vec::new();
        for (name, asset) in &collection.assets {
            if !is_image_file(name) {
                continue;
            }
            files.push(SourceFile {
                name: name.clone(),
                source: FileSource::Remote(collection_url.join(&asset.href)?),
            });
        }
        debug!("{collection_url} has {} image assets", files.len());
        Ok(ResolvedCollection { info, files })
    }
}

/// Name for a dataset built from a collection: the caller's name if it survives
/// sanitization, otherwise the collection title, otherwise `untitled_<index>`.
pub fn collection_dataset_name(requested: &str, title: Option<&str>, index: usize) -> String {
    clean_dataset_name(requested)
        .or_else(|| title.and_then(clean_dataset_name))
        .unwrap_or_else(|| {
            warn!("No legal character. Dataset named 'untitled_{index}'");
            format!("untitled_{index}")
        })
}

/// Keyword and date filters applied to collections before they are scheduled.
#[derive(Clone, Debug, Default)]
pub struct CollectionFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub created_before: Option<NaiveDateTime>,
    pub created_after: Option<NaiveDateTime>,
    pub updated_before: Option<NaiveDateTime>,
    pub updated_after: Option<NaiveDateTime>,
}

fn outside(value: NaiveDateTime, after: Option<NaiveDateTime>, before: Option<NaiveDateTime>) -> bool {
    before.is_some_and(|b| value > b) || after.is_some_and(|a| value < a)
}

impl CollectionFilter {
    /// True when no keyword or date restriction is set.
    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.created_before.is_none()
            && self.created_after.is_none()
            && self.updated_before.is_none()
            && self.updated_after.is_none()
    }

    pub fn accepts(&self, info: &CollectionInfo) -> bool {
        let name = sanitize_dataset_name(info.title.as_deref().unwrap_or_default());
        let lowered = name.to_lowercase();
        if let Some(word) = self
            .exclude
            .iter()
            .find(|word| lowered.contains(&word.to_lowercase()))
        {
            warn!("Dataset {name} excluded for containing word {word}");
            return false;
        }
        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|word| lowered.contains(&word.to_lowercase()))
        {
            warn!("Dataset {name} excluded for not containing word(s) from {:?}", self.include);
            return false;
        }
        let (Some(created), Some(updated)) = (info.created, info.updated) else {
            warn!("Can't find legal created/updated timestamp for {name}");
            return true;
        };
        if outside(created, self.created_after, self.created_before) {
            warn!("{name} created at {created}, outside the requested range");
            return false;
        }
        if outside(updated, self.updated_after, self.updated_before) {
            warn!("{name} updated at {updated}, outside the requested range");
            return false;
        }
        true
    }
}

mod api;
mod dataset;
mod error;
mod scheduler;
mod source;
mod stac;
#[cfg(test)]
mod testing;
mod transport;
mod upload;

use std::{
    collections::HashMap,
    io::{stderr, IsTerminal},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand, ValueEnum};
use common::{
    helpers::clean_dataset_name, payloads::BoundingBox, Backoff, DatasetId, DatasetJob,
    DatasetResult, RetryPolicy, SourceLocation,
};
use futures_util::{pin_mut, StreamExt};
use log::{error, info, warn, LevelFilter};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    api::ApiClient,
    dataset::DatasetUploader,
    scheduler::BatchScheduler,
    source::{CollectionResolver, PrefetchingResolver},
    stac::{collection_dataset_name, parse_timestamp, CollectionFilter, StacResolver},
    transport::{HttpTransport, Transport},
};

const DEFAULT_BASE_URL: &str = "https://api.geonadir.com";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDateTime, String> {
    parse_timestamp(s).ok_or_else(|| format!("unrecognised date {s:?}, expected YYYY-MM-DD or RFC 3339"))
}

#[derive(clap::Args, Debug, Clone)]
struct UploadOptions {
    /// API token, sent as `Token <value>`.
    #[arg(long)]
    token: String,

    #[arg(long)]
    private: bool,

    /// JSON file mapping dataset names to extra creation fields.
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Trigger post-processing once a dataset is uploaded.
    #[arg(long)]
    complete: bool,

    #[arg(long, default_value_t = 5)]
    max_retry: u32,

    /// Seconds before the first retry.
    #[arg(long, default_value_t = 10)]
    retry_interval: u64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Wait the same interval before every retry instead of doubling it.
    #[arg(long)]
    fixed_backoff: bool,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct FilterOptions {
    /// Keep only collections whose name contains one of these words.
    #[arg(long, num_args = 1..)]
    include: Vec<String>,

    /// Skip collections whose name contains any of these words.
    #[arg(long, num_args = 1..)]
    exclude: Vec<String>,

    #[arg(long, value_parser = parse_date)]
    created_before: Option<NaiveDateTime>,

    #[arg(long, value_parser = parse_date)]
    created_after: Option<NaiveDateTime>,

    #[arg(long, value_parser = parse_date)]
    updated_before: Option<NaiveDateTime>,

    #[arg(long, value_parser = parse_date)]
    updated_after: Option<NaiveDateTime>,
}

impl From<FilterOptions> for CollectionFilter {
    fn from(options: FilterOptions) -> Self {
        Self {
            include: options.include,
            exclude: options.exclude,
            created_before: options.created_before,
            created_after: options.created_after,
            updated_before: options.updated_before,
            updated_after: options.updated_after,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Upload local image directories, one dataset per item.
    LocalUpload {
        /// Dataset name and image directory.
        #[arg(long = "item", num_args = 2, value_names = ["NAME", "DIRECTORY"], required = true)]
        items: Vec<String>,

        /// Add the images to this existing dataset instead of creating one.
        #[arg(long)]
        dataset_id: Option<DatasetId>,

        #[command(flatten)]
        options: UploadOptions,
    },
    /// Upload the image assets of STAC collections, one dataset per item.
    CollectionUpload {
        /// Dataset name and collection.json URL.
        #[arg(long = "item", num_args = 2, value_names = ["NAME", "URL"], required = true)]
        items: Vec<String>,

        #[arg(long)]
        dataset_id: Option<DatasetId>,

        #[command(flatten)]
        options: UploadOptions,

        #[command(flatten)]
        filter: FilterOptions,
    },
    /// Upload every collection reachable from a STAC catalog.
    CatalogUpload {
        catalog: Url,

        #[command(flatten)]
        options: UploadOptions,

        #[command(flatten)]
        filter: FilterOptions,
    },
    /// Search datasets by keyword.
    Search {
        search: String,
    },
    /// Show the metadata of one dataset.
    DatasetInfo {
        dataset_id: DatasetId,
    },
    /// List datasets inside a bounding box.
    Range {
        #[arg(allow_negative_numbers = true)]
        left: f64,
        #[arg(allow_negative_numbers = true)]
        bottom: f64,
        #[arg(allow_negative_numbers = true)]
        right: f64,
        #[arg(allow_negative_numbers = true)]
        top: f64,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

/// Everything an upload run decides once, before jobs are built.
struct UploadSettings {
    token: String,
    private: bool,
    complete: bool,
    retry: RetryPolicy,
    dataset_id: Option<DatasetId>,
    metadata: Map<String, Value>,
}

impl UploadSettings {
    async fn load(options: &UploadOptions, dataset_id: Option<DatasetId>) -> Result<Self> {
        let backoff = if options.fixed_backoff {
            Backoff::Fixed
        } else {
            Backoff::Exponential
        };
        let metadata = match &options.metadata {
            Some(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Map::new(),
        };
        Ok(Self {
            token: format!("Token {}", options.token),
            private: options.private,
            complete: options.complete,
            retry: RetryPolicy::new(
                options.max_retry,
                Duration::from_secs(options.retry_interval),
                Duration::from_secs(options.timeout),
            )
            .with_backoff(backoff),
            dataset_id,
            metadata,
        })
    }

    fn job(&self, name: &str, source: SourceLocation) -> DatasetJob {
        let mut job = DatasetJob::new(name, source)
            .with_private(self.private)
            .with_post_processing(self.complete)
            .with_retry(self.retry);
        if let Some(dataset_id) = self.dataset_id {
            job = job.with_dataset_id(dataset_id);
        }
        match self.metadata.get(job.dataset_name()).cloned() {
            Some(Value::Object(fields)) => job.with_metadata(fields),
            Some(other) => {
                warn!("metadata for {} is not an object, ignoring: {other}", job.dataset_name());
                job
            }
            None => job,
        }
    }
}

fn item_pairs(items: &[String]) -> impl Iterator<Item = (&str, &str)> {
    items
        .chunks_exact(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
}

fn warn_duplicate_names(jobs: &[DatasetJob]) {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for job in jobs {
        *counts.entry(job.dataset_name()).or_default() += 1;
    }
    for (name, count) in counts.into_iter().filter(|(_, count)| *count > 1) {
        warn!("dataset name {name} is used by {count} items");
    }
}

type CollectionSource = PrefetchingResolver<StacResolver>;

/// Builds a job for a collection, or `None` if the filter rejects it. The
/// collection is only fetched when its title or dates are actually needed,
/// and a fetched collection is kept for the upload.
async fn collection_job(
    resolver: &CollectionSource,
    settings: &UploadSettings,
    filter: &CollectionFilter,
    requested: &str,
    url: Url,
    index: usize,
) -> Result<Option<DatasetJob>> {
    let mut name = clean_dataset_name(requested);
    if name.is_none() || !filter.is_unrestricted() {
        let info = resolver
            .prefetch(&url)
            .await
            .with_context(|| format!("reading collection {url}"))?;
        if !filter.accepts(&info) {
            resolver.discard(&url).await;
            return Ok(None);
        }
        name = Some(collection_dataset_name(requested, info.title.as_deref(), index));
    }
    let name = name.unwrap_or_else(|| format!("untitled_{index}"));
    Ok(Some(settings.job(&name, SourceLocation::Collection(url))))
}

/// One job per accepted collection. A collection that cannot be read is
/// logged and skipped; the rest are still planned.
async fn plan_collection_jobs(
    resolver: &CollectionSource,
    settings: &UploadSettings,
    filter: &CollectionFilter,
    items: Vec<(String, Url)>,
) -> Vec<DatasetJob> {
    let mut jobs = Vec::new();
    for (index, (requested, url)) in items.into_iter().enumerate() {
        match collection_job(resolver, settings, filter, &requested, url, index).await {
            Ok(Some(job)) => jobs.push(job),
            Ok(None) => {}
            Err(e) => error!("skipping collection: {e:#}"),
        }
    }
    jobs
}

fn report(results: &[DatasetResult]) -> Result<()> {
    let mut failed = 0;
    for result in results {
        let id = result
            .dataset_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let records = result.records.as_deref().unwrap_or_default();
        if result.is_success() {
            let confirmed = records.iter().filter(|r| r.present_in_remote_listing).count();
            info!(
                "{} (id {id}): {} file(s) uploaded, {confirmed} confirmed by the API",
                result.dataset_name,
                records.len()
            );
            continue;
        }
        failed += 1;
        let note = if records.is_empty() {
            ""
        } else {
            "; dataset probably incomplete"
        };
        error!(
            "{} (id {id}) failed at {}: {}{note}",
            result.dataset_name,
            result.failure_stage,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    if failed > 0 {
        bail!("{failed} of {} dataset(s) failed", results.len());
    }
    Ok(())
}

async fn run_uploads(
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn CollectionResolver>,
    base_url: &str,
    settings: &UploadSettings,
    jobs: Vec<DatasetJob>,
) -> Result<()> {
    if jobs.is_empty() {
        warn!("nothing to upload");
        return Ok(());
    }
    warn_duplicate_names(&jobs);
    let uploader = DatasetUploader::new(transport, resolver, base_url, &settings.token)
        .with_progress(stderr().is_terminal());
    let results = BatchScheduler::new(Arc::new(uploader)).run(jobs).await;
    report(&results)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.log_level.into())
        .init();

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let base_url = args.base_url.as_str();

    match args.command {
        Command::LocalUpload {
            items,
            dataset_id,
            options,
        } => {
            let settings = UploadSettings::load(&options, dataset_id).await?;
            let jobs = item_pairs(&items)
                .map(|(name, dir)| settings.job(name, SourceLocation::LocalDirectory(PathBuf::from(dir))))
                .collect();
            let resolver = Arc::new(StacResolver::new(transport.clone(), settings.retry));
            run_uploads(transport, resolver, base_url, &settings, jobs).await
        }
        Command::CollectionUpload {
            items,
            dataset_id,
            options,
            filter,
        } => {
            let settings = UploadSettings::load(&options, dataset_id).await?;
            let filter = CollectionFilter::from(filter);
            let resolver = Arc::new(PrefetchingResolver::new(StacResolver::new(
                transport.clone(),
                settings.retry,
            )));
            let mut collections = Vec::new();
            for (name, location) in item_pairs(&items) {
                match Url::parse(location) {
                    Ok(url) => collections.push((name.to_string(), url)),
                    Err(e) => error!("skipping {name}: invalid collection url {location}: {e}"),
                }
            }
            let jobs = plan_collection_jobs(&resolver, &settings, &filter, collections).await;
            run_uploads(transport, resolver, base_url, &settings, jobs).await
        }
        Command::CatalogUpload {
            catalog,
            options,
            filter,
        } => {
            let settings = UploadSettings::load(&options, None).await?;
            let filter = CollectionFilter::from(filter);
            let resolver = Arc::new(PrefetchingResolver::new(StacResolver::new(
                transport.clone(),
                settings.retry,
            )));
            let mut collections = Vec::new();
            {
                let found = resolver.inner().walk_catalog(catalog);
                pin_mut!(found);
                while let Some(url) = found.next().await {
                    match url {
                        Ok(url) => collections.push((String::new(), url)),
                        Err(e) => error!("catalog walk stopped early: {e}"),
                    }
                }
            }
            let jobs = plan_collection_jobs(&resolver, &settings, &filter, collections).await;
            info!("{} collection(s) selected from the catalog", jobs.len());
            run_uploads(transport, resolver, base_url, &settings, jobs).await
        }
        Command::Search { search } => {
            let api = ApiClient::new(transport, base_url, "", RetryPolicy::default());
            print_json(&api.search_datasets(&search).await?)
        }
        Command::DatasetInfo { dataset_id } => {
            let api = ApiClient::new(transport, base_url, "", RetryPolicy::default());
            let metadata = api.dataset_metadata(dataset_id).await?;
            print_json(&serde_json::to_value(metadata)?)
        }
        Command::Range {
            left,
            bottom,
            right,
            top,
        } => {
            let api = ApiClient::new(transport, base_url, "", RetryPolicy::default());
            let bbox = BoundingBox {
                left,
                bottom,
                right,
                top,
            };
            print_json(&api.datasets_in_bbox(bbox).await?)
        }
    }
}

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    helpers::{clickable_link, original_filename},
    payloads::DatasetMetadata,
    DatasetId, DatasetJob, DatasetResult, FailureStage, FileUploadRecord, SourceLocation,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};

use crate::{
    api::ApiClient,
    error::UploadError,
    scheduler::JobRunner,
    source::{list_local_images, CollectionInfo, CollectionResolver, ResolvedCollection, SourceFile},
    transport::Transport,
    upload::upload_one,
};

/// How long the API gets to index new files before the listing is compared.
pub const SETTLE_DELAY: Duration = Duration::from_secs(15);

/// Runs one [`DatasetJob`] end to end: resolve or create the dataset, upload
/// every file, reconcile with the remote listing, optionally trigger processing.
pub struct DatasetUploader {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn CollectionResolver>,
    base_url: String,
    token: String,
    settle_delay: Duration,
    progress: Option<MultiProgress>,
}

impl DatasetUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn CollectionResolver>,
        base_url: &str,
        token: &str,
    ) -> Self {
        Self {
            transport,
            resolver,
            base_url: base_url.to_string(),
            token: token.to_string(),
            settle_delay: SETTLE_DELAY,
            progress: None,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Show one progress bar per running dataset.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled.then(MultiProgress::new);
        self
    }

    fn progress_bar(&self, dataset_name: &str, total: usize) -> Option<ProgressBar> {
        let multi = self.progress.as_ref()?;
        let bar = multi.add(ProgressBar::new(total as u64));
        if let Ok(style) = ProgressStyle::with_template("{prefix:>24} [{bar:40}] {pos}/{len} ({elapsed})") {
            bar.set_style(style);
        }
        bar.set_prefix(dataset_name.to_string());
        Some(bar)
    }

    pub async fn upload(&self, job: DatasetJob) -> DatasetResult {
        let api = ApiClient::new(self.transport.clone(), &self.base_url, &self.token, job.retry());
        let mut collection = None;

        let (dataset_id, dataset_name) = match self.resolve_dataset(&api, &job, &mut collection).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Create dataset {} failed: {e}", job.dataset_name());
                return DatasetResult::failed(
                    job.dataset_name().to_string(),
                    job.dataset_id(),
                    None,
                    FailureStage::DatasetCreation,
                    e,
                );
            }
        };
        info!("Dataset name: {dataset_name}, dataset ID: {dataset_id}");

        let mut records = Vec::new();
        if let Err(e) = self
            .upload_files(&api, &job, dataset_id, &dataset_name, collection, &mut records)
            .await
        {
            error!("Uploading images for {dataset_name} failed: {e}");
            let records = (!records.is_empty()).then_some(records);
            return DatasetResult::failed(dataset_name, Some(dataset_id), records, FailureStage::FileUpload, e);
        }

        info!("waiting {:?} for {dataset_name} to be indexed", self.settle_delay);
        sleep(self.settle_delay).await;
        match api.list_uploaded_files(dataset_id).await {
            Ok(remote_names) => {
                debug!("{dataset_name} remote listing: {remote_names:?}");
                reconcile(&mut records, &remote_names);
            }
            Err(e) => {
                error!("Retrieving image status for {dataset_name} failed: {e}");
                return DatasetResult::failed(
                    dataset_name,
                    Some(dataset_id),
                    Some(records),
                    FailureStage::ListingReconciliation,
                    e,
                );
            }
        }

        if job.triggers_post_processing() {
            if let Err(e) = api.trigger_post_processing(dataset_id).await {
                error!("Triggering post-processing for {dataset_name} failed: {e}");
                return DatasetResult::failed(
                    dataset_name,
                    Some(dataset_id),
                    Some(records),
                    FailureStage::PostProcessingTrigger,
                    e,
                );
            }
            info!("post-processing triggered for {dataset_name}");
        }

        DatasetResult::completed(dataset_name, dataset_id, records)
    }

    /// Returns the dataset id and the name results are reported under. A
    /// collection resolved on the way is left in `collection` for reuse.
    async fn resolve_dataset(
        &self,
        api: &ApiClient,
        job: &DatasetJob,
        collection: &mut Option<ResolvedCollection>,
    ) -> Result<(DatasetId, String), UploadError> {
        if let Some(dataset_id) = job.dataset_id() {
            let invalid = |reason: String| UploadError::InvalidDatasetId { dataset_id, reason };
            return match api.dataset_metadata(dataset_id).await {
                Ok(DatasetMetadata::NotFound(reason)) => Err(invalid(reason)),
                Ok(metadata) => {
                    let name = metadata
                        .project_name()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("<dataset id: {dataset_id}>"));
                    info!("Upload to existing dataset id {dataset_id} ({name})");
                    Ok((dataset_id, name))
                }
                Err(e) => Err(invalid(e.to_string())),
            };
        }

        let info = match job.source() {
            SourceLocation::Collection(url) => {
                let resolved = self.resolver.resolve(url).await?;
                Some(&collection.insert(resolved).info)
            }
            SourceLocation::LocalDirectory(_) => None,
        };
        let fields = dataset_fields(job, info);
        info!("Metadata for dataset {}: {fields:?}", job.dataset_name());
        let dataset_id = api.create_dataset(&fields).await?;
        Ok((dataset_id, job.dataset_name().to_string()))
    }

    async fn enumerate(
        &self,
        job: &DatasetJob,
        collection: Option<ResolvedCollection>,
    ) -> Result<Vec<SourceFile>, UploadError> {
        match job.source() {
            SourceLocation::LocalDirectory(dir) => list_local_images(dir).await,
            SourceLocation::Collection(url) => {
                let resolved = match collection {
                    Some(resolved) => resolved,
                    None => self.resolver.resolve(url).await?,
                };
                if resolved.files.is_empty() {
                    return Err(UploadError::NoApplicableFiles(url.to_string()));
                }
                Ok(resolved.files)
            }
        }
    }

    /// Uploads files one after another. The first failure stops the dataset;
    /// the failing file still gets a record without a status.
    async fn upload_files(
        &self,
        api: &ApiClient,
        job: &DatasetJob,
        dataset_id: DatasetId,
        dataset_name: &str,
        collection: Option<ResolvedCollection>,
        records: &mut Vec<FileUploadRecord>,
    ) -> Result<(), UploadError> {
        let files = self.enumerate(job, collection).await?;
        if files.is_empty() {
            warn!("no image files for {dataset_name} in {}", job.source());
        }
        let bar = self.progress_bar(dataset_name, files.len());

        for file in files {
            let mut record = FileUploadRecord {
                dataset_remote_id: dataset_id,
                dataset_name: dataset_name.to_string(),
                file_name: file.name.clone(),
                http_status: None,
                upload_duration: Duration::ZERO,
                file_size_bytes: 0,
                present_in_remote_listing: false,
                remote_url: None,
            };
            let content = match file.source.load(api).await {
                Ok(content) => content,
                Err(e) => {
                    error!("Error when reading {}", file.name);
                    records.push(record);
                    return Err(e);
                }
            };
            record.file_size_bytes = content.len() as u64;

            let start = Instant::now();
            let outcome = upload_one(api, dataset_id, &file.name, content).await;
            record.upload_duration = start.elapsed();
            match outcome {
                Ok(status) => {
                    record.http_status = Some(status);
                    records.push(record);
                }
                Err(e) => {
                    error!("Error when uploading {}", file.name);
                    records.push(record);
                    return Err(e);
                }
            }
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        Ok(())
    }
}

#[async_trait]
impl JobRunner for DatasetUploader {
    async fn run(&self, job: DatasetJob) -> DatasetResult {
        self.upload(job).await
    }
}

fn form_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Form fields for dataset creation. Caller metadata overrides anything
/// derived from the collection; links in the free-text fields are wrapped last.
pub fn dataset_fields(job: &DatasetJob, collection: Option<&CollectionInfo>) -> Vec<(String, String)> {
    let mut fields = Map::new();
    fields.insert("dataset_name".into(), Value::from(job.dataset_name()));
    fields.insert("is_private".into(), Value::from(job.is_private()));
    fields.insert("is_published".into(), Value::from(true));

    if let Some(info) = collection {
        if let Some(citation) = info.citation.as_deref().filter(|c| !c.is_empty()) {
            fields.insert("data_credits".into(), Value::from(citation));
        }
        let description = info.description_with_license();
        if !description.is_empty() {
            fields.insert("description".into(), Value::from(description));
        }
    }
    if let Some(overrides) = job.metadata() {
        for (key, value) in overrides {
            fields.insert(key.clone(), value.clone());
        }
    }
    for key in ["description", "data_credits"] {
        if let Some(Value::String(text)) = fields.get_mut(key) {
            *text = clickable_link(text);
        }
    }
    fields.into_iter().map(|(k, v)| (k, form_value(v))).collect()
}

/// Marks each record whose file shows up in the remote listing. Remote entries
/// are URLs; their last path segment without the query string is compared.
pub fn reconcile(records: &mut [FileUploadRecord], remote_names: &[String]) {
    for record in records.iter_mut() {
        let found = remote_names.iter().find(|name| {
            let remote = original_filename(name);
            !remote.is_empty() && record.file_name.contains(remote)
        });
        record.present_in_remote_listing = found.is_some();
        record.remote_url = found.cloned();
    }
}

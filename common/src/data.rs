use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::helpers::sanitize_dataset_name;

/// Identifier the imagery API assigns to a dataset.
pub type DatasetId = u64;

/// Upper bound for a single exponential backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `retry_interval`.
    Fixed,
    /// Wait `retry_interval * 2^(n-1)` before retry `n`, capped at [`MAX_BACKOFF`].
    Exponential,
}

/// Retry settings applied to every network call made on behalf of one job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retry: u32,
    pub retry_interval: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retry: u32, retry_interval: Duration, timeout: Duration) -> Self {
        Self {
            max_retry,
            retry_interval,
            timeout,
            backoff: Backoff::Exponential,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_retry.saturating_add(1)
    }

    /// Delay to sleep before retry number `retry` (1-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_interval,
            Backoff::Exponential => {
                let factor = 1u32
                    .checked_shl(retry.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                self.retry_interval.saturating_mul(factor).min(MAX_BACKOFF)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10), Duration::from_secs(60))
    }
}

/// Where the files of a dataset come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocation {
    LocalDirectory(PathBuf),
    /// URL of a STAC `collection.json`.
    Collection(Url),
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalDirectory(path) => write!(f, "{}", path.display()),
            Self::Collection(url) => write!(f, "{url}"),
        }
    }
}

/// One dataset to upload. Built once before scheduling and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct DatasetJob {
    dataset_id: Option<DatasetId>,
    dataset_name: String,
    source: SourceLocation,
    private: bool,
    metadata: Option<Map<String, Value>>,
    trigger_post_processing: bool,
    retry: RetryPolicy,
}

impl DatasetJob {
    /// The name is sanitized here; see [`sanitize_dataset_name`].
    pub fn new(dataset_name: &str, source: SourceLocation) -> Self {
        Self {
            dataset_id: None,
            dataset_name: sanitize_dataset_name(dataset_name),
            source,
            private: false,
            metadata: None,
            trigger_post_processing: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Upload into an existing remote dataset instead of creating one.
    pub fn with_dataset_id(mut self, dataset_id: DatasetId) -> Self {
        self.dataset_id = Some(dataset_id);
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Key/value overrides for the dataset creation payload.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_post_processing(mut self, trigger: bool) -> Self {
        self.trigger_post_processing = trigger;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dataset_id(&self) -> Option<DatasetId> {
        self.dataset_id
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn source(&self) -> &SourceLocation {
        &self.source
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata.as_ref()
    }

    pub fn triggers_post_processing(&self) -> bool {
        self.trigger_post_processing
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}

/// Outcome of one attempted file upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileUploadRecord {
    pub dataset_remote_id: DatasetId,
    pub dataset_name: String,
    pub file_name: String,
    /// Status of the final protocol step, `None` when the upload failed.
    pub http_status: Option<u16>,
    pub upload_duration: Duration,
    pub file_size_bytes: u64,
    /** Filled in by listing reconciliation. */
    pub present_in_remote_listing: bool,
    pub remote_url: Option<String>,
}

/// Stage at which a dataset run stopped.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    None,
    DatasetCreation,
    FileUpload,
    ListingReconciliation,
    PostProcessingTrigger,
    /// The orchestrator task itself died (panic).
    Internal,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DatasetCreation => "dataset-creation",
            Self::FileUpload => "file-upload",
            Self::ListingReconciliation => "listing-reconciliation",
            Self::PostProcessingTrigger => "post-processing-trigger",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one orchestrator run produced.
#[derive(Serialize, Clone, Debug)]
pub struct DatasetResult {
    pub dataset_name: String,
    pub dataset_id: Option<DatasetId>,
    /// `None` when the run failed before any record existed.
    pub records: Option<Vec<FileUploadRecord>>,
    pub failure_stage: FailureStage,
    pub error: Option<String>,
}

impl DatasetResult {
    pub fn completed(
        dataset_name: String,
        dataset_id: DatasetId,
        records: Vec<FileUploadRecord>,
    ) -> Self {
        Self {
            dataset_name,
            dataset_id: Some(dataset_id),
            records: Some(records),
            failure_stage: FailureStage::None,
            error: None,
        }
    }

    pub fn failed(
        dataset_name: String,
        dataset_id: Option<DatasetId>,
        records: Option<Vec<FileUploadRecord>>,
        stage: FailureStage,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            dataset_name,
            dataset_id,
            records,
            failure_stage: stage,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_stage == FailureStage::None
    }
}

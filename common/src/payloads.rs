use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::DatasetId;

pub mod flags {
    pub const UPLOAD_COMPLETED: &str = "upload_completed";
}

// Response payloads

/// Body of `POST /api/dataset/`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DatasetCreated {
    pub id: DatasetId,
}

/// Body of `GET /api/metadata/`. The API answers with a bare string when the
/// dataset does not exist.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum DatasetMetadata {
    Found(Map<String, Value>),
    NotFound(String),
}

impl DatasetMetadata {
    pub fn project_name(&self) -> Option<&str> {
        match self {
            Self::Found(fields) => fields.get("project_id")?.get("project_name")?.as_str(),
            Self::NotFound(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PresignedFields {
    pub key: String,
    pub policy: String,
    pub signature: String,
}

/// Body of `POST /api/generate_presigned_url/`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PresignedUpload {
    pub fields: Vec<PresignedFields>,
    /// Storage endpoint the file is posted to.
    pub url: String,
    #[serde(rename = "AWSAccessKeyId")]
    pub access_key_id: String,
}

impl PresignedUpload {
    pub fn credentials(&self) -> Option<&PresignedFields> {
        self.fields.first()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct UploadedFile {
    pub upload_files: String,
}

/// One page of `GET /api/uploadfiles/`.
#[derive(Deserialize, Clone, Debug)]
pub struct UploadedFilesPage {
    pub results: Vec<UploadedFile>,
    pub next: Option<String>,
}

// Request payloads

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PresignRequest {
    pub dataset_id: String,
    pub images: Vec<String>,
}

impl PresignRequest {
    pub fn single(dataset_id: DatasetId, image: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            images: vec![image.to_string()],
        }
    }
}

/// Query area for `GET /api/dataset_coords`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl BoundingBox {
    /// Orders the corners and clamps them to valid longitude/latitude ranges.
    pub fn normalized(self) -> Self {
        Self {
            left: self.left.min(self.right).max(-180.0),
            right: self.left.max(self.right).min(180.0),
            bottom: self.bottom.min(self.top).max(-90.0),
            top: self.bottom.max(self.top).min(90.0),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.left, self.bottom, self.right, self.top)
    }
}

use bytes::Bytes;
use common::{payloads::PresignedUpload, DatasetId};
use log::debug;

use crate::{api::ApiClient, error::UploadError};

/// One image moving through the presign, transfer and register steps.
#[derive(Debug)]
pub struct ImageUpload {
    dataset_id: DatasetId,
    file_name: String,
    presigned: PresignedUpload,
}

fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

impl ImageUpload {
    /// Step 1: ask the API where the file should go.
    pub async fn new(api: &ApiClient, dataset_id: DatasetId, file_name: &str) -> Result<Self, UploadError> {
        let file_name = basename(file_name).to_string();
        let wrap = |e| UploadError::PresignRequestFailed(Box::new(e));
        let presigned = api
            .generate_presigned_url(dataset_id, &file_name)
            .await
            .map_err(wrap)?;
        if presigned.credentials().is_none() {
            return Err(wrap(UploadError::BadResponse(
                "presigned url response has no fields".to_string(),
            )));
        }
        Ok(Self {
            dataset_id,
            file_name,
            presigned,
        })
    }

    pub fn key(&self) -> &str {
        self.presigned
            .credentials()
            .map(|fields| fields.key.as_str())
            .unwrap_or_default()
    }

    /// Step 2: post the bytes to storage.
    pub async fn transfer(&self, api: &ApiClient, content: Bytes) -> Result<u16, UploadError> {
        api.upload_to_storage(&self.presigned, &self.file_name, content)
            .await
            .map_err(|e| UploadError::StorageUploadFailed(Box::new(e)))
    }

    /// Step 3: attach the stored object to the dataset.
    pub async fn register(&self, api: &ApiClient) -> Result<u16, UploadError> {
        api.create_post_image(self.dataset_id, self.key())
            .await
            .map_err(|e| UploadError::RegistrationFailed(Box::new(e)))
    }
}

/// Uploads one file and returns the status code of the registration step.
/// A failing step stops the protocol; later steps are not attempted.
pub async fn upload_one(
    api: &ApiClient,
    dataset_id: DatasetId,
    file_name: &str,
    content: Bytes,
) -> Result<u16, UploadError> {
    let upload = ImageUpload::new(api, dataset_id, file_name).await?;
    debug!("{} -> {}", file_name, upload.key());
    upload.transfer(api, content).await?;
    upload.register(api).await
}

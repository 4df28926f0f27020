use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use common::{
    helpers::strip_storage_prefix,
    payloads::{
        flags, BoundingBox, DatasetCreated, DatasetMetadata, PresignRequest, PresignedUpload,
        UploadedFilesPage,
    },
    DatasetId, RetryPolicy,
};
use log::debug;
use serde_json::Value;
use url::Url;

use crate::{
    error::UploadError,
    transport::{ApiRequest, FormPart, RetryingTransport, Transport},
};

/// Endpoints of the imagery API. Every call goes through the retrying transport
/// with the policy the client was built with.
#[derive(Clone)]
pub struct ApiClient {
    transport: RetryingTransport,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: &str,
        token: &str,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport: RetryingTransport::new(transport, policy),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    fn endpoint_with(&self, path: &str, params: &[(&str, String)]) -> Result<String, UploadError> {
        Ok(Url::parse_with_params(&self.endpoint(path), params)?.to_string())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, UploadError> {
        let req = ApiRequest::get(url).authorization(&self.token);
        self.transport.execute(&req).await?.json()
    }

    /// `fields` are sent as a multipart form; returns the new dataset's id.
    pub async fn create_dataset(&self, fields: &[(String, String)]) -> Result<DatasetId, UploadError> {
        let parts = fields
            .iter()
            .map(|(name, value)| FormPart::text(name, value.clone()))
            .collect();
        let req = ApiRequest::post(self.endpoint("dataset/"))
            .authorization(&self.token)
            .form(parts);
        let created: DatasetCreated = self.transport.execute(&req).await?.json()?;
        Ok(created.id)
    }

    pub async fn dataset_metadata(&self, dataset_id: DatasetId) -> Result<DatasetMetadata, UploadError> {
        let url = self.endpoint_with("metadata/", &[("project_id", dataset_id.to_string())])?;
        self.get_json(url).await
    }

    pub async fn generate_presigned_url(
        &self,
        dataset_id: DatasetId,
        image_name: &str,
    ) -> Result<PresignedUpload, UploadError> {
        let req = ApiRequest::post(self.endpoint("generate_presigned_url/"))
            .authorization(&self.token)
            .json(&PresignRequest::single(dataset_id, image_name))?;
        self.transport.execute(&req).await?.json()
    }

    /// Posts the file to the storage URL from step one. The presigned fields
    /// authorize this request, so no token is attached.
    pub async fn upload_to_storage(
        &self,
        presigned: &PresignedUpload,
        file_name: &str,
        content: Bytes,
    ) -> Result<u16, UploadError> {
        let credentials = presigned.credentials().ok_or_else(|| {
            UploadError::BadResponse("presigned url response has no fields".to_string())
        })?;
        let req = ApiRequest::post(presigned.url.clone()).form(vec![
            FormPart::text("key", credentials.key.clone()),
            FormPart::text("AWSAccessKeyId", presigned.access_key_id.clone()),
            FormPart::text("policy", credentials.policy.clone()),
            FormPart::text("signature", credentials.signature.clone()),
            FormPart::File {
                name: "file".to_string(),
                file_name: file_name.to_string(),
                content,
            },
        ]);
        Ok(self.transport.execute(&req).await?.status)
    }

    pub async fn create_post_image(&self, dataset_id: DatasetId, key: &str) -> Result<u16, UploadError> {
        let req = ApiRequest::post(self.endpoint("create_post_image/"))
            .authorization(&self.token)
            .form(vec![
                FormPart::text("dataset_id", dataset_id.to_string()),
                FormPart::text("image", strip_storage_prefix(key)),
            ]);
        Ok(self.transport.execute(&req).await?.status)
    }

    /// Every file name the API lists for the dataset, following `next` links.
    pub async fn list_uploaded_files(&self, dataset_id: DatasetId) -> Result<Vec<String>, UploadError> {
        let mut next = Some(self.endpoint_with(
            "uploadfiles/",
            &[("page", "1".to_string()), ("project_id", dataset_id.to_string())],
        )?);
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        while let Some(url) = next.take() {
            if !seen.insert(url.clone()) {
                return Err(UploadError::BadResponse(format!("pagination loops back to {url}")));
            }
            let page: UploadedFilesPage = self.get_json(url).await?;
            names.extend(page.results.into_iter().map(|file| file.upload_files));
            next = page.next.filter(|url| !url.is_empty());
        }
        debug!("dataset {dataset_id} lists {} files", names.len());
        Ok(names)
    }

    pub async fn trigger_post_processing(&self, dataset_id: DatasetId) -> Result<(), UploadError> {
        let req = ApiRequest::post(self.endpoint("utility/dataset-actions/"))
            .authorization(&self.token)
            .form(vec![
                FormPart::text("dataset_id", dataset_id.to_string()),
                FormPart::text("flag", flags::UPLOAD_COMPLETED),
            ]);
        self.transport.execute(&req).await?;
        Ok(())
    }

    /// Downloads a remote asset. Asset hosts are third parties, so no token.
    pub async fn fetch(&self, url: &Url) -> Result<Bytes, UploadError> {
        Ok(self.transport.execute(&ApiRequest::get(url.as_str())).await?.body)
    }

    pub async fn search_datasets(&self, search: &str) -> Result<Value, UploadError> {
        let url = self.endpoint_with("search_datasets", &[("search", search.to_string())])?;
        self.get_json(url).await
    }

    pub async fn datasets_in_bbox(&self, bbox: BoundingBox) -> Result<Value, UploadError> {
        let url = self.endpoint_with("dataset_coords", &[("bbox", bbox.normalized().to_string())])?;
        self.get_json(url).await
    }
}

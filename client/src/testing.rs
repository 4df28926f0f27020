//! Scripted transports for unit tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::{
    error::UploadError,
    transport::{ApiRequest, ApiResponse, Body, FormPart, Transport},
};

type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, UploadError> + Send + Sync>;

pub fn respond(status: u16, body: &str) -> Result<ApiResponse, UploadError> {
    Ok(ApiResponse {
        status,
        body: Bytes::from(body.to_string()),
    })
}

pub fn respond_json(value: Value) -> Result<ApiResponse, UploadError> {
    respond(200, &value.to_string())
}

pub fn form_text<'a>(request: &'a ApiRequest, name: &str) -> Option<&'a str> {
    let Body::Form(parts) = &request.body else {
        return None;
    };
    parts.iter().find_map(|part| match part {
        FormPart::Text { name: n, value } if n == name => Some(value.as_str()),
        _ => None,
    })
}

/// Answers every request with `handler` and records what was sent.
pub struct MockTransport {
    handler: Handler,
    overrides: Mutex<Option<(usize, Handler)>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, UploadError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            overrides: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answer the next `n` requests with `handler` instead.
    pub fn fail_first(
        &self,
        n: usize,
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, UploadError> + Send + Sync + 'static,
    ) {
        *self.overrides.lock().unwrap() = Some((n, Box::new(handler)));
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|req| req.url).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest, _timeout: Duration) -> Result<ApiResponse, UploadError> {
        self.calls.lock().unwrap().push(request.clone());
        let mut overrides = self.overrides.lock().unwrap();
        if let Some((remaining, handler)) = overrides.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return handler(request);
            }
        }
        drop(overrides);
        (self.handler)(request)
    }
}

pub const FAKE_DATASET_ID: u64 = 77;

/// In-memory stand-in for the imagery API and its storage bucket.
#[derive(Default)]
pub struct FakeApi {
    pub fail_create: bool,
    pub fail_listing: bool,
    pub fail_trigger: bool,
    /// Storage rejects files whose name contains one of these.
    pub reject_files: HashSet<String>,
    /// Extra names the listing returns besides the registered ones.
    pub extra_listed: Vec<String>,
    /// Image keys passed to `create_post_image`, in call order.
    pub registered: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    fn presigned_key(req: &ApiRequest) -> String {
        let name = match &req.body {
            Body::Json(body) => body["images"][0].as_str().unwrap_or_default().to_string(),
            _ => String::new(),
        };
        format!("privateuploads/images/{FAKE_DATASET_ID}-abc/{name}")
    }

    fn stored_file_name(req: &ApiRequest) -> String {
        match &req.body {
            Body::Form(parts) => parts
                .iter()
                .find_map(|part| match part {
                    FormPart::File { file_name, .. } => Some(file_name.clone()),
                    _ => None,
                })
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    pub fn handle(&self, req: &ApiRequest) -> Result<ApiResponse, UploadError> {
        let url = req.url.as_str();
        if url.starts_with("https://storage.test/") {
            let name = Self::stored_file_name(req);
            if self.reject_files.iter().any(|bad| name.contains(bad.as_str())) {
                return respond(403, "AccessDenied");
            }
            return respond(204, "");
        }
        if url.starts_with("https://assets.test/") {
            return respond(200, "remote-bytes");
        }
        if url.ends_with("/api/dataset/") {
            if self.fail_create {
                return respond(500, "create failed");
            }
            return respond(201, &json!({ "id": FAKE_DATASET_ID }).to_string());
        }
        if url.contains("/api/metadata/") {
            if url.contains(&format!("project_id={FAKE_DATASET_ID}")) {
                return respond_json(json!({"project_id": {"project_name": "Existing Survey"}}));
            }
            return respond_json(json!("Metadata not found"));
        }
        if url.ends_with("/api/generate_presigned_url/") {
            return respond_json(json!({
                "fields": [{"key": Self::presigned_key(req), "policy": "p", "signature": "s"}],
                "url": "https://storage.test/",
                "AWSAccessKeyId": "AKIA"
            }));
        }
        if url.ends_with("/api/create_post_image/") {
            let image = form_text(req, "image").unwrap_or_default().to_string();
            self.registered.lock().unwrap().push(image);
            return respond(201, "");
        }
        if url.contains("/api/uploadfiles/") {
            if self.fail_listing {
                return Err(UploadError::Connection("listing unreachable".to_string()));
            }
            let names: Vec<Value> = self
                .registered()
                .iter()
                .map(|key| json!({ "upload_files": format!("https://storage.test/privateuploads/{key}?Signature=xyz") }))
                .chain(self.extra_listed.iter().map(|n| json!({ "upload_files": n })))
                .collect();
            return respond_json(json!({ "results": names, "next": null }));
        }
        if url.ends_with("/api/utility/dataset-actions/") {
            if self.fail_trigger {
                return respond(500, "trigger failed");
            }
            return respond(200, "{}");
        }
        respond(404, "unknown endpoint")
    }

    pub fn into_transport(self: Arc<Self>) -> Arc<MockTransport> {
        MockTransport::new(move |req| self.handle(req))
    }
}

// backup-agent/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::operation::put_object::PutObjectError;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::{error, info};

use super::{ArtifactUploader, object_key};
use crate::config::StorageCredentials;
use crate::errors::{AppError, Result};

/// Uploads artifacts to an S3-compatible object store (Huawei OBS, Spaces,
/// MinIO, AWS).
#[derive(Debug, Clone, Default)]
pub struct S3Uploader;

impl S3Uploader {
    pub fn new() -> Self {
        Self
    }

    async fn client(storage: &StorageCredentials) -> s3::Client {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(storage.endpoint_url())
            .region(Region::new(storage.region().to_string()))
            .credentials_provider(s3::config::Credentials::new(
                &storage.ak,
                &storage.sk,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;
        s3::Client::new(&sdk_config)
    }
}

/// Keeps the HTTP status and the service error code/message of a failed put.
fn upload_error(err: SdkError<PutObjectError>) -> AppError {
    let status = err.raw_response().map(|response| response.status().as_u16());
    let (code, message) = match err.as_service_error() {
        Some(service) => (
            service.code().unwrap_or("Unknown").to_string(),
            service
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
        ),
        None => ("Transport".to_string(), DisplayErrorContext(&err).to_string()),
    };
    AppError::Upload {
        status,
        code,
        message,
    }
}

#[async_trait]
impl ArtifactUploader for S3Uploader {
    async fn upload(
        &self,
        storage: &StorageCredentials,
        folder: &str,
        artifact: &Path,
    ) -> Result<String> {
        let key = object_key(folder, artifact);
        info!(%key, bucket = %storage.bucket_name, "Uploading artifact");

        let body = ByteStream::from_path(artifact)
            .await
            .map_err(|e| AppError::Upload {
                status: None,
                code: "LocalRead".to_string(),
                message: format!("Failed to read {}: {}", artifact.display(), e),
            })?;

        let client = Self::client(storage).await;
        match client
            .put_object()
            .bucket(&storage.bucket_name)
            .key(&key)
            .body(body)
            .send()
            .await
        {
            Ok(_) => {
                info!(%key, bucket = %storage.bucket_name, "Upload succeeded");
                Ok(key)
            }
            Err(err) => {
                let err = upload_error(err);
                error!(%key, bucket = %storage.bucket_name, error = %err, "Upload failed");
                Err(err)
            }
        }
    }
}

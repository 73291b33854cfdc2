//! AWS S3 and S3-compatible remote backend

use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use segstore_common::config::S3Config;
use segstore_common::{Error, Result};
use std::io::Write;
use std::time::{Duration, SystemTime};
use tracing::{debug, instrument};

use super::backend::{ObjectInfo, RemoteBackend};

/// S3 bucket backend
pub struct S3Backend {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3Backend {
    /// Build a client for the configured bucket
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "segstore-config",
            ));
        }
        let shared = loader.load().await;

        let mut builder = S3ConfigBuilder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        debug!(
            "Created S3 backend for bucket '{}' in region '{}'",
            config.bucket, config.region
        );
        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        })
    }
}

fn backend_error(op: &str, key: &str, err: impl std::fmt::Display) -> Error {
    Error::Backend(format!("S3 {} {}: {}", op, key, err))
}

#[async_trait]
impl RemoteBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self, sink))]
    async fn read(&self, key: &str, sink: &mut (dyn Write + Send)) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    Error::ObjectNotFound {
                        key: key.to_string(),
                    }
                } else {
                    backend_error("get", key, e)
                }
            })?;

        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| backend_error("get", key, e))?
        {
            sink.write_all(&chunk)
                .map_err(|e| Error::Storage(format!("failed to write {}: {}", key, e)))?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend_error("put", key, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| backend_error("list", prefix, e))?;

            for object in response.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| u64::try_from(t.secs()).ok())
                    .map_or(SystemTime::UNIX_EPOCH, |secs| {
                        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
                    });
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    last_modified,
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("delete", key, e))?;
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
            Err(e) => Err(backend_error("head", &self.bucket, e)),
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            let location = aws_sdk_s3::types::CreateBucketConfiguration::builder()
                .location_constraint(aws_sdk_s3::types::BucketLocationConstraint::from(
                    self.region.as_str(),
                ))
                .build();
            request = request.create_bucket_configuration(location);
        }
        request
            .send()
            .await
            .map_err(|e| backend_error("create bucket", &self.bucket, e))?;
        Ok(())
    }
}

//! S3 object sink
//!
//! Streams bodies into S3 or any S3-compatible store. A body that fits in a
//! single part is sent with PutObject; anything larger is cut into parts as
//! it arrives and sent as a multipart upload, which is aborted if the body
//! or any request fails.
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | put | `s3.put` | bucket, key, bytes, etag, parts |
//! | delete | `s3.delete_object` | bucket, key |

use super::multipart::{CompletedPart, MultipartUpload, PartBuffer};
use super::{Credentials, ObjectSink, StoreError, StoredObject, WriteOptions};
use crate::config::StorageConfig;
use crate::upload::ByteStream;
use async_trait::async_trait;
use aws_credential_types::Credentials as AwsCredentials;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, ObjectCannedAcl,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;

fn request_error<E, R>(op: &str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    StoreError::Request(format!("{} failed: {}", op, DisplayErrorContext(err)))
}

/// Object sink writing to one S3 bucket
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: Client,
    bucket: String,
    public_url: String,
    part_size: usize,
}

impl S3Sink {
    /// Build the client for `config`
    ///
    /// SDK retries are disabled; a failed request fails the variant.
    pub fn new(config: &StorageConfig, credentials: &Credentials) -> Self {
        let creds = AwsCredentials::new(
            credentials.access_key_id(),
            credentials.secret_access_key(),
            credentials.session_token().map(String::from),
            None,
            "mizuchi-fanout",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(creds)
            .retry_config(RetryConfig::disabled());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let public_url = config
            .public_url
            .clone()
            .or_else(|| config.endpoint.clone())
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            public_url,
            part_size: config.part_size,
        }
    }

    fn acl(options: &WriteOptions) -> Option<ObjectCannedAcl> {
        options.acl.as_deref().map(ObjectCannedAcl::from)
    }

    fn metadata(options: &WriteOptions) -> Option<HashMap<String, String>> {
        if options.metadata.is_empty() {
            None
        } else {
            Some(
                options
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        }
    }

    fn content_encoding(options: &WriteOptions) -> Option<String> {
        options.gzip.then(|| "gzip".to_string())
    }

    async fn put_single(
        &self,
        key: &str,
        options: &WriteOptions,
        body: Bytes,
    ) -> Result<Option<String>, StoreError> {
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&options.content_type)
            .set_acl(Self::acl(options))
            .set_content_encoding(Self::content_encoding(options))
            .set_metadata(Self::metadata(options))
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| request_error("PutObject", e))?;

        Ok(output.e_tag().map(String::from))
    }

    async fn create_multipart(
        &self,
        key: &str,
        options: &WriteOptions,
    ) -> Result<MultipartUpload, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&options.content_type)
            .set_acl(Self::acl(options))
            .set_content_encoding(Self::content_encoding(options))
            .set_metadata(Self::metadata(options))
            .send()
            .await
            .map_err(|e| request_error("CreateMultipartUpload", e))?;

        let upload_id = output.upload_id().ok_or_else(|| {
            StoreError::Request("CreateMultipartUpload returned no upload id".into())
        })?;
        tracing::debug!(key, upload_id, "Started multipart upload");

        Ok(MultipartUpload::new(upload_id, key))
    }

    async fn upload_part(&self, upload: &mut MultipartUpload, body: Bytes) -> Result<(), StoreError> {
        let part_number = upload.next_part_number().ok_or_else(|| {
            StoreError::Request(format!("Multipart upload of '{}' exceeds part limit", upload.key))
        })?;

        let bytes = body.len();
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number as i32)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| request_error("UploadPart", e))?;

        tracing::trace!(part_number, bytes, "Uploaded part");
        upload.parts.push(CompletedPart {
            part_number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        });
        Ok(())
    }

    async fn complete(&self, upload: &MultipartUpload) -> Result<Option<String>, StoreError> {
        let parts = upload
            .parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| request_error("CompleteMultipartUpload", e))?;

        Ok(output.e_tag().map(String::from))
    }

    async fn abort(&self, upload: &MultipartUpload) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(
                key = %upload.key,
                upload_id = %upload.upload_id,
                error = %DisplayErrorContext(e),
                "Failed to abort multipart upload"
            );
        }
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn public_base_url(&self) -> String {
        self.public_url.clone()
    }

    #[tracing::instrument(
        name = "s3.put",
        skip(self, options, body),
        fields(
            s3.bucket = %self.bucket,
            s3.key = %key,
            upload.bytes = tracing::field::Empty,
            s3.etag = tracing::field::Empty,
            s3.parts = tracing::field::Empty
        ),
        err
    )]
    async fn put(
        &self,
        key: &str,
        options: &WriteOptions,
        mut body: ByteStream,
    ) -> Result<StoredObject, StoreError> {
        let mut buffer = PartBuffer::new(self.part_size);
        let mut multipart: Option<MultipartUpload> = None;
        let mut bytes = 0u64;

        while let Some(chunk) = body.next().await {
            let full_part = match chunk {
                Ok(chunk) => {
                    bytes += chunk.len() as u64;
                    buffer.push(&chunk)
                }
                Err(e) => {
                    if let Some(upload) = multipart.take() {
                        self.abort(&upload).await;
                    }
                    return Err(StoreError::Body(e));
                }
            };
            let Some(part) = full_part else {
                continue;
            };

            let mut upload = match multipart.take() {
                Some(upload) => upload,
                None => self.create_multipart(key, options).await?,
            };
            if let Err(e) = self.upload_part(&mut upload, part).await {
                self.abort(&upload).await;
                return Err(e);
            }
            multipart = Some(upload);
        }

        let span = tracing::Span::current();
        let etag = match multipart {
            None => self.put_single(key, options, buffer.finish()).await?,
            Some(mut upload) => {
                let tail = buffer.finish();
                if !tail.is_empty() {
                    if let Err(e) = self.upload_part(&mut upload, tail).await {
                        self.abort(&upload).await;
                        return Err(e);
                    }
                }
                span.record("s3.parts", upload.parts.len());
                match self.complete(&upload).await {
                    Ok(etag) => etag,
                    Err(e) => {
                        self.abort(&upload).await;
                        return Err(e);
                    }
                }
            }
        };

        span.record("upload.bytes", bytes);
        if let Some(etag) = &etag {
            span.record("s3.etag", etag.as_str());
        }
        tracing::debug!(bytes, "Object stored");

        Ok(StoredObject {
            key: key.to_string(),
            bytes,
            etag,
        })
    }

    #[tracing::instrument(
        name = "s3.delete_object",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.key = %key),
        err
    )]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => {
                Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => Err(request_error("DeleteObject", e)),
        }
    }
}

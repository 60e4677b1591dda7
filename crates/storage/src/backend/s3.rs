//! S3-compatible storage backend.
//!
//! This module provides a storage backend implementation for S3-compatible
//! services including AWS S3, Backblaze B2, Tigris (Fly.io), MinIO and others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly by the caller. Resolving them
//! (profiles, keyrings, environment) is somebody else's problem.
//!
//! # Identity
//!
//! Objects are identified by their ETag. For single-part uploads that's the
//! MD5 of the content, for multipart uploads it isn't a content hash at all,
//! which is why [`IdentityKind::ETag`] never compares equal to anything a
//! [`LocalBackend`](super::LocalBackend) produces.

use crate::backend::{BoxRead, RecordStream};
use crate::error::{ErrorKind, Result};
use crate::file::{FileRecord, Identity, IdentityKind, key_of};
use crate::path::{relative_to, validate_prefix};
use crate::{StorageBackend, validate_path};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
    types::{CompletedMultipartUpload, CompletedPart, Object},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// Objects at or above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
/// Size of each part of a multipart upload (S3 minimum is 5 MiB).
const PART_SIZE: u64 = 16 * 1024 * 1024;

/// S3-compatible storage backend.
///
/// Stores files in an S3 bucket, optionally under a key prefix. All paths are
/// relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use ferry_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "archive",
///     "my-bucket",
///     Some("instrument-a/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests. Closed by `close()`.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in display/logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let region = Region::new(region.into());
        let credentials = Credentials::new(key_id, key_secret, None, None, "ferry");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region)
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        // Set custom endpoint for non-AWS services
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Self::from_client(name, Client::from_conf(config_builder.build()), bucket, prefix)
    }

    /// Wrap an already configured client.
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        let prefix = validate_prefix(prefix.as_deref().map(Path::new))?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p.clone())))
            .transpose()?;
        Ok(Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative path.
    fn full_key(&self, path: &Path) -> Result<String> {
        let key = key_of(&validate_path(path)?);
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key,
        })
    }

    /// Key prefix to hand to `ListObjectsV2` for a listing beneath `prefix`.
    fn list_prefix(&self, prefix: Option<&Path>) -> Result<Option<String>> {
        let relative = validate_prefix(prefix)?.map(|p| key_of(&p));
        Ok(match (&self.prefix, relative) {
            (Some(root), Some(relative)) => Some(format!("{root}/{relative}/")),
            (Some(root), None) => Some(format!("{root}/")),
            (None, Some(relative)) => Some(format!("{relative}/")),
            (None, None) => None,
        })
    }

    /// Strip the configured prefix from an S3 key to get relative path.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        let root = self.prefix.as_deref().map(Path::new);
        let relative = relative_to(root, Path::new(key)).ok_or_raise(|| {
            ErrorKind::BackendError(format!("key `{key}` is outside of prefix `{:?}`", self.prefix))
        })?;
        validate_path(relative)
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        // The semaphore is only ever closed by `close()`.
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::Unavailable(format!("backend `{}` is closed", self.name)))
    }

    /// Convert AWS DateTime to OffsetDateTime.
    fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    fn etag(tag: &str) -> Identity {
        Identity::new(IdentityKind::ETag, tag.trim_matches('"'))
    }

    fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, path: &Path) -> ErrorKind
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let status = err.raw_response().map(|r| r.status().as_u16());
        match (&err, status) {
            (_, Some(404)) => ErrorKind::NotFound(path.to_path_buf()),
            (_, Some(401 | 403)) => ErrorKind::PermissionDenied(path.to_path_buf()),
            (SdkError::DispatchFailure(_) | SdkError::TimeoutError(_), _) => {
                ErrorKind::Unavailable(DisplayErrorContext(&err).to_string())
            },
            (SdkError::ResponseError(_), _) => ErrorKind::Network(DisplayErrorContext(&err).to_string()),
            _ => ErrorKind::BackendError(DisplayErrorContext(&err).to_string()),
        }
    }

    /// Turn one listed object into a record. Keys that end in `/` are
    /// directory markers.
    fn object_record(&self, object: &Object) -> Result<FileRecord> {
        let key = object.key().ok_or_raise(|| ErrorKind::BackendError("listed object without a key".to_string()))?;
        let path = self.relative_path(key)?;
        let modified = match object.last_modified() {
            Some(dt) => Self::parse_datetime(dt)?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        if key.ends_with('/') {
            return Ok(FileRecord::directory(path, modified));
        }
        let size = u64::try_from(object.size().unwrap_or(0)).unwrap_or(0);
        let mut record = FileRecord::file(path, size, modified);
        if let Some(tag) = object.e_tag() {
            record = record.with_identity(Self::etag(tag));
        }
        if let Some(class) = object.storage_class() {
            record = record.with_storage_tier(class.as_str());
        }
        Ok(record)
    }

    /// Read up to `limit` bytes from the stream.
    async fn read_chunk(reader: &mut BoxRead, limit: u64, path: &Path) -> Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(usize::try_from(limit).unwrap_or(0).min(PART_SIZE as usize));
        reader.take(limit).read_to_end(&mut chunk).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        })?;
        Ok(chunk)
    }

    fn check_size(path: &Path, expected: u64, actual: u64) -> Result<()> {
        if expected != actual {
            exn::bail!(ErrorKind::SizeMismatch {
                path: path.to_path_buf(),
                expected,
                actual
            });
        }
        Ok(())
    }

    async fn put_single(&self, key: &str, path: &Path, reader: &mut BoxRead, expected_size: u64) -> Result<u64> {
        let data = Self::read_chunk(reader, expected_size.saturating_add(1), path).await?;
        Self::check_size(path, expected_size, data.len() as u64)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(i64::try_from(expected_size).unwrap_or(i64::MAX))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        Ok(expected_size)
    }

    async fn put_multipart(&self, key: &str, path: &Path, reader: &mut BoxRead, expected_size: u64) -> Result<u64> {
        let upload = {
            let _permit = self.acquire_permit().await?;
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, path))?
        };
        let upload_id = upload
            .upload_id()
            .ok_or_raise(|| ErrorKind::BackendError("multipart upload without an id".to_string()))?
            .to_string();
        match self.upload_parts(key, &upload_id, path, reader, expected_size).await {
            Ok(written) => Ok(written),
            Err(e) => {
                // Incomplete multipart uploads are invisible to listings but
                // still billed; clean them up.
                let aborted = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort) = aborted {
                    tracing::warn!(backend = %self.name, key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            },
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        reader: &mut BoxRead,
        expected_size: u64,
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut written = 0u64;
        let mut part_number = 1;
        while written < expected_size {
            let chunk = Self::read_chunk(reader, PART_SIZE.min(expected_size - written), path).await?;
            if chunk.is_empty() {
                break;
            }
            written += chunk.len() as u64;
            let _permit = self.acquire_permit().await?;
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, path))?;
            parts.push(CompletedPart::builder().set_e_tag(part.e_tag().map(String::from)).part_number(part_number).build());
            part_number += 1;
        }
        // Anything left in the stream means it was longer than announced.
        let trailing = Self::read_chunk(reader, 1, path).await?;
        Self::check_size(path, expected_size, written + trailing.len() as u64)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        Ok(written)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RecordStream<'a> {
        let key_prefix = match self.list_prefix(prefix) {
            Ok(key_prefix) => key_prefix,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        let listed = prefix.map(Path::to_path_buf).unwrap_or_default();

        Box::pin(stream! {
            let _permit = match self.acquire_permit().await {
                Ok(permit) => permit,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(key_prefix.clone())
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(exn::Exn::from(Self::map_sdk_error(e, &listed)));
                        return;
                    },
                };
                for object in page.contents() {
                    // The marker for the listed prefix itself is not beneath it.
                    if key_prefix.as_deref().is_some_and(|p| object.key() == Some(p)) {
                        continue;
                    }
                    yield self.object_record(object);
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn reader(&self, path: &Path) -> Result<BoxRead> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        Ok(Box::pin(object.body.into_async_read()))
    }

    async fn write(&self, path: &Path, mut reader: BoxRead, expected_size: u64) -> Result<u64> {
        let key = self.full_key(path)?;
        // PutObject is atomic by itself; multipart uploads only become
        // visible once completed.
        let written = match expected_size >= MULTIPART_THRESHOLD {
            true => self.put_multipart(&key, path, &mut reader, expected_size).await?,
            false => self.put_single(&key, path, &mut reader, expected_size).await?,
        };
        tracing::trace!(backend = %self.name, key, bytes = written, "Uploaded object");
        Ok(written)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        // DeleteObject succeeds for missing keys; callers expect NotFound.
        // Directories only exist as `key/` markers.
        let key = match self.stat(path).await {
            Ok(_) => self.full_key(path)?,
            Err(e) if e.is_not_found() => {
                let marker = format!("{}/", self.full_key(path)?);
                let _permit = self.acquire_permit().await?;
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(&marker)
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error(e, path))?;
                marker
            },
            Err(e) => return Err(e),
        };
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileRecord> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, path))?;
        let modified = match head.last_modified() {
            Some(dt) => Self::parse_datetime(dt)?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        let size = u64::try_from(head.content_length().unwrap_or(0)).unwrap_or(0);
        let mut record = FileRecord::file(validate_path(path)?, size, modified);
        if let Some(tag) = head.e_tag() {
            record = record.with_identity(Self::etag(tag));
        }
        if let Some(class) = head.storage_class() {
            record = record.with_storage_tier(class.as_str());
        }
        Ok(record)
    }

    async fn close(&self) -> Result<()> {
        // Requests already holding a permit finish; everything after fails
        // with Unavailable.
        self.rate_limiter.close();
        Ok(())
    }
}

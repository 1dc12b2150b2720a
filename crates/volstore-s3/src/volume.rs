use std::sync::Arc;

use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::Object;
use aws_sdk_s3::Client as S3Client;
use tokio::runtime::Runtime;
use tracing::{debug, instrument, warn};
use volstore_core::{
    EntryKind, RemoteVolume, StorageError, StorageResult, UploadBatch, UploadOp, VolumeConnector,
    VolumeEntry,
};

use crate::config::S3Config;

/// A volume stored under one key prefix of an S3-compatible bucket.
///
/// Layout in the bucket:
/// ```text
/// {bucket}/
///   {volume}/                 # volume root marker
///     sub/                    # zero-byte directory marker
///     sub/a.json              # file
/// ```
///
/// Directories without a marker (created implicitly by a deeper upload) are
/// still listed, with an mtime of 0. Requests are not retried.
#[derive(Clone)]
pub struct S3Volume {
    client: S3Client,
    bucket: String,
    name: String,
    runtime: Arc<Runtime>,
}

impl std::fmt::Debug for S3Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Volume")
            .field("bucket", &self.bucket)
            .field("name", &self.name)
            .finish()
    }
}

/// Files and immediate subdirectories found under one prefix.
#[derive(Debug, Default)]
struct Listing {
    objects: Vec<Object>,
    prefixes: Vec<String>,
    saw_marker: bool,
}

impl Listing {
    fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.prefixes.is_empty()
    }
}

impl S3Volume {
    /// Create a volume handle. The runtime drives every request and must not
    /// be the runtime of the calling thread.
    pub fn new(client: S3Client, bucket: String, name: String, runtime: Arc<Runtime>) -> Self {
        Self {
            client,
            bucket,
            name,
            runtime,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    // =========================================================================
    // S3 primitives
    // =========================================================================

    async fn head(&self, key: &str) -> StorageResult<Option<HeadObjectOutput>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Ok(None);
                }
                Err(remote_error("head_object", key, service_error))
            }
        }
    }

    /// Put an object. With `create_only`, an existing key makes this return
    /// `AlreadyExists` (412 on `If-None-Match: *`).
    async fn put(&self, key: &str, data: Vec<u8>, create_only: bool) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));
        if create_only {
            request = request.if_none_match("*");
        }
        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if is_precondition_failed(&e) => Err(StorageError::already_exists("put_object", key)),
            Err(e) => Err(remote_error("put_object", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| remote_error("delete_object", key, e))
    }

    /// One level of listing under `prefix` (delimited by `/`).
    async fn list_level(&self, prefix: &str) -> StorageResult<Listing> {
        let mut listing = Listing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/");
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| remote_error("list_objects", prefix, e))?;

            for object in output.contents.unwrap_or_default() {
                match object.key.as_deref() {
                    Some(key) if key == prefix => listing.saw_marker = true,
                    Some(key) if key.ends_with('/') => {}
                    Some(_) => listing.objects.push(object),
                    None => {}
                }
            }
            listing.prefixes.extend(
                output
                    .common_prefixes
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.prefix),
            );

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }
        Ok(listing)
    }

    /// Every key under `prefix`, recursively.
    async fn list_all(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| remote_error("list_objects", prefix, e))?;

            keys.extend(
                output
                    .contents
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|o| o.key),
            );
            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }
        Ok(keys)
    }

    /// Create the marker for a directory unless it is already there.
    async fn ensure_marker(&self, key: &str) -> StorageResult<()> {
        match self.put(key, Vec::new(), true).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    fn relative<'a>(&self, key: &'a str) -> &'a str {
        relative_path(&self.name, key).unwrap_or(key)
    }
}

impl RemoteVolume for S3Volume {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), level = "debug")]
    fn read_chunks(&self, path: &str) -> StorageResult<Vec<Vec<u8>>> {
        let key = object_key(&self.name, path);
        self.runtime.block_on(async {
            let output = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    let service_error = e.into_service_error();
                    if service_error.is_no_such_key() {
                        return Err(StorageError::not_found("read_chunks", path));
                    }
                    return Err(remote_error("get_object", &key, service_error));
                }
            };

            let mut body = output.body;
            let mut chunks = Vec::new();
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| remote_error("get_object", &key, e))?
            {
                chunks.push(chunk.to_vec());
            }
            debug!(key = %key, chunks = chunks.len(), "read object");
            Ok(chunks)
        })
    }

    #[instrument(skip_all, level = "debug", fields(volume = %self.name, ops = batch.ops().len(), force = batch.force()))]
    fn apply_batch(&self, batch: UploadBatch) -> StorageResult<()> {
        let force = batch.force();
        self.runtime.block_on(async {
            for op in batch.into_ops() {
                match op {
                    UploadOp::File { data, dest } => {
                        if dest.is_empty() {
                            return Err(StorageError::remote(
                                "apply_batch",
                                "/",
                                "cannot write a file at the volume root",
                            ));
                        }
                        let key = object_key(&self.name, &dest);
                        debug!(key = %key, len = data.len(), "put file");
                        self.put(&key, data, !force)
                            .await
                            .map_err(|e| e.at("apply_batch", &dest))?;
                    }
                    UploadOp::Directory { dest } => {
                        let key = dir_key(&self.name, &dest);
                        debug!(key = %key, "put directory marker");
                        self.ensure_marker(&key).await?;
                    }
                }
            }
            Ok(())
        })
    }

    #[instrument(skip(self), level = "debug")]
    fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let rel = path.trim_matches('/');
        if rel.is_empty() {
            return Err(StorageError::remote("remove", "/", "cannot remove the volume root"));
        }
        self.runtime.block_on(async {
            let key = object_key(&self.name, rel);
            if self.head(&key).await?.is_some() {
                return self.delete(&key).await;
            }

            let prefix = dir_key(&self.name, rel);
            let keys = self.list_all(&prefix).await?;
            if keys.is_empty() {
                return Err(StorageError::not_found("remove", rel));
            }
            if !recursive && keys.iter().any(|k| k != &prefix) {
                return Err(StorageError::remote("remove", rel, "directory not empty"));
            }
            for key in &keys {
                self.delete(key).await?;
            }
            debug!(prefix = %prefix, objects = keys.len(), "removed directory");
            Ok(())
        })
    }

    #[instrument(skip(self), level = "debug")]
    fn iterate_directory(&self, path: &str) -> StorageResult<Vec<VolumeEntry>> {
        let rel = path.trim_matches('/');
        self.runtime.block_on(async {
            if !rel.is_empty() {
                if let Some(head) = self.head(&object_key(&self.name, rel)).await? {
                    return Ok(vec![VolumeEntry {
                        path: rel.to_string(),
                        kind: EntryKind::File,
                        mtime: secs(head.last_modified.as_ref()),
                        size: head.content_length.unwrap_or(0).max(0) as u64,
                    }]);
                }
            }

            let prefix = dir_key(&self.name, rel);
            let listing = self.list_level(&prefix).await?;
            if !rel.is_empty() && !listing.saw_marker && listing.is_empty() {
                return Err(StorageError::not_found("iterate_directory", rel));
            }

            let mut entries = Vec::with_capacity(listing.objects.len() + listing.prefixes.len());
            for object in &listing.objects {
                let Some(key) = object.key.as_deref() else {
                    continue;
                };
                entries.push(VolumeEntry {
                    path: self.relative(key).to_string(),
                    kind: EntryKind::File,
                    mtime: secs(object.last_modified.as_ref()),
                    size: object.size.unwrap_or(0).max(0) as u64,
                });
            }
            for dir_prefix in &listing.prefixes {
                let mtime = match self.head(dir_prefix).await? {
                    Some(head) => secs(head.last_modified.as_ref()),
                    None => {
                        warn!(prefix = %dir_prefix, "directory has no marker; reporting mtime 0");
                        0.0
                    }
                };
                entries.push(VolumeEntry {
                    path: self.relative(dir_prefix).to_string(),
                    kind: EntryKind::Directory,
                    mtime,
                    size: 0,
                });
            }
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
    }
}

/// Connects to volumes stored in one bucket.
///
/// Owns the tokio runtime shared by every volume it hands out; callers stay
/// synchronous and must not call in from inside another runtime.
#[derive(Clone)]
pub struct S3Connector {
    client: S3Client,
    bucket: String,
    runtime: Arc<Runtime>,
}

impl S3Connector {
    pub fn new(client: S3Client, bucket: String, runtime: Arc<Runtime>) -> Self {
        Self {
            client,
            bucket,
            runtime,
        }
    }

    /// Build the runtime and the S3 client from configuration.
    ///
    /// Explicit credentials win; otherwise the default AWS provider chain
    /// (environment, profile, instance metadata) is used.
    pub fn from_config(config: &S3Config) -> StorageResult<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| StorageError::configuration("an S3 bucket is required for remote volumes"))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| StorageError::configuration(format!("failed to start async runtime: {}", e)))?;

        let client = runtime.block_on(build_client(config));
        debug!(bucket = %bucket, endpoint = ?config.endpoint, "S3 client ready");
        Ok(Self::new(client, bucket, Arc::new(runtime)))
    }
}

async fn build_client(config: &S3Config) -> S3Client {
    let builder = match config.static_credentials() {
        Some((access_key_id, secret_access_key)) => {
            let credentials =
                Credentials::new(access_key_id, secret_access_key, None, None, "volstore");
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(credentials)
        }
        None => {
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        }
    };

    let mut builder = builder.region(Region::new(config.region.clone()));
    if let Some(endpoint) = &config.endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    S3Client::from_conf(builder.build())
}

impl VolumeConnector for S3Connector {
    /// Volumes are key prefixes; connecting writes the root marker if it is
    /// missing.
    fn connect(&self, volume_name: &str) -> StorageResult<Arc<dyn RemoteVolume>> {
        if volume_name.is_empty() || volume_name.contains('/') {
            return Err(StorageError::configuration(format!(
                "invalid volume name {:?}",
                volume_name
            )));
        }
        let volume = S3Volume::new(
            self.client.clone(),
            self.bucket.clone(),
            volume_name.to_string(),
            self.runtime.clone(),
        );
        volume
            .runtime
            .block_on(volume.ensure_marker(&dir_key(volume_name, "")))?;
        Ok(Arc::new(volume))
    }
}

/// Key of a file at volume-relative `path`.
fn object_key(volume: &str, path: &str) -> String {
    let rel = path.trim_matches('/');
    if rel.is_empty() {
        format!("{}/", volume)
    } else {
        format!("{}/{}", volume, rel)
    }
}

/// Key of the marker for the directory at `path` (also its listing prefix).
fn dir_key(volume: &str, path: &str) -> String {
    let rel = path.trim_matches('/');
    if rel.is_empty() {
        format!("{}/", volume)
    } else {
        format!("{}/{}/", volume, rel)
    }
}

/// Volume-relative path of a bucket key, without a trailing `/`.
fn relative_path<'a>(volume: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(volume)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| rest.trim_end_matches('/'))
}

fn secs(time: Option<&DateTime>) -> f64 {
    time.map(DateTime::as_secs_f64).unwrap_or(0.0)
}

/// Check if an S3 error is a 412 Precondition Failed.
fn is_precondition_failed(err: &SdkError<impl std::fmt::Debug>) -> bool {
    match err {
        SdkError::ServiceError(e) => e.raw().status().as_u16() == 412,
        SdkError::ResponseError(e) => e.raw().status().as_u16() == 412,
        _ => false,
    }
}

fn remote_error<E>(op: &'static str, key: &str, err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::remote(op, key, DisplayErrorContext(err).to_string())
}

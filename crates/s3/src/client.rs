use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use finch_transfer::{Aborted, ByteCallback, StorageClient, StorageError, StorageFuture};

use crate::S3Settings;

/// Size of a single read from an upload source.
const READ_CHUNK: usize = 64 * 1024;

/// Object storage over the S3 API.
///
/// Uploads that fit in one part go out as a single `PutObject`; larger
/// sources use a sequential multipart upload, which is aborted on error.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    part_size: usize,
}

impl S3Storage {
    /// Builds a client from `settings`, filling gaps from the AWS environment.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some((id, secret)) = settings.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(id, secret, None, None, "finch"));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }

        debug!(
            region = ?settings.region,
            endpoint = ?settings.endpoint_url,
            path_style = settings.force_path_style,
            "s3 client configured"
        );
        Self::from_client(Client::from_conf(builder.build()), settings.effective_part_size())
    }

    pub fn from_client(client: Client, part_size: usize) -> Self {
        Self {
            client,
            part_size: part_size.max(crate::MIN_PART_SIZE),
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    async fn multipart(
        &self,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        bucket: &str,
        key: &str,
        on_bytes: ByteCallback<'_>,
    ) -> Result<(), StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| remote("create multipart upload", e))?;
        let upload_id = created
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| StorageError::Remote("missing multipart upload id".into()))?;

        let result: Result<(), StorageError> = async {
            let mut parts = Vec::new();
            let mut buffer = first;
            let mut part_number = 1;
            while !buffer.is_empty() {
                let output = self
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(buffer))
                    .send()
                    .await
                    .map_err(|e| remote("upload part", e))?;
                parts.push(
                    CompletedPart::builder()
                        .set_e_tag(output.e_tag().map(str::to_owned))
                        .part_number(part_number)
                        .build(),
                );
                debug!(key, part = part_number, "uploaded part");

                part_number += 1;
                buffer = fill_part(&mut *reader, self.part_size, &mut *on_bytes).await?;
            }

            self.client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| remote("complete multipart upload", e))?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let aborted = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(e) = aborted {
                warn!(key, upload_id = %upload_id, error = %DisplayErrorContext(&e), "failed to abort multipart upload");
            }
        }
        result
    }
}

impl StorageClient for S3Storage {
    fn head_object_size<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, u64> {
        Box::pin(async move {
            let head = self
                .client
                .head_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    let e = e.into_service_error();
                    if e.is_not_found() {
                        StorageError::NotFound(format!("{bucket}/{key}"))
                    } else {
                        remote("head object", e)
                    }
                })?;

            head.content_length()
                .and_then(|len| u64::try_from(len).ok())
                .ok_or_else(|| StorageError::Remote(format!("no content length for {bucket}/{key}")))
        })
    }

    fn stream_download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        writer: &'a mut (dyn AsyncWrite + Unpin + Send),
        on_bytes: ByteCallback<'a>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let output = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    let e = e.into_service_error();
                    if e.is_no_such_key() {
                        StorageError::NotFound(format!("{bucket}/{key}"))
                    } else {
                        remote("get object", e)
                    }
                })?;

            let mut body = output.body;
            while let Some(bytes) = body
                .try_next()
                .await
                .map_err(|e| StorageError::Remote(format!("download stream failed: {e}")))?
            {
                writer.write_all(&bytes).await?;
                on_bytes(bytes.len() as u64)?;
            }
            writer.flush().await?;
            Ok(())
        })
    }

    fn stream_upload<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        bucket: &'a str,
        key: &'a str,
        on_bytes: ByteCallback<'a>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let first = fill_part(&mut *reader, self.part_size, &mut *on_bytes).await?;
            if first.len() < self.part_size {
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(first))
                    .send()
                    .await
                    .map_err(|e| remote("put object", e))?;
                return Ok(());
            }
            self.multipart(first, reader, bucket, key, on_bytes).await
        })
    }
}

/// Reads up to `part_size` bytes, reporting every read to `on_bytes`.
///
/// A short result means the source is exhausted.
async fn fill_part<R, F>(reader: &mut R, part_size: usize, on_bytes: &mut F) -> Result<Vec<u8>, StorageError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    F: FnMut(u64) -> Result<(), Aborted> + Send + ?Sized,
{
    let mut buffer = vec![0u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let end = (filled + READ_CHUNK).min(part_size);
        let n = reader.read(&mut buffer[filled..end]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        on_bytes(n as u64)?;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

fn remote<E>(op: &str, err: E) -> StorageError
where
    E: std::error::Error + 'static,
{
    StorageError::Remote(format!("{op} failed: {}", DisplayErrorContext(&err)))
}

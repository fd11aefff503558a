// S3 driver for the CSV artifacts.
//
// Parts are tracked server-side by `(upload_id, part_number)`; completion
// lists the uploaded parts rather than threading ETags through the queue,
// so any worker can close the upload once the last part is acknowledged.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::config::S3Config;
use crate::error::{DispatchError, Result};
use crate::storage::ObjectStorage;

pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
}

impl S3ObjectStorage {
    pub fn new(client: Client, config: &S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

fn storage_err<E: std::fmt::Display>(operation: &str, err: E) -> DispatchError {
    DispatchError::ObjectStorage(format!("{}: {}", operation, err))
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| storage_err("put_object", e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("get_object", e))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| storage_err("get_object body", e))?;
        Ok(data.into_bytes())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_err("create_multipart_upload", e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| DispatchError::ObjectStorage("upload id missing".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<()> {
        self.client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| storage_err("upload_part", e))?;
        Ok(())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let listed = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| storage_err("list_parts", e))?;

        let mut parts: Vec<CompletedPart> = listed
            .parts()
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .set_part_number(part.part_number())
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .build()
            })
            .collect();
        parts.sort_by_key(CompletedPart::part_number);

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_err("complete_multipart_upload", e))?;
        Ok(())
    }
}

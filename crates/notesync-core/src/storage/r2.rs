//! Cloudflare R2 attachment blob store.

use std::env;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;

use crate::ports::RemoteBlobStore;
use crate::{Error, Result};

use super::keys::normalize_object_key;

const ENV_ACCOUNT_ID: &str = "R2_ACCOUNT_ID";
const ENV_BUCKET: &str = "R2_BUCKET";
const ENV_ACCESS_KEY_ID: &str = "R2_ACCESS_KEY_ID";
const ENV_SECRET_ACCESS_KEY: &str = "R2_SECRET_ACCESS_KEY";

/// Cloudflare R2 configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct R2Config {
    /// Cloudflare account identifier.
    pub account_id: String,
    /// R2 bucket name.
    pub bucket: String,
    /// Access key id for S3-compatible auth.
    pub access_key_id: String,
    /// Secret access key for S3-compatible auth.
    pub secret_access_key: String,
}

impl R2Config {
    /// Load R2 configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no R2 variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    /// Cloudflare R2 S3-compatible endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }
}

/// R2-backed [`RemoteBlobStore`].
#[derive(Clone, Debug)]
pub struct R2Storage {
    config: R2Config,
    client: Client,
}

impl R2Storage {
    #[must_use]
    pub fn new(config: R2Config) -> Self {
        let client = build_s3_client(&config);
        Self { config, client }
    }

    #[must_use]
    pub const fn config(&self) -> &R2Config {
        &self.config
    }

    /// Check that the configured bucket is reachable with current credentials.
    pub async fn bucket_is_reachable(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|error| sdk_error("head_bucket", &self.config.bucket, None, &error))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteBlobStore for R2Storage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let object_key = normalize_object_key(key)?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|error| {
                sdk_error("put_object", &self.config.bucket, Some(&object_key), &error)
            })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let object_key = normalize_object_key(key)?;

        let response = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key) =>
            {
                return Err(Error::ObjectNotFound(object_key));
            }
            Err(error) => {
                return Err(sdk_error(
                    "get_object",
                    &self.config.bucket,
                    Some(&object_key),
                    &error,
                ));
            }
        };

        let payload = response.body.collect().await.map_err(|error| {
            Error::Network(format!(
                "R2 get_object_body failed for {}/{object_key}: {error}",
                self.config.bucket
            ))
        })?;

        Ok(payload.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let object_key = normalize_object_key(key)?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|error| {
                sdk_error(
                    "delete_object",
                    &self.config.bucket,
                    Some(&object_key),
                    &error,
                )
            })?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let object_key = normalize_object_key(key)?;

        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found) =>
            {
                Ok(false)
            }
            Err(error) => Err(sdk_error(
                "head_object",
                &self.config.bucket,
                Some(&object_key),
                &error,
            )),
        }
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<R2Config>> {
    let read = |key: &str| lookup(key).map(|value| value.trim().to_string());
    let values = [
        (ENV_ACCOUNT_ID, read(ENV_ACCOUNT_ID)),
        (ENV_BUCKET, read(ENV_BUCKET)),
        (ENV_ACCESS_KEY_ID, read(ENV_ACCESS_KEY_ID)),
        (ENV_SECRET_ACCESS_KEY, read(ENV_SECRET_ACCESS_KEY)),
    ];

    if values.iter().all(|(_, value)| value.is_none()) {
        return Ok(None);
    }

    let missing = values
        .iter()
        .filter(|(_, value)| value.as_ref().map_or(true, String::is_empty))
        .map(|(key, _)| *key)
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(Error::InvalidInput(format!(
            "R2 configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    }

    let [account_id, bucket, access_key_id, secret_access_key] =
        values.map(|(_, value)| value.unwrap_or_default());

    Ok(Some(R2Config {
        account_id,
        bucket,
        access_key_id,
        secret_access_key,
    }))
}

fn build_s3_client(config: &R2Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "notesync-r2-storage",
    );

    let sdk_config = aws_sdk_s3::config::Builder::new()
        .region(Region::new("auto"))
        .credentials_provider(credentials)
        .endpoint_url(config.endpoint_url())
        .force_path_style(true)
        .build();

    Client::from_conf(sdk_config)
}

/// Map an SDK failure: transport problems are network errors, everything
/// else is a storage error. Both are retried as temporary failures.
fn sdk_error<E, R>(
    operation: &str,
    bucket: &str,
    object_key: Option<&str>,
    error: &SdkError<E, R>,
) -> Error
where
    SdkError<E, R>: std::fmt::Display,
{
    let target = object_key.map_or_else(|| bucket.to_string(), |key| format!("{bucket}/{key}"));
    let message = format!("R2 {operation} failed for {target}: {error}");
    match error {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => Error::Network(message),
        _ => Error::Storage(message),
    }
}

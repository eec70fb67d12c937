use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use onesnap_core::remote::{BackendType, RemoteStore};
use onesnap_core::{Error, Result};
use tracing::{debug, info};

pub const DEFAULT_REGION: &str = "us-east-1";

/// Connection parameters for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
}

/// A bucket reached through the S3 API with path-style addressing.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::InvalidInput("bucket name must not be empty".to_string()));
        }

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "onesnap-env",
        );

        let s3_config = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseClass {
    Transport,
    NotFound,
    Backend,
}

/// Throttling and 5xx responses are transient. Only a missing key is
/// `NotFound`; any other 404, such as a missing bucket, is a hard failure.
fn classify_response(status: Option<u16>, code: Option<&str>) -> ResponseClass {
    match (status, code) {
        (Some(status), _) if status >= 500 || status == 429 => ResponseClass::Transport,
        (_, Some("NoSuchKey")) => ResponseClass::NotFound,
        _ => ResponseClass::Backend,
    }
}

/// Maps SDK failures onto the engine's error kinds. Timeouts, dispatch
/// failures and unparseable responses are transient.
fn classify<E>(operation: &str, key: &str, error: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{} {}: {}", operation, key, DisplayErrorContext(&error));
    if matches!(
        error,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    ) {
        return Error::Transport(message);
    }

    let status = error.raw_response().map(|r| r.status().as_u16());
    match classify_response(status, error.code()) {
        ResponseClass::Transport => Error::Transport(message),
        ResponseClass::NotFound => Error::not_found(key),
        ResponseClass::Backend => Error::Backend(message),
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    /// Creates the bucket if it does not exist yet.
    async fn init(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket is accessible");
                Ok(())
            }
            Err(SdkError::ServiceError(_)) => {
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| classify("create bucket", &self.bucket, e))?;
                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e) => Err(classify("head bucket", &self.bucket, e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify("put", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                return Err(Error::not_found(key));
            }
            Err(e) => return Err(classify("get", key, e)),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("get {}: reading body failed: {}", key, e)))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete", key, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| classify("list", prefix, e))?;

            results.extend(response.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(results)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bucket: &str) -> S3Config {
        S3Config {
            endpoint: "http://127.0.0.1:9000".to_string(),
            access_key: "access".to_string(),
            secret_key: "secret".to_string(),
            region: DEFAULT_REGION.to_string(),
            bucket: bucket.to_string(),
        }
    }

    #[test]
    fn only_a_missing_key_is_not_found() {
        assert_eq!(classify_response(Some(404), Some("NoSuchKey")), ResponseClass::NotFound);
        assert_eq!(classify_response(Some(404), Some("NoSuchBucket")), ResponseClass::Backend);
        assert_eq!(classify_response(Some(404), None), ResponseClass::Backend);
        assert_eq!(classify_response(Some(403), Some("AccessDenied")), ResponseClass::Backend);
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert_eq!(classify_response(Some(503), Some("SlowDown")), ResponseClass::Transport);
        assert_eq!(classify_response(Some(500), None), ResponseClass::Transport);
        assert_eq!(classify_response(Some(429), None), ResponseClass::Transport);
    }

    #[test]
    fn empty_bucket_name_is_rejected() {
        assert!(matches!(S3Store::new(config("")), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn store_is_built_without_network() {
        let store = S3Store::new(config("backups")).unwrap();
        assert_eq!(store.bucket(), "backups");
        assert_eq!(store.backend_type(), BackendType::S3);
    }
}

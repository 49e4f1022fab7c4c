use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use aws_config::{AppName, BehaviorVersion, meta::region::RegionProviderChain};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    config::{Builder, Region},
};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::{
    config::{S3Credentials, S3Options},
    format::FileMetadata,
};

use super::{
    Destination, FileInfo, FileProvider, S3_SCHEME, StorageErrorKind,
    StorageResult, normalize_etag, parse_bucket_key,
};

const PRECONDITION_FAILED: u16 = 412;

/// Objects in S3 (or an S3 compatible service) through the native AWS SDK.
///
/// The digest of an object is its ETag; no object bytes are read to describe it. The SDK
/// client is built on first use and shared by every later call.
pub struct S3Provider {
    options: Option<S3Options>,
    credentials: S3Credentials,
    client: OnceCell<Arc<Client>>,
}

pub async fn mk_client(options: Option<&S3Options>, credentials: &S3Credentials) -> Client {
    let region = options
        .and_then(|o| o.region.as_ref())
        .map(|r| RegionProviderChain::first_try(Some(Region::new(r.clone()))))
        .unwrap_or_else(RegionProviderChain::default_provider);

    let mut aws_config = aws_config::defaults(BehaviorVersion::v2024_03_28()).region(region);
    if let Ok(app_name) = AppName::new("kiroframe") {
        aws_config = aws_config.app_name(app_name);
    }

    if let Some(endpoint) = options.and_then(|o| o.endpoint_url.clone()) {
        aws_config = aws_config.endpoint_url(endpoint)
    }

    let anonymous = options.map(|o| o.anonymous).unwrap_or(false);
    match credentials {
        _ if anonymous => aws_config = aws_config.no_credentials(),
        S3Credentials::FromEnv => {}
        S3Credentials::Anonymous => aws_config = aws_config.no_credentials(),
        S3Credentials::Static(credentials) => {
            aws_config = aws_config.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                credentials.session_token.clone(),
                None,
                "kiroframe",
            ))
        }
    }

    let mut s3_builder = Builder::from(&aws_config.load().await);
    if options.map(|o| o.force_path_style || o.allow_http).unwrap_or(false) {
        s3_builder = s3_builder.force_path_style(true);
    }

    Client::from_conf(s3_builder.build())
}

/// ETag as reported by the service, and its comparable form.
struct ObjectVersion {
    raw_etag: String,
    digest: String,
    size: u64,
}

impl S3Provider {
    pub fn new(options: Option<S3Options>, credentials: S3Credentials) -> Self {
        Self { options, credentials, client: OnceCell::new() }
    }

    async fn client(&self) -> &Arc<Client> {
        self.client
            .get_or_init(|| async {
                debug!(options = ?self.options, "creating S3 client");
                Arc::new(mk_client(self.options.as_ref(), &self.credentials).await)
            })
            .await
    }

    async fn head(&self, path: &str) -> StorageResult<ObjectVersion> {
        let (bucket, key) = parse_bucket_key(S3_SCHEME, path)?;
        let res = self.client().await.head_object().bucket(bucket).key(key).send().await;
        match res {
            Ok(res) => {
                let raw_etag = res.e_tag().map(str::to_string).ok_or_else(|| {
                    StorageErrorKind::Other(format!("object `{path}` has no ETag"))
                })?;
                let size = res.content_length().unwrap_or(0).max(0) as u64;
                Ok(ObjectVersion { digest: normalize_etag(&raw_etag), raw_etag, size })
            }
            Err(err)
                if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) =>
            {
                Err(StorageErrorKind::NotFound(path.to_string()).into())
            }
            Err(err) => Err(Box::new(err).into()),
        }
    }
}

impl fmt::Debug for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Provider")
            .field("options", &self.options)
            .field("client_ready", &self.client.initialized())
            .finish()
    }
}

impl fmt::Display for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.options {
            Some(options) => write!(f, "S3Provider(options={options})"),
            None => write!(f, "S3Provider(options=default)"),
        }
    }
}

#[async_trait]
impl FileProvider for S3Provider {
    fn scheme(&self) -> &str {
        S3_SCHEME
    }

    #[instrument(skip(self))]
    async fn get_file_info(&self, path: &str) -> StorageResult<FileInfo> {
        let version = self.head(path).await?;
        Ok(FileInfo { digest: version.digest, size: version.size, metadata: FileMetadata::empty() })
    }

    #[instrument(skip(self))]
    async fn download(
        &self,
        path: &str,
        expected_digest: &str,
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<()> {
        let version = self.head(path).await?;
        if version.digest != normalize_etag(expected_digest) {
            return Err(StorageErrorKind::Integrity {
                path: path.to_string(),
                expected: expected_digest.to_string(),
                actual: version.digest,
            }
            .into());
        }

        let (bucket, key) = parse_bucket_key(S3_SCHEME, path)?;
        let res = self
            .client()
            .await
            .get_object()
            .bucket(bucket)
            .key(key)
            .if_match(version.raw_etag.as_str())
            .send()
            .await;
        let object = match res {
            Ok(object) => object,
            Err(err)
                if err.raw_response().map(|r| r.status().as_u16())
                    == Some(PRECONDITION_FAILED) =>
            {
                // changed between the HEAD and the GET
                return Err(StorageErrorKind::Integrity {
                    path: path.to_string(),
                    expected: expected_digest.to_string(),
                    actual: "<changed during transfer>".to_string(),
                }
                .into());
            }
            Err(err)
                if err.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) =>
            {
                return Err(StorageErrorKind::NotFound(path.to_string()).into());
            }
            Err(err) => return Err(Box::new(err).into()),
        };

        let destination = Destination::prepare(destination_dir, file_name).await?;
        let mut body = object.body.into_async_read();
        destination.write_from(path, &mut body).await
    }
}

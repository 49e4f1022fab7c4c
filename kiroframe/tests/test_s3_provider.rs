//! Needs a local minio on port 9000 with a `testbucket` bucket.

use kiroframe::{
    Dataset, DatasetConfig, DatasetErrorKind, InMemoryBackend, StorageErrorKind,
    config::{S3Credentials, S3Options, S3StaticCredentials},
    storage::{FileProvider, S3Provider, s3::mk_client},
};
use pretty_assertions::assert_eq;

fn minio_options() -> S3Options {
    S3Options {
        region: Some("us-east-1".to_string()),
        endpoint_url: Some("http://localhost:9000".to_string()),
        anonymous: false,
        allow_http: true,
        force_path_style: true,
    }
}

fn minio_credentials() -> S3Credentials {
    S3Credentials::Static(S3StaticCredentials {
        access_key_id: "minio123".into(),
        secret_access_key: "minio123".into(),
        session_token: None,
    })
}

async fn put(key: &str, body: &'static [u8]) -> Result<(), Box<dyn std::error::Error>> {
    let client = mk_client(Some(&minio_options()), &minio_credentials()).await;
    client
        .put_object()
        .bucket("testbucket")
        .key(key)
        .body(body.to_vec().into())
        .send()
        .await?;
    Ok(())
}

fn unique_key(name: &str) -> String {
    format!("test_s3_provider__{}/{name}", rand::random::<u64>())
}

#[kiroframe_macros::tokio_test]
#[ignore = "needs minio"]
async fn test_s3_file_info() -> Result<(), Box<dyn std::error::Error>> {
    let key = unique_key("x.csv");
    put(&key, b"a,b\n1,2\n").await?;

    let provider = S3Provider::new(Some(minio_options()), minio_credentials());
    let info = provider.get_file_info(&format!("s3://testbucket/{key}")).await?;
    assert_eq!(info.size, 8);
    assert!(!info.digest.starts_with('"'));

    let missing = provider.get_file_info("s3://testbucket/definitely/missing").await;
    assert!(matches!(missing, Err(e) if matches!(e.kind, StorageErrorKind::NotFound(_))));
    Ok(())
}

#[kiroframe_macros::tokio_test]
#[ignore = "needs minio"]
async fn test_s3_dataset_download() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let key = unique_key("x.csv");
    put(&key, b"a\n1\n").await?;

    let config = DatasetConfig {
        s3: Some(minio_options()),
        s3_credentials: minio_credentials(),
        ..DatasetConfig::default().with_download_root(dir.path())
    };
    let dataset = Dataset::new("s3data", config);
    let path = format!("s3://testbucket/{key}");
    dataset.add_file(&path)?;
    dataset.log(&InMemoryBackend::new()).await?;

    let downloaded = dataset.download(true).await?;
    assert_eq!(std::fs::read(&downloaded[&path])?, b"a\n1\n");

    put(&key, b"a\n2\n").await?;
    let err = dataset.download(true).await.unwrap_err();
    assert!(matches!(err.kind, DatasetErrorKind::Storage(StorageErrorKind::Integrity { .. })));
    assert_eq!(std::fs::read(&downloaded[&path])?, b"a\n1\n");
    Ok(())
}

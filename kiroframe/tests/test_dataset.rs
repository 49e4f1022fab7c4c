use std::{path::Path, sync::Arc};

use kiroframe::{
    Dataset, DatasetConfig, DatasetErrorKind, FileEntry, InMemoryBackend, ProviderRegistry,
    StorageErrorKind, VersionSelector,
    storage::{LocalFileProvider, ObjectStoreProvider},
};
use object_store::{ObjectStore, PutPayload, path::Path as ObjectPath};
use pretty_assertions::assert_eq;

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn config(root: &Path) -> DatasetConfig {
    DatasetConfig::default().with_download_root(root.join("kiroframe").join("datasets"))
}

#[kiroframe_macros::tokio_test]
async fn test_add_log_download() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("x.csv");
    let content = b"a,b\n1,2\n";
    std::fs::write(&source, content)?;
    let path = file_url(&source);

    let dataset = Dataset::new("d1", config(dir.path()));
    dataset.add_file(&path)?;
    dataset.wait_ready().await?;

    let Some(FileEntry::Ready(record)) = dataset.file(&path) else {
        panic!("file should be ready");
    };
    assert_eq!(record.size, content.len() as u64);
    assert_eq!(record.digest, format!("{:x}", md5::compute(content)));

    let backend = InMemoryBackend::new();
    assert_eq!(dataset.log(&backend).await?, 1);
    assert_eq!(dataset.dataset_name()?, "d1:V1");

    let downloaded = dataset.download(true).await?;
    let expected = dir.path().join("kiroframe/datasets/d1:V1/x.csv");
    assert_eq!(downloaded.get(&path), Some(&expected));
    assert_eq!(std::fs::read(&expected)?, content);

    let table = dataset.dataframe(&path).await?;
    assert_eq!(table.shape(), (1, 2));
    Ok(())
}

#[kiroframe_macros::tokio_test]
async fn test_versions_follow_changes() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let a = dir.path().join("a.csv");
    let b = dir.path().join("b.parquet");
    std::fs::write(&a, "x\n1\n")?;
    std::fs::write(&b, "not really parquet")?;

    let backend = InMemoryBackend::new();
    let dataset = Dataset::new("d1", config(dir.path()));
    dataset.add_file(&file_url(&a))?;
    dataset.add_file(&file_url(&b))?;
    assert_eq!(dataset.log(&backend).await?, 1);

    // sniffing failed but the file is still part of the dataset
    let Some(FileEntry::Ready(record)) = dataset.file(&file_url(&b)) else {
        panic!("file should be ready");
    };
    assert!(record.metadata.is_empty());

    dataset.remove_file(&file_url(&b));
    assert_eq!(dataset.version(), None);
    assert_eq!(dataset.log(&backend).await?, 2);

    let first = Dataset::fetch(
        &backend,
        "d1",
        &VersionSelector::Version(1),
        Arc::new(ProviderRegistry::with_defaults(dataset.config())),
        Arc::new(dataset.config().clone()),
    )
    .await?;
    assert_eq!(first.files().len(), 2);
    assert_eq!(
        first.file(&file_url(&a)).and_then(|e| e.record().cloned()).and_then(|r| r.remote_id),
        dataset.file(&file_url(&a)).and_then(|e| e.record().cloned()).and_then(|r| r.remote_id),
    );
    Ok(())
}

#[kiroframe_macros::tokio_test]
async fn test_object_store_integrity() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let objects = Arc::new(ObjectStoreProvider::new_in_memory());
    let store = Arc::clone(objects.store());
    let location = ObjectPath::from("bucket/data/x.csv");
    store.put(&location, PutPayload::from(b"a\n1\n".to_vec())).await?;

    let providers = Arc::new(
        ProviderRegistry::new()
            .with_provider(Arc::new(LocalFileProvider::default()))
            .with_provider(objects),
    );
    let dataset =
        Dataset::with_registry("remote", providers, Arc::new(config(dir.path())));
    let path = "s3://bucket/data/x.csv";
    dataset.add_file(path)?;
    dataset.log(&InMemoryBackend::new()).await?;

    let downloaded = dataset.download(true).await?;
    let target = downloaded[path].clone();
    assert_eq!(std::fs::read(&target)?, b"a\n1\n");

    store.put(&location, PutPayload::from(b"a\n2\n".to_vec())).await?;
    let err = dataset.download(true).await.unwrap_err();
    assert!(matches!(err.kind, DatasetErrorKind::Storage(StorageErrorKind::Integrity { .. })));
    assert_eq!(std::fs::read(&target)?, b"a\n1\n");
    let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<Result<_, _>>()?;
    assert_eq!(leftovers, vec![std::ffi::OsString::from("x.csv")]);

    // already present, not fetched again
    let again = dataset.download(false).await?;
    assert_eq!(again[path], target);
    Ok(())
}

#[kiroframe_macros::tokio_test]
async fn test_unknown_scheme() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let registry = ProviderRegistry::with_defaults(&DatasetConfig::default());
    for path in ["gs://bucket/x.csv", "/no/scheme.csv", "://x", "http://host/x.csv"] {
        let res = registry.get_file_info(path).await;
        assert!(matches!(res, Err(e) if matches!(e.kind, StorageErrorKind::UnsupportedPath(_))));
        let res = registry.download(path, "abc", dir.path(), "x.csv").await;
        assert!(matches!(res, Err(e) if matches!(e.kind, StorageErrorKind::UnsupportedPath(_))));
    }
    assert!(std::fs::read_dir(dir.path())?.next().is_none());
    Ok(())
}

#[kiroframe_macros::tokio_test]
async fn test_lifecycle_guards() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let dataset = Dataset::new("d1", config(dir.path()));

    let err = dataset.download(true).await.unwrap_err();
    assert!(err.is_state_error());
    assert!(matches!(err.kind, DatasetErrorKind::DatasetNotLogged(_)));

    dataset.log(&InMemoryBackend::new()).await?;
    let err = dataset.dataframe("file:///missing.csv").await.unwrap_err();
    assert!(matches!(err.kind, DatasetErrorKind::NotAMember(_)));
    assert!(dataset.download(true).await?.is_empty());
    Ok(())
}

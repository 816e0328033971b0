use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "local";

/// Storage driver writing objects below a root directory.
///
/// Objects live at `<root>/<bucket>/<key>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
    #[cfg(feature = "tmp")]
    _scratch: Option<tempfile::TempDir>,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            #[cfg(feature = "tmp")]
            _scratch: None,
        }
    }

    /// Create a driver rooted in a fresh temporary directory.
    ///
    /// The directory is removed when the driver is dropped.
    #[cfg(feature = "tmp")]
    pub fn temporary() -> std::io::Result<Self> {
        let scratch = tempfile::TempDir::new()?;
        let root = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "temp dir is not utf-8")
            })?
            .to_owned();
        tracing::debug!(%root, "Storing objects in a temporary directory");
        Ok(Self {
            root,
            _scratch: Some(scratch),
        })
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if remote.is_absolute() || remote.as_str().split('/').any(|part| part == "..") {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("invalid object key: {remote}"),
            )
            .bucket(bucket)
            .build());
        }
        Ok(self.root.join(bucket).join(remote))
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| StorageError::io(ENGINE, err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(ENGINE, err)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(ENGINE, err))?;
        }

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(|err| StorageError::io(ENGINE, err))?,
        );

        tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| StorageError::io(ENGINE, err))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.root.join(bucket);
        let prefix = prefix.map(Utf8Path::to_owned);

        let items = tokio::task::spawn_blocking(move || collect_list(&root, prefix.as_deref()))
            .in_current_span()
            .await
            .map_err(|err| StorageError::new(ENGINE, StorageErrorKind::Other, err))?
            .map_err(|err| StorageError::io(ENGINE, err))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

fn collect_list(root: &Utf8Path, prefix: Option<&Utf8Path>) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    if root.is_dir() {
        visit(root, &mut files)?;
    }

    let mut keys: Vec<String> = files
        .into_iter()
        .filter_map(|path| path.strip_prefix(root).ok().map(|key| key.to_owned()))
        .filter(|key| prefix.is_none_or(|prefix| key.starts_with(prefix)))
        .map(|key| key.to_string())
        .collect();
    keys.sort();
    Ok(keys)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn upload_download_list() {
        let (_dir, driver) = driver();

        let mut data: &[u8] = b"manifest";
        driver
            .upload("registry", Utf8Path::new("manifests/sha256/aa"), &mut data)
            .await
            .unwrap();

        let meta = driver
            .metadata("registry", Utf8Path::new("manifests/sha256/aa"))
            .await
            .unwrap();
        assert_eq!(meta.size, 8);

        let mut out = Vec::new();
        driver
            .download("registry", Utf8Path::new("manifests/sha256/aa"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"manifest");

        let keys = driver
            .list("registry", Some(Utf8Path::new("manifests")))
            .await
            .unwrap();
        assert_eq!(keys, vec!["manifests/sha256/aa".to_owned()]);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata("registry", Utf8Path::new("blobs/none"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        driver
            .delete("registry", Utf8Path::new("blobs/none"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata("registry", Utf8Path::new("../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[cfg(feature = "tmp")]
    #[tokio::test]
    async fn temporary_root_is_removed_on_drop() {
        let driver = LocalDriver::temporary().unwrap();
        let root = driver.root.clone();

        let mut data: &[u8] = b"layer";
        driver
            .upload("registry", Utf8Path::new("blobs/one"), &mut data)
            .await
            .unwrap();
        assert!(root.join("registry/blobs/one").is_file());

        drop(driver);
        assert!(!root.exists());
    }
}

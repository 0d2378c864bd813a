use std::{
    cell::RefCell,
    collections::BTreeMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use async_trait::async_trait;

use super::KeyValueStore;
use crate::StorageError;

/// Storage backed by a single JSON document on disk.
///
/// The document is loaded on first access and rewritten atomically (write to a
/// sibling temp file, then rename) after every mutation.
#[derive(Clone)]
pub struct FileStorage {
    path: Rc<PathBuf>,
    values: Rc<RefCell<Option<BTreeMap<String, String>>>>,
    write_lock: Rc<tokio::sync::Mutex<()>>,
}

impl FileStorage {
    /// Storage persisted at `path`. The file is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Rc::new(path.as_ref().to_path_buf()),
            values: Rc::new(RefCell::new(None)),
            write_lock: Rc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<(), StorageError> {
        if self.values.borrow().is_some() {
            return Ok(());
        }

        let values = match tokio::fs::read_to_string(self.path.as_path()).await {
            Ok(raw) => miniserde::json::from_str::<BTreeMap<String, String>>(&raw).map_err(|_| {
                StorageError::Corrupt {
                    key: self.path.display().to_string(),
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StorageError::io(&self.path.display().to_string(), err)),
        };

        // Another task may have loaded while we were reading.
        let mut slot = self.values.borrow_mut();
        if slot.is_none() {
            *slot = Some(values);
        }
        Ok(())
    }

    async fn mutate(
        &self,
        key: &str,
        update: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StorageError> {
        self.load().await?;
        let _write = self.write_lock.lock().await;

        let document = {
            let mut values = self.values.borrow_mut();
            let values = values.get_or_insert_with(BTreeMap::new);
            update(values);
            miniserde::json::to_string(&*values)
        };

        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| StorageError::io(key, err))?;
            }
        }
        tokio::fs::write(&tmp, document)
            .await
            .map_err(|err| StorageError::io(key, err))?;
        tokio::fs::rename(&tmp, self.path.as_path())
            .await
            .map_err(|err| StorageError::io(key, err))
    }
}

#[async_trait(?Send)]
impl KeyValueStore for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.load().await?;
        Ok(self
            .values
            .borrow()
            .as_ref()
            .and_then(|values| values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.mutate(key, |values| {
            values.insert(key.to_string(), value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.mutate(key, |values| {
            values.remove(key);
        })
        .await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        self.mutate(keys.first().copied().unwrap_or("*"), |values| {
            for key in keys {
                values.remove(*key);
            }
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.mutate("*", BTreeMap::clear).await
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("storage.json");

        let storage = FileStorage::new(&path);
        assert_eq!(None, storage.get(keys::TOKEN).await.unwrap());
        storage.set(keys::TOKEN, "abc".into()).await.unwrap();
        storage.set(keys::USER_ID, "42".into()).await.unwrap();
        storage.remove(keys::USER_ID).await.unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(
            Some("abc".to_string()),
            reopened.get(keys::TOKEN).await.unwrap()
        );
        assert_eq!(None, reopened.get(keys::USER_ID).await.unwrap());
    }

    #[tokio::test]
    async fn clear_and_remove_many() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let storage = FileStorage::new(&path);

        for key in [keys::TOKEN, keys::USER_DATA, keys::USER_ID, keys::THEME_MODE] {
            storage.set(key, "v".into()).await.unwrap();
        }
        storage
            .remove_many(&[keys::TOKEN, keys::USER_DATA, keys::USER_ID])
            .await
            .unwrap();
        assert_eq!(
            Some("v".to_string()),
            FileStorage::new(&path).get(keys::THEME_MODE).await.unwrap()
        );

        storage.clear().await.unwrap();
        assert_eq!(None, FileStorage::new(&path).get(keys::THEME_MODE).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let storage = FileStorage::new(&path);
        assert!(matches!(
            storage.get(keys::TOKEN).await,
            Err(StorageError::Corrupt { .. })
        ));
    }
}

use async_trait::async_trait;

use crate::StorageError;

/// Asynchronous durable key-value storage shared by every persisted store.
///
/// Values are raw strings; JSON encoding is layered on top with
/// [`get_json`] and [`set_json`].
#[async_trait(?Send)]
pub trait KeyValueStore {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    /// Remove a value. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// Remove several values.
    async fn remove_many(&self, keys: &[&str]) -> Result<(), StorageError> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
    /// Remove every value.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Durable storage keys.
pub mod keys {
    /// Authentication bearer token (raw string).
    pub const TOKEN: &str = "token";
    /// Cached user profile (JSON).
    pub const USER_DATA: &str = "userData";
    /// User identifier (raw string).
    pub const USER_ID: &str = "userId";
    /// Cached promotional content (JSON array).
    pub const STICKY_BANNERS: &str = "stickyBanners";
    /// Phone number awaiting verification (raw string).
    pub const PENDING_MOBILE_NUMBER: &str = "pendingMobileNumber";
    /// Interim token between signup steps (raw string).
    pub const TEMP_TOKEN: &str = "tempToken";
    /// `"true"` once the app has been opened.
    pub const FIRST_TIME_VISITED: &str = "firstTimeVisited";
    /// Locale code (raw string).
    pub const APP_LANGUAGE: &str = "@app_language";
    /// `light`, `dark` or `system`.
    pub const THEME_MODE: &str = "@theme_mode";
    /// App preference snapshot (JSON).
    pub const APP_STORAGE: &str = "app-storage";
    /// UI preference snapshot (JSON).
    pub const UI_STORAGE: &str = "ui-storage";
}

/// Read and decode a JSON value.
pub async fn get_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StorageError>
where
    T: miniserde::Deserialize,
{
    match store.get(key).await? {
        Some(raw) => miniserde::json::from_str(&raw)
            .map(Some)
            .map_err(|_| StorageError::Corrupt {
                key: key.to_string(),
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StorageError>
where
    T: miniserde::Serialize + ?Sized,
{
    store.set(key, miniserde::json::to_string(value)).await
}

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

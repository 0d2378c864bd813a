use std::rc::Rc;

use crate::{
    storage::{get_json, keys, set_json, KeyValueStore},
    AuthStatus, BusyIndicator, DefaultQueryOptions, Error, PreferenceStore, QueryClient,
    ReferenceDataSource, RegistrationDraftCache, SessionOptions, SessionStore,
};

/// Configuration for [`SyncServices::init`].
#[derive(Debug, Clone, Default)]
pub struct ServicesOptions {
    /// Defaults for every query.
    pub query: DefaultQueryOptions,
    /// Session behavior.
    pub session: SessionOptions,
}

impl ServicesOptions {
    /// Set the query defaults.
    pub fn set_query_options(self, query: DefaultQueryOptions) -> Self {
        Self { query, ..self }
    }

    /// Set the session options.
    pub fn set_session_options(self, session: SessionOptions) -> Self {
        Self { session, ..self }
    }
}

/// Every store of the app, built around one durable storage.
///
/// Screens receive clones of the stores they use. Must be created inside a
/// `LocalSet`.
#[derive(Clone)]
pub struct SyncServices {
    storage: Rc<dyn KeyValueStore>,
    busy: BusyIndicator,
    client: QueryClient,
    session: SessionStore,
    registration: RegistrationDraftCache,
    preferences: PreferenceStore,
}

impl SyncServices {
    /// Builds every store, restores preferences and derives the session
    /// status from storage.
    pub async fn init(
        storage: Rc<dyn KeyValueStore>,
        reference_data: Rc<dyn ReferenceDataSource>,
        options: ServicesOptions,
    ) -> Self {
        let busy = BusyIndicator::new();
        let client = QueryClient::new(options.query).with_busy_indicator(busy.clone());
        let session = SessionStore::new(storage.clone(), options.session);
        let registration = RegistrationDraftCache::new(reference_data);
        let preferences = PreferenceStore::new(storage.clone());

        preferences.hydrate().await;
        let status = session.check_auth_status().await;
        log::info!("Services ready, session {status:?}");

        Self {
            storage,
            busy,
            client,
            session,
            registration,
            preferences,
        }
    }

    /// Waits for pending preference writes, then drops cached queries and
    /// registration data and hides the busy indicator.
    pub async fn teardown(&self) {
        self.preferences.flush().await;
        self.client.clear();
        self.registration.clear_data();
        self.busy.force_hide();
        log::info!("Services torn down");
    }

    /// Logs out and drops everything cached for the previous user.
    pub async fn logout(&self) -> AuthStatus {
        self.session.logout().await;
        self.client.clear();
        self.registration.clear_data();
        self.session.status()
    }

    /// Shared storage.
    pub fn storage(&self) -> &Rc<dyn KeyValueStore> {
        &self.storage
    }

    /// Global busy indicator.
    pub fn busy(&self) -> &BusyIndicator {
        &self.busy
    }

    /// Query client.
    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    /// Session store.
    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Registration draft cache.
    pub fn registration(&self) -> &RegistrationDraftCache {
        &self.registration
    }

    /// Preference store.
    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    /// Promotional banners saved by [`save_sticky_banners`](Self::save_sticky_banners).
    /// Empty when absent or unreadable.
    pub async fn sticky_banners<T: miniserde::Deserialize>(&self) -> Vec<T> {
        match get_json(self.storage.as_ref(), keys::STICKY_BANNERS).await {
            Ok(banners) => banners.unwrap_or_default(),
            Err(error) => {
                log::warn!("Ignoring cached banners: {error}");
                Vec::new()
            }
        }
    }

    /// Caches promotional banners for the next start.
    pub async fn save_sticky_banners<T: miniserde::Serialize>(&self, banners: &[T]) -> Result<(), Error> {
        set_json(self.storage.as_ref(), keys::STICKY_BANNERS, banners).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SyncServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServices")
            .field("busy", &self.busy)
            .field("client", &self.client)
            .field("session", &self.session)
            .field("registration", &self.registration)
            .field("preferences", &self.preferences)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        query_key, storage::MemoryStorage, util::test_util::local, Board, City, ClassOption,
        QueryOptions, ThemeMode,
    };

    struct StaticSource;

    #[async_trait(?Send)]
    impl ReferenceDataSource for StaticSource {
        async fn fetch_classes(&self) -> Result<Vec<ClassOption>, Error> {
            Ok(vec![ClassOption {
                id: 12,
                name: "Class 12".into(),
            }])
        }

        async fn fetch_boards(&self) -> Result<Vec<Board>, Error> {
            Ok(vec![Board {
                id: 2,
                name: "ICSE".into(),
            }])
        }

        async fn fetch_cities(&self, state_id: u32) -> Result<Vec<City>, Error> {
            Ok(vec![City {
                id: state_id,
                name: "Pune".into(),
            }])
        }
    }

    async fn init(storage: &MemoryStorage) -> SyncServices {
        SyncServices::init(
            Rc::new(storage.clone()),
            Rc::new(StaticSource),
            ServicesOptions::default().set_session_options(
                SessionOptions::default().set_logout_grace(Duration::from_millis(10)),
            ),
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn init_restores_session_and_preferences() {
        local(async {
            let storage = MemoryStorage::new();
            let services = init(&storage).await;
            assert_eq!(AuthStatus::LoggedOut, services.session().status());

            services
                .session()
                .save_credentials("tok", "{\"name\":\"Asha\"}", "42")
                .await
                .unwrap();
            services.session().login();
            services.preferences().set_theme_mode(ThemeMode::Dark);
            services.teardown().await;

            let restarted = init(&storage).await;
            assert!(restarted.session().is_logged_in());
            assert_eq!(ThemeMode::Dark, restarted.preferences().ui().theme_mode);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_drops_cached_state() {
        local(async {
            let storage = MemoryStorage::new();
            let services = init(&storage).await;

            let courses = services
                .client()
                .fetch_query(
                    query_key!["courses"],
                    |_| async { Ok::<_, Error>(vec![1_u32, 2, 3]) },
                    QueryOptions::default(),
                )
                .await
                .unwrap();
            assert_eq!(3, courses.len());
            services.registration().load_all_data().await.unwrap();
            services.busy().show();

            services.teardown().await;
            assert_eq!(0, services.client().size());
            assert!(!services.registration().is_loaded());
            assert!(!services.busy().is_visible());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_user_data() {
        local(async {
            let storage = MemoryStorage::new();
            let services = init(&storage).await;
            services
                .session()
                .save_credentials("tok", "{}", "7")
                .await
                .unwrap();
            services.session().login();
            services.client().set_query_data(query_key!["profile"], "Asha".to_string());

            assert_eq!(AuthStatus::LoggedOut, services.logout().await);
            assert_eq!(0, services.client().size());
            assert_eq!(None, storage.peek(keys::TOKEN));
        })
        .await;
    }

    #[tokio::test]
    async fn sticky_banners() {
        local(async {
            let storage = MemoryStorage::new();
            let services = init(&storage).await;
            assert!(services.sticky_banners::<String>().await.is_empty());

            let banners = vec!["exam-prep".to_string()];
            services.save_sticky_banners(&banners).await.unwrap();
            assert_eq!(banners, services.sticky_banners::<String>().await);

            storage.set(keys::STICKY_BANNERS, "[".into()).await.unwrap();
            assert!(services.sticky_banners::<String>().await.is_empty());
        })
        .await;
    }
}

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use slotmap::{new_key_type, SlotMap};

use crate::{
    storage::{get_json, keys, KeyValueStore},
    Error,
};

/// Whether the user is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthStatus {
    /// No durable token, or it could not be read.
    #[default]
    LoggedOut,
    /// A durable token is present.
    LoggedIn,
}

/// Session store configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Delay between clearing durable credentials and publishing
    /// [`AuthStatus::LoggedOut`], so reads already in flight settle against
    /// the cleared storage.
    pub logout_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            logout_grace: Duration::from_millis(100),
        }
    }
}

impl SessionOptions {
    /// Set the logout grace delay.
    pub fn set_logout_grace(self, logout_grace: Duration) -> Self {
        SessionOptions { logout_grace }
    }
}

new_key_type! {
    /// Handle returned by [`SessionStore::subscribe`].
    pub struct SessionListenerKey;
}

/// Authentication status derived from the durable token.
///
/// Every transition bumps an epoch. An asynchronous status check publishes
/// its result only if no login or logout happened while it was reading, so
/// a check racing a logout can never put the UI back into the authenticated
/// subtree.
#[derive(Clone)]
pub struct SessionStore {
    inner: Rc<SessionInner>,
}

struct SessionInner {
    storage: Rc<dyn KeyValueStore>,
    options: SessionOptions,
    status: Cell<AuthStatus>,
    epoch: Cell<u64>,
    listeners: RefCell<SlotMap<SessionListenerKey, Rc<dyn Fn(AuthStatus)>>>,
}

// Removed on logout.
const SESSION_KEYS: [&str; 5] = [
    keys::TOKEN,
    keys::USER_DATA,
    keys::USER_ID,
    keys::TEMP_TOKEN,
    keys::PENDING_MOBILE_NUMBER,
];

impl SessionStore {
    /// A logged out store. Call [`check_auth_status`](Self::check_auth_status)
    /// once at start.
    pub fn new(storage: Rc<dyn KeyValueStore>, options: SessionOptions) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                storage,
                options,
                status: Cell::new(AuthStatus::LoggedOut),
                epoch: Cell::new(0),
                listeners: RefCell::new(SlotMap::with_key()),
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> AuthStatus {
        self.inner.status.get()
    }

    /// Shorthand for `status() == LoggedIn`.
    pub fn is_logged_in(&self) -> bool {
        self.status() == AuthStatus::LoggedIn
    }

    /// Derives the status from the durable token. Read failures fail closed.
    ///
    /// Returns the status in effect once the check completes, which is the
    /// current one if a transition happened during the read.
    pub async fn check_auth_status(&self) -> AuthStatus {
        let epoch = self.inner.epoch.get();

        let derived = match self.inner.storage.get(keys::TOKEN).await {
            Ok(Some(token)) if !token.is_empty() => AuthStatus::LoggedIn,
            Ok(_) => AuthStatus::LoggedOut,
            Err(error) => {
                log::warn!("Reading the auth token failed, treating session as logged out: {error}");
                AuthStatus::LoggedOut
            }
        };

        if self.inner.epoch.get() != epoch {
            log::debug!("Session changed during status check, discarding {derived:?}");
            return self.status();
        }
        self.publish(derived);
        derived
    }

    /// Marks the session as logged in. The token must already have been
    /// written, e.g. with [`save_credentials`](Self::save_credentials).
    pub fn login(&self) {
        self.bump_epoch();
        self.publish(AuthStatus::LoggedIn);
    }

    /// Removes credentials and signup artifacts, waits the grace delay, then
    /// publishes [`AuthStatus::LoggedOut`].
    ///
    /// Storage failures are logged. The session is logged out regardless.
    pub async fn logout(&self) {
        let epoch = self.bump_epoch();

        if let Err(error) = self.inner.storage.remove_many(&SESSION_KEYS).await {
            log::error!("Clearing session storage failed: {error}");
        }

        tokio::time::sleep(self.inner.options.logout_grace).await;

        if self.inner.epoch.get() == epoch {
            self.publish(AuthStatus::LoggedOut);
        } else {
            log::debug!("Session changed during logout grace, not publishing LoggedOut");
        }
    }

    /// Persists what a successful verification returns. Clears the signup
    /// artifacts it supersedes.
    pub async fn save_credentials(
        &self,
        token: &str,
        profile_json: &str,
        user_id: &str,
    ) -> Result<(), Error> {
        let storage = &self.inner.storage;
        storage.set(keys::TOKEN, token.to_string()).await?;
        storage.set(keys::USER_DATA, profile_json.to_string()).await?;
        storage.set(keys::USER_ID, user_id.to_string()).await?;
        storage
            .remove_many(&[keys::TEMP_TOKEN, keys::PENDING_MOBILE_NUMBER])
            .await?;
        Ok(())
    }

    /// The durable token, `None` if absent or unreadable.
    pub async fn token(&self) -> Option<String> {
        self.read(keys::TOKEN).await.filter(|token| !token.is_empty())
    }

    /// The durable user id.
    pub async fn user_id(&self) -> Option<String> {
        self.read(keys::USER_ID).await
    }

    /// The cached profile, decoded as `T`. Corrupt profiles read as absent.
    pub async fn cached_profile<T: miniserde::Deserialize>(&self) -> Option<T> {
        match get_json(self.inner.storage.as_ref(), keys::USER_DATA).await {
            Ok(profile) => profile,
            Err(error) => {
                log::warn!("Reading the cached profile failed: {error}");
                None
            }
        }
    }

    /// Remembers the phone number awaiting verification.
    pub async fn set_pending_mobile_number(&self, number: &str) -> Result<(), Error> {
        self.inner
            .storage
            .set(keys::PENDING_MOBILE_NUMBER, number.to_string())
            .await?;
        Ok(())
    }

    /// The phone number awaiting verification.
    pub async fn pending_mobile_number(&self) -> Option<String> {
        self.read(keys::PENDING_MOBILE_NUMBER).await
    }

    /// Stores the interim token issued between signup steps.
    pub async fn set_temp_token(&self, token: &str) -> Result<(), Error> {
        self.inner
            .storage
            .set(keys::TEMP_TOKEN, token.to_string())
            .await?;
        Ok(())
    }

    /// Reads and removes the interim token. A signup step that needs it and
    /// finds none should surface [`Error::Logic`].
    pub async fn take_temp_token(&self) -> Result<String, Error> {
        let token = self
            .inner
            .storage
            .get(keys::TEMP_TOKEN)
            .await?
            .ok_or_else(|| Error::logic("no interim signup token"))?;
        self.inner.storage.remove(keys::TEMP_TOKEN).await?;
        Ok(token)
    }

    /// Whether the app has never been opened before. Unreadable storage
    /// counts as a first visit.
    pub async fn is_first_visit(&self) -> bool {
        self.read(keys::FIRST_TIME_VISITED).await.as_deref() != Some("true")
    }

    /// Records that the app has been opened.
    pub async fn mark_visited(&self) -> Result<(), Error> {
        self.inner
            .storage
            .set(keys::FIRST_TIME_VISITED, "true".to_string())
            .await?;
        Ok(())
    }

    /// Registers a callback invoked on every status change.
    pub fn subscribe(&self, listener: impl Fn(AuthStatus) + 'static) -> SessionListenerKey {
        self.inner.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Returns whether the listener was registered.
    pub fn unsubscribe(&self, key: SessionListenerKey) -> bool {
        self.inner.listeners.borrow_mut().remove(key).is_some()
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.inner.storage.get(key).await {
            Ok(value) => value,
            Err(error) => {
                log::warn!("Reading {key} failed: {error}");
                None
            }
        }
    }

    fn bump_epoch(&self) -> u64 {
        let epoch = self.inner.epoch.get() + 1;
        self.inner.epoch.set(epoch);
        epoch
    }

    fn publish(&self, status: AuthStatus) {
        if self.inner.status.replace(status) == status {
            return;
        }
        log::debug!("Session is now {status:?}");
        let listeners: Vec<_> = self.inner.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("status", &self.status())
            .field("epoch", &self.inner.epoch.get())
            .finish()
    }
}

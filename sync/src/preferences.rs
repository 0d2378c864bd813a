use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use futures::StreamExt;
use futures_channel::{mpsc, oneshot};

use crate::{
    storage::{get_json, keys, KeyValueStore},
    util::spawn_local,
};

/// Color scheme selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThemeMode {
    /// Light scheme.
    Light,
    /// Dark scheme.
    Dark,
    /// Follow the platform.
    #[default]
    System,
}

impl ThemeMode {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeMode::Light => "light",
            ThemeMode::Dark => "dark",
            ThemeMode::System => "system",
        }
    }

    /// Parses the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(ThemeMode::Light),
            "dark" => Some(ThemeMode::Dark),
            "system" => Some(ThemeMode::System),
            _ => None,
        }
    }
}

impl fmt::Display for ThemeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// App-wide selections, persisted under `app-storage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPreferences {
    /// Locale code. Durable.
    pub language: String,
    /// Selected course category. Durable.
    pub selected_category: Option<u32>,
    /// Whether onboarding was completed. Durable.
    pub onboarding_seen: bool,
    /// Text typed into the search box. Session-only.
    pub search_draft: String,
}

impl Default for AppPreferences {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            selected_category: None,
            onboarding_seen: false,
            search_draft: String::new(),
        }
    }
}

const DEFAULT_LANGUAGE: &str = "en";

/// Screen-level UI state, persisted under `ui-storage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiPreferences {
    /// Selected bottom tab. Durable.
    pub active_tab: String,
    /// Active listing filters. Durable.
    pub filters: Vec<String>,
    /// Color scheme. Durable.
    pub theme_mode: ThemeMode,
    /// Whether the filter sheet is open. Session-only.
    pub is_filter_sheet_open: bool,
    /// Toast currently shown. Session-only.
    pub toast: Option<String>,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            active_tab: DEFAULT_TAB.to_string(),
            filters: Vec::new(),
            theme_mode: ThemeMode::default(),
            is_filter_sheet_open: false,
            toast: None,
        }
    }
}

const DEFAULT_TAB: &str = "home";

// Only the durable fields. Missing fields keep their default.
#[derive(Debug, Default, miniserde::Serialize, miniserde::Deserialize)]
struct AppSnapshot {
    language: Option<String>,
    selected_category: Option<u32>,
    onboarding_seen: Option<bool>,
}

#[derive(Debug, Default, miniserde::Serialize, miniserde::Deserialize)]
struct UiSnapshot {
    active_tab: Option<String>,
    filters: Option<Vec<String>>,
    theme_mode: Option<String>,
}

impl AppSnapshot {
    fn of(prefs: &AppPreferences) -> Self {
        Self {
            language: Some(prefs.language.clone()),
            selected_category: prefs.selected_category,
            onboarding_seen: Some(prefs.onboarding_seen),
        }
    }

    fn merge(self, prefs: &mut AppPreferences) {
        if let Some(language) = self.language {
            prefs.language = language;
        }
        prefs.selected_category = self.selected_category;
        if let Some(onboarding_seen) = self.onboarding_seen {
            prefs.onboarding_seen = onboarding_seen;
        }
    }
}

impl UiSnapshot {
    fn of(prefs: &UiPreferences) -> Self {
        Self {
            active_tab: Some(prefs.active_tab.clone()),
            filters: Some(prefs.filters.clone()),
            theme_mode: Some(prefs.theme_mode.as_str().to_string()),
        }
    }

    fn merge(self, prefs: &mut UiPreferences) {
        if let Some(active_tab) = self.active_tab {
            prefs.active_tab = active_tab;
        }
        if let Some(filters) = self.filters {
            prefs.filters = filters;
        }
        if let Some(theme_mode) = self.theme_mode.as_deref().and_then(ThemeMode::parse) {
            prefs.theme_mode = theme_mode;
        }
    }
}

// Durable fields written before hydration finished.
#[derive(Debug, Default)]
struct Touched {
    language: bool,
    selected_category: bool,
    onboarding_seen: bool,
    active_tab: bool,
    filters: bool,
    theme_mode: bool,
}

impl Touched {
    fn app(&self) -> bool {
        self.language || self.selected_category || self.onboarding_seen
    }

    fn ui(&self) -> bool {
        self.active_tab || self.filters || self.theme_mode
    }
}

enum WriteCommand {
    Put { key: &'static str, value: String },
    Flush(oneshot::Sender<()>),
}

/// Persisted UI selections.
///
/// Writes update memory synchronously and queue the durable fields for a
/// single background writer, so storage sees snapshots in write order and the
/// last write wins. Session-only fields are never written.
///
/// Nothing is persisted until [`hydrate`](Self::hydrate) completed. Fields
/// written before that are kept over the hydrated values and persisted once
/// hydration finishes.
#[derive(Clone)]
pub struct PreferenceStore {
    inner: Rc<PreferenceInner>,
}

struct PreferenceInner {
    storage: Rc<dyn KeyValueStore>,
    app: RefCell<AppPreferences>,
    ui: RefCell<UiPreferences>,
    hydrated: Cell<bool>,
    touched: RefCell<Touched>,
    writes: mpsc::UnboundedSender<WriteCommand>,
}

impl PreferenceStore {
    /// A store holding defaults. Spawns the writer on the current `LocalSet`.
    pub fn new(storage: Rc<dyn KeyValueStore>) -> Self {
        let (writes, queue) = mpsc::unbounded();
        spawn_local(run_writer(storage.clone(), queue));

        Self {
            inner: Rc::new(PreferenceInner {
                storage,
                app: RefCell::new(AppPreferences::default()),
                ui: RefCell::new(UiPreferences::default()),
                hydrated: Cell::new(false),
                touched: RefCell::new(Touched::default()),
                writes,
            }),
        }
    }

    /// Replaces the in-memory state with the last persisted snapshots merged
    /// over defaults. Without a snapshot, language and theme fall back to
    /// their raw keys. Unreadable values are logged and ignored.
    ///
    /// Durable fields written while hydrating win over the stored ones.
    pub async fn hydrate(&self) {
        self.inner.hydrated.set(false);
        // Writes queued by an earlier hydration must land before reading.
        self.flush().await;
        let storage = self.inner.storage.as_ref();

        let mut app = AppPreferences::default();
        match read_snapshot::<AppSnapshot>(storage, keys::APP_STORAGE).await {
            Some(snapshot) => snapshot.merge(&mut app),
            None => {
                if let Some(language) = read_raw(storage, keys::APP_LANGUAGE).await {
                    app.language = language;
                }
            }
        }

        let mut ui = UiPreferences::default();
        match read_snapshot::<UiSnapshot>(storage, keys::UI_STORAGE).await {
            Some(snapshot) => snapshot.merge(&mut ui),
            None => {
                if let Some(theme_mode) = read_raw(storage, keys::THEME_MODE)
                    .await
                    .as_deref()
                    .and_then(ThemeMode::parse)
                {
                    ui.theme_mode = theme_mode;
                }
            }
        }

        let touched = std::mem::take(&mut *self.inner.touched.borrow_mut());
        {
            let current = self.inner.app.borrow();
            if touched.language {
                app.language = current.language.clone();
            }
            if touched.selected_category {
                app.selected_category = current.selected_category;
            }
            if touched.onboarding_seen {
                app.onboarding_seen = current.onboarding_seen;
            }
            app.search_draft = current.search_draft.clone();
        }
        {
            let current = self.inner.ui.borrow();
            if touched.active_tab {
                ui.active_tab = current.active_tab.clone();
            }
            if touched.filters {
                ui.filters = current.filters.clone();
            }
            if touched.theme_mode {
                ui.theme_mode = current.theme_mode;
            }
            ui.is_filter_sheet_open = current.is_filter_sheet_open;
            ui.toast = current.toast.clone();
        }

        log::debug!("Hydrated preferences: {app:?} {ui:?}");
        *self.inner.app.borrow_mut() = app;
        *self.inner.ui.borrow_mut() = ui;
        self.inner.hydrated.set(true);

        if touched.app() {
            self.persist_app(touched.language);
        }
        if touched.ui() {
            self.persist_ui(touched.theme_mode);
        }
    }

    /// Current app preferences.
    pub fn app(&self) -> AppPreferences {
        self.inner.app.borrow().clone()
    }

    /// Current UI preferences.
    pub fn ui(&self) -> UiPreferences {
        self.inner.ui.borrow().clone()
    }

    /// Applies `update` and persists the durable app fields.
    pub fn update_app(&self, update: impl FnOnce(&mut AppPreferences)) {
        let (language, selected_category, onboarding_seen) = {
            let mut app = self.inner.app.borrow_mut();
            let previous = app.clone();
            update(&mut app);
            (
                app.language != previous.language,
                app.selected_category != previous.selected_category,
                app.onboarding_seen != previous.onboarding_seen,
            )
        };

        if !self.inner.hydrated.get() {
            let mut touched = self.inner.touched.borrow_mut();
            touched.language |= language;
            touched.selected_category |= selected_category;
            touched.onboarding_seen |= onboarding_seen;
            return;
        }
        self.persist_app(language);
    }

    /// Applies `update` and persists the durable UI fields.
    pub fn update_ui(&self, update: impl FnOnce(&mut UiPreferences)) {
        let (active_tab, filters, theme_mode) = {
            let mut ui = self.inner.ui.borrow_mut();
            let previous = ui.clone();
            update(&mut ui);
            (
                ui.active_tab != previous.active_tab,
                ui.filters != previous.filters,
                ui.theme_mode != previous.theme_mode,
            )
        };

        if !self.inner.hydrated.get() {
            let mut touched = self.inner.touched.borrow_mut();
            touched.active_tab |= active_tab;
            touched.filters |= filters;
            touched.theme_mode |= theme_mode;
            return;
        }
        self.persist_ui(theme_mode);
    }

    fn persist_app(&self, mirror_language: bool) {
        let (snapshot, language) = {
            let app = self.inner.app.borrow();
            (
                miniserde::json::to_string(&AppSnapshot::of(&app)),
                app.language.clone(),
            )
        };
        self.enqueue(keys::APP_STORAGE, snapshot);
        if mirror_language {
            self.enqueue(keys::APP_LANGUAGE, language);
        }
    }

    fn persist_ui(&self, mirror_theme_mode: bool) {
        let (snapshot, theme_mode) = {
            let ui = self.inner.ui.borrow();
            (miniserde::json::to_string(&UiSnapshot::of(&ui)), ui.theme_mode)
        };
        self.enqueue(keys::UI_STORAGE, snapshot);
        if mirror_theme_mode {
            self.enqueue(keys::THEME_MODE, theme_mode.as_str().to_string());
        }
    }

    /// Set the locale code.
    pub fn set_language(&self, language: impl Into<String>) {
        let language = language.into();
        self.update_app(|app| app.language = language);
    }

    /// Set the selected category.
    pub fn set_selected_category(&self, category: Option<u32>) {
        self.update_app(|app| app.selected_category = category);
    }

    /// Record onboarding completion.
    pub fn set_onboarding_seen(&self, seen: bool) {
        self.update_app(|app| app.onboarding_seen = seen);
    }

    /// Set the search box text. Not persisted.
    pub fn set_search_draft(&self, draft: impl Into<String>) {
        self.inner.app.borrow_mut().search_draft = draft.into();
    }

    /// Select a tab.
    pub fn set_active_tab(&self, tab: impl Into<String>) {
        let tab = tab.into();
        self.update_ui(|ui| ui.active_tab = tab);
    }

    /// Replace the listing filters.
    pub fn set_filters(&self, filters: Vec<String>) {
        self.update_ui(|ui| ui.filters = filters);
    }

    /// Select a color scheme.
    pub fn set_theme_mode(&self, theme_mode: ThemeMode) {
        self.update_ui(|ui| ui.theme_mode = theme_mode);
    }

    /// Open or close the filter sheet. Not persisted.
    pub fn set_filter_sheet_open(&self, open: bool) {
        self.inner.ui.borrow_mut().is_filter_sheet_open = open;
    }

    /// Show a toast. Not persisted.
    pub fn show_toast(&self, message: impl Into<String>) {
        self.inner.ui.borrow_mut().toast = Some(message.into());
    }

    /// Dismiss the toast.
    pub fn dismiss_toast(&self) {
        self.inner.ui.borrow_mut().toast = None;
    }

    /// Waits until every write queued so far reached storage.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.inner.writes.unbounded_send(WriteCommand::Flush(done)).is_err() {
            log::warn!("Preference writer stopped, nothing to flush");
            return;
        }
        let _ = flushed.await;
    }

    fn enqueue(&self, key: &'static str, value: String) {
        if self
            .inner
            .writes
            .unbounded_send(WriteCommand::Put { key, value })
            .is_err()
        {
            log::error!("Preference writer stopped, dropping write to {key}");
        }
    }
}

impl fmt::Debug for PreferenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceStore")
            .field("app", &self.inner.app.borrow())
            .field("ui", &self.inner.ui.borrow())
            .finish()
    }
}

async fn run_writer(storage: Rc<dyn KeyValueStore>, mut queue: mpsc::UnboundedReceiver<WriteCommand>) {
    while let Some(command) = queue.next().await {
        match command {
            WriteCommand::Put { key, value } => {
                if let Err(error) = storage.set(key, value).await {
                    log::error!("Persisting {key} failed: {error}");
                }
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::trace!("Preference writer stopped");
}

async fn read_snapshot<T: miniserde::Deserialize>(storage: &dyn KeyValueStore, key: &str) -> Option<T> {
    match get_json(storage, key).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            log::warn!("Ignoring unreadable {key}: {error}");
            None
        }
    }
}

async fn read_raw(storage: &dyn KeyValueStore, key: &str) -> Option<String> {
    match storage.get(key).await {
        Ok(value) => value,
        Err(error) => {
            log::warn!("Ignoring unreadable {key}: {error}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{storage::MemoryStorage, util::test_util::local};

    async fn hydrated(storage: &MemoryStorage) -> PreferenceStore {
        let prefs = PreferenceStore::new(Rc::new(storage.clone()));
        prefs.hydrate().await;
        prefs
    }

    #[tokio::test]
    async fn durable_fields_survive_hydration() {
        local(async {
            let storage = MemoryStorage::new();
            let prefs = hydrated(&storage).await;
            prefs.set_language("hi");
            prefs.set_selected_category(Some(4));
            prefs.set_active_tab("courses");
            prefs.set_filters(vec!["free".into(), "live".into()]);
            prefs.set_theme_mode(ThemeMode::Dark);
            prefs.set_search_draft("algebra");
            prefs.set_filter_sheet_open(true);
            prefs.show_toast("Saved");

            // Visible immediately, before anything is persisted.
            assert_eq!("hi", prefs.app().language);
            assert!(prefs.ui().is_filter_sheet_open);
            prefs.flush().await;

            // A fresh process over the same storage.
            let restarted = hydrated(&storage).await;
            let app = restarted.app();
            let ui = restarted.ui();
            assert_eq!("hi", app.language);
            assert_eq!(Some(4), app.selected_category);
            assert_eq!("courses", ui.active_tab);
            assert_eq!(vec!["free".to_string(), "live".to_string()], ui.filters);
            assert_eq!(ThemeMode::Dark, ui.theme_mode);

            assert_eq!("", app.search_draft);
            assert!(!ui.is_filter_sheet_open);
            assert_eq!(None, ui.toast);
        })
        .await;
    }

    #[tokio::test]
    async fn snapshot_holds_only_durable_fields() {
        local(async {
            let storage = MemoryStorage::new();
            let prefs = hydrated(&storage).await;
            prefs.set_search_draft("secret search");
            prefs.set_onboarding_seen(true);
            prefs.flush().await;

            let snapshot = storage.peek(keys::APP_STORAGE).unwrap();
            assert!(snapshot.contains("onboarding_seen"));
            assert!(!snapshot.contains("secret search"));
            assert!(!snapshot.contains("search_draft"));
        })
        .await;
    }

    #[tokio::test]
    async fn raw_keys_are_mirrored_and_used_as_fallback() {
        local(async {
            let storage = MemoryStorage::new();
            let prefs = hydrated(&storage).await;
            prefs.set_language("ta");
            prefs.set_theme_mode(ThemeMode::Light);
            prefs.flush().await;
            assert_eq!(Some("ta".to_string()), storage.peek(keys::APP_LANGUAGE));
            assert_eq!(Some("light".to_string()), storage.peek(keys::THEME_MODE));

            // Only the raw keys, as written by an older release.
            let legacy = MemoryStorage::new();
            legacy.set(keys::APP_LANGUAGE, "mr".into()).await.unwrap();
            legacy.set(keys::THEME_MODE, "dark".into()).await.unwrap();
            let prefs = hydrated(&legacy).await;
            assert_eq!("mr", prefs.app().language);
            assert_eq!(ThemeMode::Dark, prefs.ui().theme_mode);
            assert_eq!("home", prefs.ui().active_tab);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn writes_land_in_order() {
        local(async {
            let storage = MemoryStorage::new();
            storage.set_latency(Duration::from_millis(5));
            let prefs = hydrated(&storage).await;
            for tab in ["home", "courses", "tests", "profile"] {
                prefs.set_active_tab(tab);
            }
            prefs.flush().await;

            storage.set_latency(Duration::ZERO);
            let restarted = hydrated(&storage).await;
            assert_eq!("profile", restarted.ui().active_tab);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn writes_during_hydration_keep_stored_fields() {
        local(async {
            let storage = MemoryStorage::new();
            let prefs = hydrated(&storage).await;
            prefs.set_theme_mode(ThemeMode::Dark);
            prefs.set_active_tab("courses");
            prefs.set_language("hi");
            prefs.flush().await;

            storage.set_latency(Duration::from_millis(20));
            let restarted = PreferenceStore::new(Rc::new(storage.clone()));
            let tap_tab = async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                restarted.set_active_tab("profile");
            };
            futures::join!(restarted.hydrate(), tap_tab);

            let ui = restarted.ui();
            assert_eq!("profile", ui.active_tab);
            assert_eq!(ThemeMode::Dark, ui.theme_mode);
            assert_eq!("hi", restarted.app().language);

            restarted.flush().await;
            let stored = storage.peek(keys::UI_STORAGE).unwrap();
            assert!(stored.contains("profile"));
            assert!(stored.contains("dark"));

            storage.set_latency(Duration::ZERO);
            let again = hydrated(&storage).await;
            assert_eq!("profile", again.ui().active_tab);
            assert_eq!(ThemeMode::Dark, again.ui().theme_mode);
        })
        .await;
    }

    #[tokio::test]
    async fn storage_failures_fall_back_to_defaults() {
        local(async {
            let storage = MemoryStorage::new();
            storage.set(keys::UI_STORAGE, "{broken".into()).await.unwrap();
            storage.fail_key(keys::APP_STORAGE);
            storage.fail_key(keys::APP_LANGUAGE);

            let prefs = hydrated(&storage).await;
            assert_eq!(AppPreferences::default(), prefs.app());
            assert_eq!(UiPreferences::default(), prefs.ui());

            // Writes still apply in memory.
            prefs.set_language("bn");
            prefs.flush().await;
            assert_eq!("bn", prefs.app().language);
        })
        .await;
    }

    #[test]
    fn theme_mode_strings() {
        for mode in [ThemeMode::Light, ThemeMode::Dark, ThemeMode::System] {
            assert_eq!(Some(mode), ThemeMode::parse(mode.as_str()));
        }
        assert_eq!(None, ThemeMode::parse("sepia"));
    }
}

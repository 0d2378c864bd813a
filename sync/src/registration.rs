use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use async_trait::async_trait;
use futures::{
    future::{LocalBoxFuture, Shared},
    FutureExt,
};

use crate::Error;

/// Remote source of the lookup lists shown during signup.
#[async_trait(?Send)]
pub trait ReferenceDataSource {
    /// Selectable classes.
    async fn fetch_classes(&self) -> Result<Vec<ClassOption>, Error>;
    /// Selectable state boards.
    async fn fetch_boards(&self) -> Result<Vec<Board>, Error>;
    /// Cities of one state.
    async fn fetch_cities(&self, state_id: u32) -> Result<Vec<City>, Error>;
}

/// A selectable class.
#[derive(Debug, Clone, PartialEq, Eq, miniserde::Serialize, miniserde::Deserialize)]
pub struct ClassOption {
    /// Remote identifier.
    pub id: u32,
    /// Display name.
    pub name: String,
}

/// A selectable education board.
#[derive(Debug, Clone, PartialEq, Eq, miniserde::Serialize, miniserde::Deserialize)]
pub struct Board {
    /// Remote identifier.
    pub id: u32,
    /// Display name.
    pub name: String,
}

/// A city within a state.
#[derive(Debug, Clone, PartialEq, Eq, miniserde::Serialize, miniserde::Deserialize)]
pub struct City {
    /// Remote identifier.
    pub id: u32,
    /// Display name.
    pub name: String,
}

/// Lookup data shared by every signup step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationDraft {
    /// Selectable classes.
    pub classes: Vec<ClassOption>,
    /// Selectable state boards.
    pub state_boards: Vec<Board>,
    /// Whether both lists were loaded.
    pub is_loaded: bool,
    /// Failure of the last load, cleared by the next successful one.
    pub error: Option<Error>,
    /// Cities loaded so far, by state id.
    pub cities_by_state: HashMap<u32, Vec<City>>,
}

type SharedLoad<T> = Shared<LocalBoxFuture<'static, Result<T, Error>>>;

/// Process-lifetime cache of the signup lookup lists.
///
/// Lists are fetched once and reused across steps. Concurrent loads join the
/// one in flight. [`clear_data`](Self::clear_data) starts a new epoch, and a
/// load from an earlier epoch never writes into the draft.
#[derive(Clone)]
pub struct RegistrationDraftCache {
    inner: Rc<DraftInner>,
}

struct DraftInner {
    source: Rc<dyn ReferenceDataSource>,
    draft: RefCell<RegistrationDraft>,
    epoch: Cell<u64>,
    pending: RefCell<Option<SharedLoad<()>>>,
    pending_cities: RefCell<HashMap<u32, SharedLoad<Vec<City>>>>,
}

impl RegistrationDraftCache {
    /// An empty, unloaded cache.
    pub fn new(source: Rc<dyn ReferenceDataSource>) -> Self {
        Self {
            inner: Rc::new(DraftInner {
                source,
                draft: RefCell::new(RegistrationDraft::default()),
                epoch: Cell::new(0),
                pending: RefCell::new(None),
                pending_cities: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Snapshot of the draft.
    pub fn draft(&self) -> RegistrationDraft {
        self.inner.draft.borrow().clone()
    }

    /// Whether both lists are loaded.
    pub fn is_loaded(&self) -> bool {
        self.inner.draft.borrow().is_loaded
    }

    /// Failure of the last load.
    pub fn error(&self) -> Option<Error> {
        self.inner.draft.borrow().error.clone()
    }

    /// Memoized cities of `state_id`.
    pub fn cities(&self, state_id: u32) -> Option<Vec<City>> {
        self.inner.draft.borrow().cities_by_state.get(&state_id).cloned()
    }

    /// Fetches classes and boards in parallel.
    ///
    /// A no-op once loaded without error. Calls while a load is pending join
    /// it. The failure is also recorded in [`RegistrationDraft::error`].
    pub async fn load_all_data(&self) -> Result<(), Error> {
        {
            let draft = self.inner.draft.borrow();
            if draft.is_loaded && draft.error.is_none() {
                return Ok(());
            }
        }

        let pending = self.inner.pending.borrow().clone();
        let load = match pending {
            Some(load) => load,
            None => {
                let load = self.start_load();
                *self.inner.pending.borrow_mut() = Some(load.clone());
                load
            }
        };
        load.await
    }

    fn start_load(&self) -> SharedLoad<()> {
        let inner = self.inner.clone();
        let epoch = inner.epoch.get();
        log::debug!("Loading registration reference data");

        async move {
            let result = futures::try_join!(inner.source.fetch_classes(), inner.source.fetch_boards());

            if inner.epoch.get() != epoch {
                log::debug!("Registration data was cleared while loading, discarding");
                return result.map(|_| ());
            }
            inner.pending.borrow_mut().take();

            let mut draft = inner.draft.borrow_mut();
            match result {
                Ok((classes, state_boards)) => {
                    draft.classes = classes;
                    draft.state_boards = state_boards;
                    draft.is_loaded = true;
                    draft.error = None;
                    Ok(())
                }
                Err(error) => {
                    log::warn!("Loading registration reference data failed: {error}");
                    draft.error = Some(error.clone());
                    Err(error)
                }
            }
        }
        .boxed_local()
        .shared()
    }

    /// Cities of `state_id`, fetched at most once per id. Failures are not
    /// memoized.
    pub async fn load_cities_for_state(&self, state_id: u32) -> Result<Vec<City>, Error> {
        if let Some(cities) = self.cities(state_id) {
            return Ok(cities);
        }

        let pending = self.inner.pending_cities.borrow().get(&state_id).cloned();
        let load = match pending {
            Some(load) => load,
            None => {
                let load = self.start_cities_load(state_id);
                self.inner
                    .pending_cities
                    .borrow_mut()
                    .insert(state_id, load.clone());
                load
            }
        };
        load.await
    }

    fn start_cities_load(&self, state_id: u32) -> SharedLoad<Vec<City>> {
        let inner = self.inner.clone();
        let epoch = inner.epoch.get();

        async move {
            let result = inner.source.fetch_cities(state_id).await;

            if inner.epoch.get() != epoch {
                return result;
            }
            inner.pending_cities.borrow_mut().remove(&state_id);

            match &result {
                Ok(cities) => {
                    inner
                        .draft
                        .borrow_mut()
                        .cities_by_state
                        .insert(state_id, cities.clone());
                }
                Err(error) => log::warn!("Loading cities of state {state_id} failed: {error}"),
            }
            result
        }
        .boxed_local()
        .shared()
    }

    /// Resets to the empty, unloaded state. Loads in flight finish but are
    /// discarded.
    pub fn clear_data(&self) {
        self.inner.epoch.set(self.inner.epoch.get() + 1);
        *self.inner.draft.borrow_mut() = RegistrationDraft::default();
        self.inner.pending.borrow_mut().take();
        self.inner.pending_cities.borrow_mut().clear();
        log::debug!("Registration data cleared");
    }
}

impl std::fmt::Debug for RegistrationDraftCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationDraftCache")
            .field("draft", &self.inner.draft.borrow())
            .finish()
    }
}

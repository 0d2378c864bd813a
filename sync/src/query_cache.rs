use std::{
    any::{Any, TypeId},
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    rc::{Rc, Weak},
};

use crate::{query::Query, QueryKey, QueryValue};

/// Every query of every value type, keyed by the value's `TypeId`.
#[derive(Clone)]
pub(crate) struct QueryCache {
    cache: Rc<RefCell<HashMap<TypeId, Box<dyn ErasedCache>>>>,
}

/// Handle held by queries so that a query never keeps its cache alive.
#[derive(Clone)]
pub(crate) struct WeakQueryCache {
    cache: Weak<RefCell<HashMap<TypeId, Box<dyn ErasedCache>>>>,
}

impl WeakQueryCache {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.cache.upgrade().map(|cache| QueryCache { cache })
    }
}

pub(crate) struct TypedCache<V>(HashMap<QueryKey, Query<V>>);

// Trait to enable cache introspection among distinct cache entry maps.
pub(crate) trait ErasedCache {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn size(&self) -> usize;
    /// Queries whose key starts with `prefix`, or all of them.
    fn matching(&self, prefix: Option<&QueryKey>) -> Vec<Box<dyn ErasedQuery>>;
    fn drain(&mut self) -> Vec<Box<dyn ErasedQuery>>;
}

/// The operations that do not depend on a query's value type.
pub(crate) trait ErasedQuery {
    fn mark_invalid(&self) -> bool;
    fn is_fetching(&self) -> bool;
    fn dispose(&self);
}

impl<V: QueryValue> ErasedCache for TypedCache<V> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn matching(&self, prefix: Option<&QueryKey>) -> Vec<Box<dyn ErasedQuery>> {
        self.0
            .values()
            .filter(|query| prefix.map_or(true, |prefix| query.key.starts_with(prefix)))
            .map(|query| Box::new(query.clone()) as Box<dyn ErasedQuery>)
            .collect()
    }

    fn drain(&mut self) -> Vec<Box<dyn ErasedQuery>> {
        self.0
            .drain()
            .map(|(_, query)| Box::new(query) as Box<dyn ErasedQuery>)
            .collect()
    }
}

impl<V: QueryValue> ErasedQuery for Query<V> {
    fn mark_invalid(&self) -> bool {
        Query::mark_invalid(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }

    fn dispose(&self) {
        Query::dispose(self)
    }
}

impl QueryCache {
    pub(crate) fn new() -> Self {
        Self {
            cache: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache {
            cache: Rc::downgrade(&self.cache),
        }
    }

    pub(crate) fn get_or_create_query<V: QueryValue>(&self, key: QueryKey) -> Query<V> {
        let weak = self.downgrade();
        self.use_cache(move |cache| match cache.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                log::trace!("Created query {}", entry.key());
                let query = Query::new(entry.key().clone(), weak);
                entry.insert(query).clone()
            }
        })
    }

    pub(crate) fn get_query<V: QueryValue>(&self, key: &QueryKey) -> Option<Query<V>> {
        self.use_cache_option(|cache| cache.get(key).cloned())
    }

    /// Removes the entry regardless of subscribers. Subscribed observers keep
    /// their handle to the detached query.
    pub(crate) fn evict_query<V: QueryValue>(&self, key: &QueryKey) -> bool {
        let removed = self.use_cache_option_mut::<V, _, _>(|cache| cache.remove(key));
        match removed {
            Some(query) => {
                query.dispose();
                true
            }
            None => false,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.cache.borrow().values().map(|cache| cache.size()).sum()
    }

    /// Collected outside the borrow, so callers may re-enter the cache.
    pub(crate) fn queries_matching(&self, prefix: Option<&QueryKey>) -> Vec<Box<dyn ErasedQuery>> {
        self.cache
            .borrow()
            .values()
            .flat_map(|cache| cache.matching(prefix))
            .collect()
    }

    pub(crate) fn fetching_count(&self) -> usize {
        self.queries_matching(None)
            .iter()
            .filter(|query| query.is_fetching())
            .count()
    }

    pub(crate) fn clear_all(&self) -> usize {
        let drained: Vec<_> = self
            .cache
            .borrow_mut()
            .values_mut()
            .flat_map(|cache| cache.drain())
            .collect();
        for query in &drained {
            query.dispose();
        }
        drained.len()
    }

    pub(crate) fn use_cache_option<V, F, R>(&self, func: F) -> Option<R>
    where
        V: QueryValue,
        F: FnOnce(&HashMap<QueryKey, Query<V>>) -> Option<R>,
    {
        let cache = self.cache.borrow();
        let cache = cache.get(&TypeId::of::<V>())?;
        let cache = cache.as_any().downcast_ref::<TypedCache<V>>()?;
        func(&cache.0)
    }

    pub(crate) fn use_cache_option_mut<V, F, R>(&self, func: F) -> Option<R>
    where
        V: QueryValue,
        F: FnOnce(&mut HashMap<QueryKey, Query<V>>) -> Option<R>,
    {
        let mut cache = self.cache.borrow_mut();
        let cache = cache.get_mut(&TypeId::of::<V>())?;
        let cache = cache.as_any_mut().downcast_mut::<TypedCache<V>>()?;
        func(&mut cache.0)
    }

    pub(crate) fn use_cache<V, R>(&self, func: impl FnOnce(&mut HashMap<QueryKey, Query<V>>) -> R) -> R
    where
        V: QueryValue,
    {
        let mut cache = self.cache.borrow_mut();

        let cache: &mut Box<dyn ErasedCache> = cache
            .entry(TypeId::of::<V>())
            .or_insert_with(|| Box::new(TypedCache::<V>(HashMap::new())));

        let cache: &mut TypedCache<V> = cache
            .as_any_mut()
            .downcast_mut::<TypedCache<V>>()
            .expect(EXPECT_CACHE_ERROR);

        func(&mut cache.0)
    }
}

const EXPECT_CACHE_ERROR: &str =
    "Error: Query Cache Type Mismatch. Entries are keyed by their own TypeId.";

#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Catalog Sync
//!
//! Catalog Sync is the client-side state layer of the course catalog app.
//!
//! It provides:
//! - query caching with stale times and garbage collection
//! - de-duplication of concurrent fetches for the same key
//! - retries with backoff, aware of connectivity
//! - invalidation, optimistic updates and mutations
//! - a global busy indicator that can never get stuck
//! - a persisted authentication session
//! - a cache for the signup wizard's lookup data
//! - persisted UI preferences
//!
//! Every store is `Rc` based and must live on a [`tokio::task::LocalSet`].
//!
//! ## The main entry points are:
//! - [`SyncServices::init`] - Builds every store around one [`KeyValueStore`](storage::KeyValueStore).
//! - [`QueryClient::query`] - Subscribe to a query, fetching it when needed.
//! - [`QueryClient::fetch_query`] - Read a query once.
//!
//! # A Simple Example
//!
//! ```
//! use catalog_sync::*;
//!
//! // Query fetcher.
//! async fn get_courses(key: QueryKey) -> Result<Vec<String>, Error> {
//!     Ok(vec![format!("course for {key}")])
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(
//! tokio::task::LocalSet::new().run_until(async {
//!     let client = QueryClient::default();
//!
//!     // Two screens asking for the same key share one request.
//!     let list = client.query(query_key!["courses", 5], get_courses, QueryOptions::default());
//!     let header = client.query(query_key!["courses", 5], get_courses, QueryOptions::default());
//!
//!     list.settled().await;
//!     assert_eq!(list.data(), header.data());
//!
//!     // Refetched by every active observer.
//!     client.invalidate_queries(&query_key!["courses"]);
//! })
//! # );
//! ```

mod busy;
mod error;
mod garbage_collector;
mod instant;
mod preferences;
mod query;
mod query_cache;
mod query_client;
mod query_executor;
mod query_key;
mod query_observer;
mod query_options;
mod query_state;
mod registration;
mod services;
mod session;
/// Durable key-value storage.
pub mod storage;
mod util;

pub use busy::*;
pub use error::*;
pub use instant::*;
pub use preferences::*;
pub use query_client::*;
pub use query_key::*;
pub use query_observer::*;
pub use query_options::*;
pub use query_state::*;
pub use registration::*;
pub use services::*;
pub use session::*;

/// Convenience trait for query value requirements.
pub trait QueryValue: std::fmt::Debug + Clone + 'static {}
impl<V> QueryValue for V where V: std::fmt::Debug + Clone + 'static {}

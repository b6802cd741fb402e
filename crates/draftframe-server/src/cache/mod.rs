//! In-process caches for the preview gateway.
//!
//! - **Response cache**: raw upstream responses, TTL by content class, bounded with
//!   oldest-first eviction, purged per tenant by the push pipeline.
//! - **Domain cache**: custom storefront domain per tenant, refreshed hourly.
//!
//! Both are per-process; nothing here is shared between gateway instances.

pub mod domain;
pub mod store;

pub use domain::DomainResolver;
pub use store::{CacheEntry, CacheKey, CacheStore, Clock, InvalidationHandle, InvalidationHook};

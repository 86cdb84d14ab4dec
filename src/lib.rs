//! Offline-first sync core for the restaurant POS.
//!
//! A local caching proxy ([`manager::CacheManager`]) sits in front of the POS
//! backend, serving cached data when the network is gone and absorbing
//! mutations into a durable [`outbox::OutboxStore`]. When connectivity
//! returns, the [`sync::SyncCoordinator`] replays the outbox as batch
//! requests and reconciles each item's result.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod manager;
pub mod optimistic;
pub mod outbox;
pub mod server;
pub mod sync;
pub mod upstream;

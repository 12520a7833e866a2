//! The storage engine: configuration, page cache, clusters, atomic
//! operation units and the [`engine::PaginatedStorage`] facade.

#![forbid(unsafe_code)]

pub mod atomic;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod locks;
pub mod page;
pub mod transaction;

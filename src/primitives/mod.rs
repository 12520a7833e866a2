//! Low-level building blocks: positioned file I/O and the write-ahead log.

#![forbid(unsafe_code)]

pub mod io;
pub mod wal;

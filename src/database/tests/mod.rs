//! Database tests
//!
//! Concurrency checks for the pool and the write/transaction helpers.

//! rookery: the core of a self-hosted feed aggregator.
//!
//! - [`feed`]: fetching, parsing, autodiscovery, favicons and item merging
//! - [`worker`]: the bounded-concurrency refresh scheduler and its API
//! - [`storage`]: SQLite persistence for feeds, items, folders and settings
//! - [`config`]: the TOML configuration file
//! - [`util`]: URL validation and text helpers

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
pub mod worker;

//! Feed acquisition engine: conditional fetching with autodiscovery, entry
//! merging, adaptive per-feed polling and race-free tracking of bulk jobs.

pub mod config;
pub mod feed;
pub mod jobs;
pub mod schedule;
pub mod storage;
pub mod util;

//! SQLite persistence for feeds, entries, users, folders and job states.
//!
//! All operations are methods on [`Database`], grouped by table in the
//! submodules below.

mod entries;
mod feeds;
mod folders;
mod job_states;
mod schema;
mod types;
mod users;

pub use schema::Database;
pub use types::{
    DatabaseError, Entry, Feed, FeedUpdate, Folder, FolderWithFeeds, JobKind, JobState, JobStatus,
    MergeStats, ParsedEntry, User,
};

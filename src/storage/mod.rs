mod feeds;
mod folders;
mod items;
mod schema;
mod search;
mod settings;
mod types;

pub use schema::Database;
pub use settings::{Settings, SettingsPatch};
pub use types::{
    CacheValidators, DatabaseError, Feed, FeedStats, Folder, Item, ItemFilter, ItemStatus,
    MarkFilter, NewItem,
};

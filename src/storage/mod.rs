mod accounts;
mod schema;
mod types;
mod watch_state;

pub use schema::Database;
pub use types::{
    Account, AccountProfile, Disposition, HandledItem, HistoryEntry, Item, PersistenceError,
};

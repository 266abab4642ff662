pub mod audit;
pub mod cache;
pub mod chats;
pub mod database;
pub mod error;
pub mod grants;
pub mod row_helpers;
pub mod schema;
pub mod templates;
pub mod usage;

pub use database::Database;
pub use error::StoreError;

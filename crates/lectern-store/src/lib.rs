pub mod bibles;
pub mod database;
pub mod error;
pub mod hymns;
pub mod row_helpers;
pub mod schema;

pub use bibles::{BibleImport, BibleMetadata, BibleRepo, BibleRow};
pub use database::Database;
pub use error::StoreError;
pub use hymns::{HymnDetail, HymnRepo, HymnSummary};

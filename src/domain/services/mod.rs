mod catalog;

pub use catalog::{Catalog, Effect, Merge, HISTORY_LIMIT};

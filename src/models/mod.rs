pub mod item;
pub mod loaders;

pub use item::{
    BatchResult, BatchStats, BatchStatus, Item, ItemError, ItemErrorKind, ItemOutcome, SkipReason,
};
pub use loaders::load_items_from_toml;

pub mod toml_loader;

pub use toml_loader::{load_items_from_toml, parse_items};

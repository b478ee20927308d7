pub mod fs;

mod mock_store;

pub use mock_store::{manifest_from_json, MockStore};

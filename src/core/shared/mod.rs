pub mod schema;
pub mod state;
pub mod store;
pub mod utils;

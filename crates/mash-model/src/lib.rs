mod domain;
pub use domain::*;

pub mod store;
pub use store::{Entity, Store, StoreError};

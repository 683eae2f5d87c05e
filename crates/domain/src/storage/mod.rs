//! Storage contracts implemented by the in-memory cache and the SeaORM
//! backend.

mod traits;

pub use traits::*;

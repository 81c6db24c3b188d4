pub mod status;

pub use status::{IssuedRecord, StatusStore};

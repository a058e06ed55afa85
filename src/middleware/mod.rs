//! Tower middleware shared by every route.

pub mod request_id;

pub use request_id::{request_id_layer, RequestIdExt};

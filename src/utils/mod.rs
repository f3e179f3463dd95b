//! Small shared utilities.

mod timestamps;
mod uuid_utils;

pub use timestamps::{iso_timestamp, now_millis, Timestamp};
pub use uuid_utils::{generate_uuid, short_id};

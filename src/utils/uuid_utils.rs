//! UUID helpers.

use uuid::Uuid;

/// Generates a new random UUID.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a short random identifier (first UUID segment).
#[must_use]
pub fn short_id() -> String {
    let id = Uuid::new_v4().to_string();
    id.split('-').next().unwrap_or(&id).to_string()
}

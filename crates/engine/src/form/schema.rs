//! Process-wide form engine schema management switch
//!
//! When disabled, engine startup does not verify the form engine tables.
//! The switch is read once per engine build and frozen afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use super::FormError;

static SCHEMA_MANAGEMENT_ENABLED: AtomicBool = AtomicBool::new(true);
static SCHEMA_MANAGEMENT_LOCKED: AtomicBool = AtomicBool::new(false);

/// Change the switch; fails once any process engine has been built
pub fn set_schema_management_enabled(enabled: bool) -> Result<(), FormError> {
    if SCHEMA_MANAGEMENT_LOCKED.load(Ordering::Acquire) {
        return Err(FormError::SchemaManagementLocked);
    }
    SCHEMA_MANAGEMENT_ENABLED.store(enabled, Ordering::Release);
    info!(enabled, "form engine schema management switched");
    Ok(())
}

pub fn is_schema_management_enabled() -> bool {
    SCHEMA_MANAGEMENT_ENABLED.load(Ordering::Acquire)
}

/// Freeze the switch and return its value
pub(crate) fn lock_schema_management() -> bool {
    SCHEMA_MANAGEMENT_LOCKED.store(true, Ordering::Release);
    is_schema_management_enabled()
}

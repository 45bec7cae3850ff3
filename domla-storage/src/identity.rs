//! Write-permission guard for the reserved read-only user

use domla_common::error::{Error, Result};
use domla_common::types::VIEW_ONLY_USER;

/// Reject mutating operations for the reserved read-only login
pub fn deny_view_only(user: &str) -> Result<()> {
    if user == VIEW_ONLY_USER {
        return Err(Error::Auth(format!(
            "user '{user}' may not modify the archive"
        )));
    }
    Ok(())
}

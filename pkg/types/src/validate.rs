use anyhow::{Result, bail};
use pkg_constants::presence::MAX_IDENTITY_ID_LEN;

/// Validate an identity id before it is used in a lease key or document path.
/// Rules: non-empty, no surrounding whitespace, max 128 chars, no `/`.
pub fn validate_identity_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("identity id must not be empty");
    }
    if id.len() > MAX_IDENTITY_ID_LEN {
        bail!(
            "identity id exceeds {} characters (got {})",
            MAX_IDENTITY_ID_LEN,
            id.len()
        );
    }
    if id.trim() != id {
        bail!("identity id '{}' must not have surrounding whitespace", id);
    }
    if id.contains('/') {
        bail!("identity id '{}' must not contain '/'", id);
    }
    Ok(())
}

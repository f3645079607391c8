use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Windows must be non-empty, inside the supported clock range and no wider
/// than a year.
pub(crate) fn validate_window(window: &Span) -> Result<(), EngineError> {
    if !window.is_valid()
        || window.start < MIN_VALID_TIMESTAMP_MS
        || window.end > MAX_VALID_TIMESTAMP_MS
        || window.duration_ms() > MAX_WINDOW_DURATION_MS
    {
        return Err(EngineError::InvalidWindow(*window));
    }
    Ok(())
}

pub(crate) fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_groups(groups: &std::collections::BTreeSet<GroupId>) -> Result<(), EngineError> {
    if groups.len() > MAX_GROUPS_PER_ENTITY {
        return Err(EngineError::LimitExceeded("too many groups"));
    }
    Ok(())
}

use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.is_empty() {
        return Err(EngineError::InvalidRequest("interval start must precede its end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Collapse repeated ids, keeping first-occurrence order.
pub(crate) fn dedup_in_order(ids: &[Ulid]) -> Vec<Ulid> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// `tryBook`: all-or-nothing check of `span` against every resource.
///
/// Reports the first busy resource in iteration order. Nothing is mutated
/// and no substitute resource is searched for.
pub(crate) fn try_book<'a>(
    resources: impl IntoIterator<Item = &'a ResourceState>,
    span: &Span,
) -> Result<(), EngineError> {
    for rs in resources {
        if !rs.query(span) {
            return Err(EngineError::Conflict(rs.id));
        }
    }
    Ok(())
}

/// An appointment needs at least one technician and at least one bay.
pub(crate) fn check_crew<'a>(
    resources: impl IntoIterator<Item = &'a ResourceState>,
) -> Result<(), EngineError> {
    let (mut technician, mut bay) = (false, false);
    for rs in resources {
        match rs.kind {
            ResourceKind::Technician => technician = true,
            ResourceKind::Bay => bay = true,
        }
    }
    if !technician {
        return Err(EngineError::InvalidRequest("appointment needs at least one technician"));
    }
    if !bay {
        return Err(EngineError::InvalidRequest("appointment needs at least one bay"));
    }
    Ok(())
}

/// Every required capability must be offered by some assigned resource.
pub(crate) fn check_capabilities<'a>(
    required: &BTreeSet<String>,
    resources: impl IntoIterator<Item = &'a ResourceState>,
) -> Result<(), EngineError> {
    if required.is_empty() {
        return Ok(());
    }
    let offered: BTreeSet<&String> = resources
        .into_iter()
        .flat_map(|rs| rs.capabilities.iter())
        .collect();
    match required.iter().find(|tag| !offered.contains(tag)) {
        Some(missing) => Err(EngineError::MissingCapability(missing.clone())),
        None => Ok(()),
    }
}

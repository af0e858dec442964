//! Request-intent classifier (component F): short-circuits internal
//! bookkeeping queries before they reach upstream fan-out.

use crate::model::Filter;

/// Per-request context the relay framework attaches ahead of the
/// classifier: whether this call originated from the framework's own
/// internal bookkeeping, and the subscription id the client supplied (if
/// any).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub internal_marker: bool,
    pub sub_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    PassThrough,
    ShortCircuit,
}

/// Applies the two short-circuit rules ahead of any fan-out. Symmetric
/// across QUERY and COUNT — the caller decides what "empty closed
/// stream" or "zero count" means for its own call shape.
pub fn classify(filter: &Filter, ctx: &RequestContext) -> Intent {
    if ctx.internal_marker {
        return Intent::ShortCircuit;
    }
    if ctx.sub_id.is_none() && filter.is_deletion_check_shape() {
        return Intent::ShortCircuit;
    }
    Intent::PassThrough
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn deletion_filter() -> Filter {
        let mut tags = BTreeMap::new();
        tags.insert("#e".to_string(), vec!["deadbeef".to_string()]);
        Filter { kinds: vec![5], tags, ..Default::default() }
    }

    #[test]
    fn internal_marker_always_short_circuits() {
        let ctx = RequestContext { internal_marker: true, sub_id: Some("sub1".to_string()) };
        assert_eq!(classify(&Filter::default(), &ctx), Intent::ShortCircuit);
    }

    #[test]
    fn deletion_shape_without_sub_id_short_circuits() {
        let ctx = RequestContext { internal_marker: false, sub_id: None };
        assert_eq!(classify(&deletion_filter(), &ctx), Intent::ShortCircuit);
    }

    #[test]
    fn deletion_shape_with_sub_id_passes_through() {
        let ctx = RequestContext { internal_marker: false, sub_id: Some("sub1".to_string()) };
        assert_eq!(classify(&deletion_filter(), &ctx), Intent::PassThrough);
    }

    #[test]
    fn ordinary_filter_passes_through() {
        let ctx = RequestContext::default();
        let filter = Filter { kinds: vec![1], ..Default::default() };
        assert_eq!(classify(&filter, &ctx), Intent::PassThrough);
    }
}

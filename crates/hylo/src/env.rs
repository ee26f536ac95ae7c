use std::collections::BTreeSet;
use std::env;
use std::sync::OnceLock;

use tracing::warn;

use crate::graph::OpKind;

static HYLO_FORCE_FALLBACK: OnceLock<BTreeSet<OpKind>> = OnceLock::new();
static HYLO_SERIAL_BUILDS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_kinds(value: &str) -> BTreeSet<OpKind> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match name.parse::<OpKind>() {
            Ok(kind) => Some(kind),
            Err(err) => {
                warn!(%err, "ignoring entry in HYLO_FORCE_FALLBACK");
                None
            }
        })
        .collect()
}

/// Operation kinds listed in `HYLO_FORCE_FALLBACK` (comma separated).
pub(crate) fn forced_fallback_kinds() -> &'static BTreeSet<OpKind> {
    HYLO_FORCE_FALLBACK.get_or_init(|| match env::var("HYLO_FORCE_FALLBACK") {
        Ok(value) => parse_kinds(&value),
        Err(_) => BTreeSet::new(),
    })
}

pub(crate) fn serial_builds() -> bool {
    *HYLO_SERIAL_BUILDS.get_or_init(|| match env::var("HYLO_SERIAL_BUILDS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_lists_skip_unknown_names() {
        let kinds = parse_kinds("conv2d, Softmax,,bogus");
        assert_eq!(
            kinds.into_iter().collect::<Vec<_>>(),
            vec![OpKind::Conv2d, OpKind::Softmax]
        );
    }

    #[test]
    fn unknown_kind_names_report_the_input() {
        let err = " Bogus ".parse::<OpKind>().expect_err("unknown kind");
        assert_eq!(err.to_string(), "unknown operation kind 'Bogus'");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn booleans_accept_common_spellings() {
        assert!(parse_bool(" Yes "));
        assert!(!parse_bool("0"));
    }
}

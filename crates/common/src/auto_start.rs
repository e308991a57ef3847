//! Launch-time selection of tunnels by tag

use crate::config::{TagMatch, TunnelSpec};
use crate::types::TunnelId;

/// Requested tag that matches every tunnel
pub const ALL_TAG: &str = "all";

/// Split a comma-separated `--auto-start` value into tags
///
/// Whitespace around entries is trimmed and empty entries are dropped, so an
/// empty or blank value yields no tags.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ids of the tunnels to start at launch, in config order
///
/// `all` (any case) selects everything. Otherwise a tunnel is selected when one of
/// its tags is requested; requested tags that match nothing are ignored.
pub fn select<S: AsRef<str>>(
    specs: &[TunnelSpec],
    requested: &[S],
    tag_match: TagMatch,
) -> Vec<TunnelId> {
    if requested.is_empty() {
        return Vec::new();
    }

    if requested
        .iter()
        .any(|tag| tag.as_ref().eq_ignore_ascii_case(ALL_TAG))
    {
        return specs.iter().map(|spec| spec.id.clone()).collect();
    }

    specs
        .iter()
        .filter(|spec| {
            spec.tags.iter().any(|tag| {
                requested
                    .iter()
                    .any(|wanted| tag_matches(tag, wanted.as_ref(), tag_match))
            })
        })
        .map(|spec| spec.id.clone())
        .collect()
}

fn tag_matches(tag: &str, wanted: &str, tag_match: TagMatch) -> bool {
    match tag_match {
        TagMatch::Exact => tag == wanted,
        TagMatch::IgnoreCase => tag.to_lowercase() == wanted.to_lowercase(),
    }
}

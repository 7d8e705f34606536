//! Version-range matching against registry tags.
//!
//! Supported ranges: exact (`1.2.3`, optional leading `v`), wildcard
//! (`1.2.*`), caret (`^1.2.0`) and tilde (`~1.2.3`). Anything else falls back
//! to exact comparison of the normalized string.
//!
//! The caret range is looser than SemVer: it accepts every version with the
//! same major whose minor is not lower than the range's minor, ignoring the
//! patch component and without special-casing `0.x`. Deployed intents rely
//! on this, so it is kept as is.

use std::cmp::Ordering;

use semver::Version;

/// True when a tag should be treated as a range and resolved against the registry.
pub fn looks_like_range(tag: &str) -> bool {
    let rest = tag.strip_prefix(['~', '^', '>', '=', '<']).unwrap_or(tag);
    rest.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// A tag of the form `[v]X.Y.Z[suffix]`, e.g. `v1.2.3-rc.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate<'a> {
    tag: &'a str,
    version: Version,
    suffix: &'a str,
}

impl<'a> Candidate<'a> {
    fn parse(tag: &'a str) -> Option<Self> {
        let trimmed = strip_v(tag);
        let (major, rest) = take_number(trimmed)?;
        let rest = rest.strip_prefix('.')?;
        let (minor, rest) = take_number(rest)?;
        let rest = rest.strip_prefix('.')?;
        let (patch, suffix) = take_number(rest)?;
        Some(Self {
            tag,
            version: Version::new(major, minor, patch),
            suffix,
        })
    }

    /// Higher version wins; on a tie, a plain `X.Y.Z` beats one with a suffix.
    fn rank(&self, other: &Self) -> Ordering {
        self.version.cmp(&other.version).then_with(|| {
            match (self.suffix.is_empty(), other.suffix.is_empty()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => other.tag.cmp(self.tag),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Range {
    Exact(String),
    Wildcard(Vec<Option<u64>>),
    Caret { major: u64, minor: u64 },
    Tilde { major: u64, minor: u64 },
}

impl Range {
    fn parse(range: &str) -> Self {
        if let Some(rest) = range.strip_prefix('^')
            && let Some((major, minor)) = major_minor(rest)
        {
            return Range::Caret { major, minor };
        }
        if let Some(rest) = range.strip_prefix('~')
            && let Some((major, minor)) = major_minor(rest)
        {
            return Range::Tilde { major, minor };
        }
        let normalized = strip_v(range);
        if normalized.contains('*') {
            let slots: Option<Vec<Option<u64>>> = normalized
                .split('.')
                .map(|slot| match slot {
                    "*" => Some(None),
                    digits => digits.parse::<u64>().ok().map(Some),
                })
                .collect();
            if let Some(slots) = slots {
                return Range::Wildcard(slots);
            }
        }
        Range::Exact(normalized.to_string())
    }

    fn matches(&self, candidate: &Candidate<'_>) -> bool {
        let version = &candidate.version;
        match self {
            Range::Exact(expected) => strip_v(candidate.tag) == expected,
            Range::Wildcard(slots) => {
                let actual = [version.major, version.minor, version.patch];
                slots.len() == actual.len()
                    && candidate.suffix.is_empty()
                    && slots
                        .iter()
                        .zip(actual)
                        .all(|(slot, value)| slot.is_none_or(|expected| expected == value))
            }
            Range::Caret { major, minor } => version.major == *major && version.minor >= *minor,
            Range::Tilde { major, minor } => version.major == *major && version.minor == *minor,
        }
    }
}

/// Picks the highest tag satisfying `range`, or `None` when nothing matches.
pub fn best_match<'a, I>(range: &str, tags: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let range = Range::parse(range);
    tags.into_iter()
        .filter_map(Candidate::parse)
        .filter(|candidate| range.matches(candidate))
        .max_by(|a, b| a.rank(b))
        .map(|candidate| candidate.tag)
}

/// Every tag satisfying `range`, highest first.
pub fn matching_tags<'a, I>(range: &str, tags: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let range = Range::parse(range);
    let mut matched: Vec<Candidate<'a>> = tags
        .into_iter()
        .filter_map(Candidate::parse)
        .filter(|candidate| range.matches(candidate))
        .collect();
    matched.sort_by(|a, b| b.rank(a));
    matched.into_iter().map(|candidate| candidate.tag).collect()
}

fn strip_v(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

fn take_number(input: &str) -> Option<(u64, &str)> {
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if end == 0 {
        return None;
    }
    let value = input[..end].parse().ok()?;
    Some((value, &input[end..]))
}

/// `X`, `X.Y` or `X.Y.Z` (missing parts are 0); the patch is accepted but unused.
fn major_minor(range: &str) -> Option<(u64, u64)> {
    let normalized = strip_v(range);
    let mut parts = normalized.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    if let Some(patch) = parts.next() {
        take_number(patch)?;
    }
    Some((major, minor))
}

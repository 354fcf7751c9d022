use std::fmt;

use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("unparseable timestamp: {0}")]
    Unparseable(String),
}

/// A whole-second UTC instant. The upstream API mixes fractional-second
/// precision and trailing-zone markers across server builds, so two stamps
/// count as the same moment iff they land on the same whole second after
/// normalization; sub-second differences are synchronization-insignificant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalTimestamp(i64);

impl CanonicalTimestamp {
    /// Normalizes a raw API timestamp: fractional seconds are truncated (not
    /// rounded), duplicated trailing zone markers are collapsed, and stamps
    /// without any zone marker are read as UTC.
    pub fn parse(raw: &str) -> Result<Self, TimestampError> {
        let cleaned = scrub(raw);
        let parsed = OffsetDateTime::parse(&cleaned, &Rfc3339)
            .map_err(|_| TimestampError::Unparseable(raw.to_string()))?;
        Ok(Self(parsed.unix_timestamp()))
    }

    pub fn from_unix(secs: i64) -> Self {
        Self(secs)
    }

    pub fn unix(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CanonicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = OffsetDateTime::from_unix_timestamp(self.0)
            .ok()
            .and_then(|dt| dt.format(&Rfc3339).ok());
        match formatted {
            Some(text) => f.write_str(&text),
            None => write!(f, "@{}", self.0),
        }
    }
}

/// Splits a phenomenonTime value that may be a point or a `start/end`
/// interval into its start and optional end.
pub fn phenomenon_interval(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('/') {
        Some((start, end)) => (start, Some(end)),
        None => (raw, None),
    }
}

fn scrub(raw: &str) -> String {
    let mut cleaned = strip_fraction(strip_duplicate_zone(raw.trim()));
    if !has_zone(&cleaned) {
        cleaned.push('Z');
    }
    cleaned
}

fn strip_duplicate_zone(value: &str) -> &str {
    let mut value = value;
    while let Some(rest) = value.strip_suffix('Z') {
        if rest.ends_with('Z') || ends_with_offset(rest) {
            value = rest;
        } else {
            break;
        }
    }
    value
}

fn strip_fraction(value: &str) -> String {
    let Some(t_pos) = value.find('T') else {
        return value.to_string();
    };
    let Some(dot) = value[t_pos..].find('.').map(|at| t_pos + at) else {
        return value.to_string();
    };
    let digits = value[dot + 1..]
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    format!("{}{}", &value[..dot], &value[dot + 1 + digits..])
}

fn has_zone(value: &str) -> bool {
    value.ends_with('Z') || ends_with_offset(value)
}

fn ends_with_offset(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() < 6 {
        return false;
    }
    let tail = &bytes[bytes.len() - 6..];
    (tail[0] == b'+' || tail[0] == b'-')
        && tail[1].is_ascii_digit()
        && tail[2].is_ascii_digit()
        && tail[3] == b':'
        && tail[4].is_ascii_digit()
        && tail[5].is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractional_seconds_truncate_instead_of_rounding() {
        let sharp = CanonicalTimestamp::parse("2024-01-01T00:00:00Z").unwrap();
        let late = CanonicalTimestamp::parse("2024-01-01T00:00:00.999999Z").unwrap();
        assert_eq!(sharp, late);
    }

    #[test]
    fn naive_stamps_are_read_as_utc() {
        let naive = CanonicalTimestamp::parse("2024-01-01T00:00:00.500000").unwrap();
        let explicit = CanonicalTimestamp::parse("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(naive, explicit);
    }

    #[test]
    fn duplicated_zone_markers_collapse() {
        let doubled = CanonicalTimestamp::parse("2024-01-01T00:00:00.123ZZ").unwrap();
        let offset_then_z = CanonicalTimestamp::parse("2024-01-01T02:00:00+02:00Z").unwrap();
        let plain = CanonicalTimestamp::parse("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(doubled, plain);
        assert_eq!(offset_then_z, plain);
    }

    #[test]
    fn offsets_convert_to_utc() {
        let offset = CanonicalTimestamp::parse("2024-01-01T05:30:00+05:30").unwrap();
        let utc = CanonicalTimestamp::parse("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(offset, utc);
    }

    #[test]
    fn ordering_follows_the_clock() {
        let earlier = CanonicalTimestamp::parse("2024-01-01T00:00:00Z").unwrap();
        let later = CanonicalTimestamp::parse("2024-01-01T00:00:01.100Z").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CanonicalTimestamp::parse("not a timestamp").is_err());
        assert!(CanonicalTimestamp::parse("").is_err());
    }

    #[test]
    fn display_is_whole_second_rfc3339() {
        let ts = CanonicalTimestamp::parse("2024-01-01T00:00:00.750Z").unwrap();
        assert_eq!(ts.to_string(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn intervals_split_into_start_and_end() {
        let (start, end) = phenomenon_interval("2024-01-01T00:00:00Z/2024-01-01T00:10:00Z");
        assert_eq!(start, "2024-01-01T00:00:00Z");
        assert_eq!(end, Some("2024-01-01T00:10:00Z"));

        let (start, end) = phenomenon_interval("2024-01-01T00:00:00Z");
        assert_eq!(start, "2024-01-01T00:00:00Z");
        assert_eq!(end, None);
    }
}

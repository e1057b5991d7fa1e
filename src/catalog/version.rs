//! Service versions and version range expressions
//!
//! Versions are `major[.minor[.micro]]`. A range is written `[1.0.0,2.0.0)`,
//! with `[`/`]` inclusive, `(`/`)` exclusive and `INFINITY` as an open upper
//! bound. A bare version `1.2.0` means "that version or anything newer".

use std::fmt;
use std::str::FromStr;

pub const INFINITY: &str = "INFINITY";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version {0:?}")]
    InvalidVersion(String),

    #[error("invalid version range {0:?}: {1}")]
    InvalidRange(String, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    major: u32,
    minor: u32,
    micro: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self { major, minor, micro }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion(s.to_string());
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for segment in trimmed.split('.') {
            if count == 3 || segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[count] = segment.parse().map_err(|_| invalid())?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// A version interval. `end == None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionExpression {
    start: Version,
    start_inclusive: bool,
    end: Option<Version>,
    end_inclusive: bool,
}

impl VersionExpression {
    /// Every version at or above `0.0.0`.
    pub fn any() -> Self {
        Self::at_least(Version::new(0, 0, 0))
    }

    pub fn at_least(start: Version) -> Self {
        Self {
            start,
            start_inclusive: true,
            end: None,
            end_inclusive: false,
        }
    }

    pub fn contains(&self, version: &Version) -> bool {
        let above = if self.start_inclusive {
            *version >= self.start
        } else {
            *version > self.start
        };
        let below = match &self.end {
            None => true,
            Some(end) if self.end_inclusive => version <= end,
            Some(end) => version < end,
        };
        above && below
    }
}

impl FromStr for VersionExpression {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let range_err = |why| VersionError::InvalidRange(s.to_string(), why);

        let start_inclusive = match text.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Ok(Self::at_least(text.parse()?)),
        };
        let end_inclusive = match text.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(range_err("missing closing bracket")),
        };
        if text.len() < 2 {
            return Err(range_err("empty range"));
        }

        let inner = &text[1..text.len() - 1];
        let (low, high) = inner
            .split_once(',')
            .ok_or_else(|| range_err("expected two comma separated bounds"))?;
        if high.contains(',') {
            return Err(range_err("expected two comma separated bounds"));
        }

        let start: Version = low.trim().parse()?;
        let end = match high.trim() {
            INFINITY => {
                if end_inclusive {
                    return Err(range_err("INFINITY cannot be an inclusive bound"));
                }
                None
            }
            bound => Some(bound.parse::<Version>()?),
        };

        if let Some(end) = &end {
            if *end < start || (*end == start && !(start_inclusive && end_inclusive)) {
                return Err(range_err("upper bound is below lower bound"));
            }
        }

        Ok(Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        })
    }
}

impl fmt::Display for VersionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.start_inclusive { '[' } else { '(' };
        match &self.end {
            None => write!(f, "{}{},{})", open, self.start, INFINITY),
            Some(end) => {
                let close = if self.end_inclusive { ']' } else { ')' };
                write!(f, "{}{},{}{}", open, self.start, end, close)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_short_versions_are_padded() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2").to_string(), "1.2.0");
    }

    #[test]
    fn test_invalid_versions() {
        assert!("".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("1..2".parse::<Version>().is_err());
        assert!("1.x".parse::<Version>().is_err());
    }

    #[test]
    fn test_bare_version_is_open_range() {
        let expr: VersionExpression = "0.0.0".parse().unwrap();
        assert_eq!(expr.to_string(), "[0.0.0,INFINITY)");
        assert_eq!(expr, VersionExpression::any());
        assert!(expr.contains(&v("42.1")));
    }

    #[test]
    fn test_bounded_range_membership() {
        let expr: VersionExpression = "[1.0.0,2.0.0)".parse().unwrap();
        assert!(expr.contains(&v("1.0.0")));
        assert!(expr.contains(&v("1.9.9")));
        assert!(!expr.contains(&v("2.0.0")));
        assert!(!expr.contains(&v("0.9")));

        let exclusive_start: VersionExpression = "(1.0.0,2.0.0]".parse().unwrap();
        assert!(!exclusive_start.contains(&v("1.0.0")));
        assert!(exclusive_start.contains(&v("2.0.0")));
    }

    #[test]
    fn test_malformed_ranges() {
        for bad in ["[1.0.0,2.0.0", "[1.0.0]", "[2.0.0,1.0.0)", "[1.0.0,INFINITY]", "[a,b)", "[1,2,3)"] {
            assert!(bad.parse::<VersionExpression>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_exact_version_range() {
        let expr: VersionExpression = "[1.2.0,1.2.0]".parse().unwrap();
        assert!(expr.contains(&v("1.2.0")));
        assert!(!expr.contains(&v("1.2.1")));
        assert_eq!(expr.to_string(), "[1.2.0,1.2.0]");
    }
}

use std::fmt;
use std::str::FromStr;

use crate::RegistryError;

/// A (major, minor) version. `major` groups compatible releases, `minor`
/// orders releases within a major. Ordering is lexicographic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Result<Version, RegistryError> {
        if major < 1 {
            return Err(RegistryError::Invalid(format!(
                "version major must be at least 1, got {}",
                major
            )));
        }
        Ok(Version { major, minor })
    }

    /// Parses the major component of a service version string such as `"2"`,
    /// `"v2"` or `"2.1.0"`.
    pub fn parse_major(s: &str) -> Option<u32> {
        s.parse::<Version>().ok().map(|v| v.major)
    }

    /// Whether a client at `self` lies within the optional bounds. With no
    /// bounds at all, only `exact` is accepted.
    pub fn within(&self, min: Option<Version>, max: Option<Version>, exact: Version) -> bool {
        if min.is_none() && max.is_none() {
            return *self == exact;
        }
        min.map_or(true, |min| *self >= min) && max.map_or(true, |max| *self <= max)
    }
}

impl FromStr for Version {
    type Err = RegistryError;

    /// Accepts `1`, `v1`, `1.2` and full semver such as `1.2.3-rc.1`; the
    /// patch and any pre-release or build suffix are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::Invalid(format!("malformed version {:?}", s));
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = trimmed
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u32>().map_err(|_| invalid())?,
            None => 0,
        };
        if let Some(patch) = parts.next() {
            patch.parse::<u32>().map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Version::new(major, minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

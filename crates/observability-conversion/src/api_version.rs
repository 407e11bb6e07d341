//! Kubernetes API versions like `observability.io/v1beta1`.
//!
//! A [`Version`] consists of a major version and an optional [`Level`]. They
//! are ordered the way Kubernetes orders them: `v1alpha1 < v1alpha2 <
//! v1beta1 < v1 < v2alpha1`.
use std::{cmp::Ordering, fmt, num::ParseIntError, str::FromStr, sync::LazyLock};

use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

static LEVEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<identifier>[a-z]+)(?P<version>[1-9][0-9]*)$")
        .expect("failed to compile version level regex")
});

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v(?P<major>[1-9][0-9]*)(?P<level>[a-z]+[0-9]+)?$")
        .expect("failed to compile Kubernetes version regex")
});

static GROUP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$")
        .expect("failed to compile API group regex")
});

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParseLevelError {
    #[snafu(display("invalid level format, expected beta<VERSION>/alpha<VERSION>"))]
    InvalidLevelFormat,

    #[snafu(display("failed to parse level version"))]
    ParseLevelVersion { source: ParseIntError },

    #[snafu(display("unknown level identifier {identifier:?}"))]
    UnknownIdentifier { identifier: String },
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParseVersionError {
    #[snafu(display("invalid version format, expected v<MAJOR>[(alpha|beta)<LEVEL>]"))]
    InvalidFormat,

    #[snafu(display("failed to parse major version"))]
    ParseMajorVersion { source: ParseIntError },

    #[snafu(display("failed to parse version level"))]
    ParseLevel { source: ParseLevelError },
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParseApiVersionError {
    #[snafu(display("invalid version {version:?}"))]
    InvalidVersion {
        source: ParseVersionError,
        version: String,
    },

    #[snafu(display("group {group:?} must be a valid DNS subdomain"))]
    InvalidGroup { group: String },
}

/// The stability level of a pre-release version.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Level {
    /// `beta<VERSION>`
    Beta(u64),

    /// `alpha<VERSION>`
    Alpha(u64),
}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let captures = LEVEL_REGEX.captures(input).context(InvalidLevelFormatSnafu)?;
        let (identifier, version) = (&captures["identifier"], &captures["version"]);
        let version = version.parse::<u64>().context(ParseLevelVersionSnafu)?;

        match identifier {
            "alpha" => Ok(Self::Alpha(version)),
            "beta" => Ok(Self::Beta(version)),
            _ => UnknownIdentifierSnafu { identifier }.fail(),
        }
    }
}

impl PartialOrd for Level {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Level {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Beta(lhs), Self::Beta(rhs)) | (Self::Alpha(lhs), Self::Alpha(rhs)) => lhs.cmp(rhs),
            (Self::Beta(_), Self::Alpha(_)) => Ordering::Greater,
            (Self::Alpha(_), Self::Beta(_)) => Ordering::Less,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beta(beta) => write!(f, "beta{beta}"),
            Self::Alpha(alpha) => write!(f, "alpha{alpha}"),
        }
    }
}

/// A bare Kubernetes version like `v1`, `v1beta1` or `v2alpha3`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub level: Option<Level>,
}

impl Version {
    pub fn new(major: u64, level: Option<Level>) -> Self {
        Self { major, level }
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let captures = VERSION_REGEX.captures(input).context(InvalidFormatSnafu)?;
        let major = captures["major"].parse::<u64>().context(ParseMajorVersionSnafu)?;
        let level = captures
            .name("level")
            .map(|level| level.as_str().parse::<Level>())
            .transpose()
            .context(ParseLevelSnafu)?;

        Ok(Self { major, level })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| match (&self.level, &other.level) {
                (Some(lhs), Some(rhs)) => lhs.cmp(rhs),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.level {
            Some(level) => write!(f, "v{}{level}", self.major),
            None => write!(f, "v{}", self.major),
        }
    }
}

/// Validates a bare Kubernetes version like `v1`, `v1beta1` or `v2alpha3`.
pub fn validate_version(version: &str) -> Result<Version, ParseApiVersionError> {
    version
        .parse()
        .context(InvalidVersionSnafu { version })
}

/// A Kubernetes API version with the `(<GROUP>/)<VERSION>` format, for example
/// `observability.io/v1beta1`.
///
/// The version is kept as written, because it also names the registered
/// schemas. Parsed API versions always carry a valid [`Version`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ApiVersion {
    pub group: Option<String>,
    pub version: String,
}

impl ApiVersion {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            version: version.into(),
        }
    }

    /// Returns a copy of this API version in the same group but with a
    /// different version.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            group: self.group.clone(),
            version: version.into(),
        }
    }

    /// Returns the parsed version, or `None` if it is not a valid Kubernetes
    /// version.
    pub fn parsed_version(&self) -> Option<Version> {
        self.version.parse().ok()
    }
}

impl FromStr for ApiVersion {
    type Err = ParseApiVersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (group, version) = match input.split_once('/') {
            Some((group, version)) => {
                ensure!(GROUP_REGEX.is_match(group), InvalidGroupSnafu { group });
                (Some(group.to_owned()), version)
            }
            None => (None, input),
        };

        validate_version(version)?;

        Ok(Self {
            group,
            version: version.to_owned(),
        })
    }
}

/// API versions of different groups are not comparable.
impl PartialOrd for ApiVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.group != other.group {
            return None;
        }
        self.parsed_version()?.partial_cmp(&other.parsed_version()?)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{group}/{}", self.version),
            None => f.write_str(&self.version),
        }
    }
}

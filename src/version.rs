//! Toolchain version probing and capability gating.

use crate::error::DisplayError;
use crate::process::Channel;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Maximum time a freshly spawned process gets to answer the version probe.
pub const PROBE_TIMEOUT_SECS: u64 = 30;

/// Oldest toolchain the display protocol works with.
pub const MINIMUM_VERSION: Version = Version::new(3, 4, 0);

const PROBE_ARGUMENT: &str = "-version";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("valid version regex"));

/// Semantic version triple. Pre-release and build suffixes are not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Find the first `major.minor.patch` token in `text`.
    pub fn find_in(text: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(text)?;
        let part = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
        Some(Self::new(part(1)?, part(2)?, part(3)?))
    }

    pub fn at_least(&self, other: Version) -> bool {
        *self >= other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = DisplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::find_in(s.trim())
            .ok_or_else(|| DisplayError::Probe(format!("no version in {:?}", s.trim())))
    }
}

/// Feature gates derived from the probed toolchain version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// JSON-RPC display protocol.
    pub json_rpc: bool,
    /// File contents may be passed over stdin instead of read from disk.
    pub display_stdin: bool,
}

impl Capabilities {
    pub fn for_version(version: Version) -> Self {
        Self {
            json_rpc: version.at_least(Version::new(4, 0, 0)),
            display_stdin: version.at_least(Version::new(3, 4, 0)),
        }
    }
}

/// Ask a freshly spawned process for its version.
///
/// The version is looked up in the response body first and then in the print
/// lines, since some toolchains print it to stdout while in server mode.
pub async fn probe(channel: &mut dyn Channel) -> Result<Version, DisplayError> {
    let arguments = [PROBE_ARGUMENT.to_string()];
    let call = channel.call(&arguments, None);
    let response = match tokio::time::timeout(Duration::from_secs(PROBE_TIMEOUT_SECS), call).await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(DisplayError::Probe(e.to_string())),
        Err(_) => {
            return Err(DisplayError::Probe(format!(
                "no answer after {PROBE_TIMEOUT_SECS} seconds"
            )))
        }
    };
    debug!(output = %response.output.trim(), "Version probe answered");

    let version = Version::find_in(&response.output)
        .or_else(|| response.prints.iter().find_map(|p| Version::find_in(p)));
    match version {
        Some(v) => Ok(v),
        None if response.has_error => Err(DisplayError::Probe(format!(
            "toolchain reported an error: {}",
            response.output.trim()
        ))),
        None => Err(DisplayError::Probe(format!(
            "no version in response {:?}",
            response.output.trim()
        ))),
    }
}

/// Reject toolchains older than [`MINIMUM_VERSION`].
pub fn check_supported(version: Version) -> Result<Version, DisplayError> {
    if version < MINIMUM_VERSION {
        return Err(DisplayError::UnsupportedVersion {
            found: version,
            required: MINIMUM_VERSION,
        });
    }
    Ok(version)
}

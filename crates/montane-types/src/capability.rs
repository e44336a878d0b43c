//! Capability-based security tokens.
//!
//! Montane uses capability-based security: a guest can only reach host
//! functionality that the caller has explicitly granted. Grants are fixed for
//! the duration of a call and enforced when the import table is assembled:
//! a capability that was never granted has no imports to call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A permission token granted to a guest for one call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Capability {
    /// Read the host wall clock.
    Time,
    /// Draw from the host entropy source.
    Random,
    /// Emit log lines through the host logger.
    Log,
    /// Read files (declared; contributes no imports yet).
    FilesystemRead,
    /// Write files. Implies [`Capability::FilesystemRead`].
    FilesystemWrite,
    /// Open network connections (declared; contributes no imports yet).
    Network,
    /// Call a specific named host function registered by the embedder.
    HostFunction(String),
}

/// Coarse risk classification of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

impl Capability {
    /// Fixed risk class of this token.
    pub fn risk_level(&self) -> RiskLevel {
        match self {
            Capability::Time | Capability::Random | Capability::Log => RiskLevel::Low,
            Capability::FilesystemRead => RiskLevel::Medium,
            Capability::HostFunction(_) => RiskLevel::Medium,
            Capability::FilesystemWrite | Capability::Network => RiskLevel::High,
        }
    }

    /// Human description of what the token permits.
    pub fn describe(&self) -> String {
        match self {
            Capability::Time => "read the host wall clock".to_string(),
            Capability::Random => "draw random numbers from the host".to_string(),
            Capability::Log => "emit log lines through the host logger".to_string(),
            Capability::FilesystemRead => "read files visible to the host".to_string(),
            Capability::FilesystemWrite => {
                "write files visible to the host (implies read)".to_string()
            }
            Capability::Network => "open outbound network connections".to_string(),
            Capability::HostFunction(name) => format!("call the host function '{name}'"),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Time => write!(f, "time"),
            Capability::Random => write!(f, "random"),
            Capability::Log => write!(f, "log"),
            Capability::FilesystemRead => write!(f, "filesystem_read"),
            Capability::FilesystemWrite => write!(f, "filesystem_write"),
            Capability::Network => write!(f, "network"),
            Capability::HostFunction(name) => write!(f, "host_function:{name}"),
        }
    }
}

/// Error for a capability token that is not part of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown capability token: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(Capability::Time),
            "random" => Ok(Capability::Random),
            "log" => Ok(Capability::Log),
            "filesystem_read" => Ok(Capability::FilesystemRead),
            "filesystem_write" => Ok(Capability::FilesystemWrite),
            "network" => Ok(Capability::Network),
            other => match other.strip_prefix("host_function:") {
                Some(name) if !name.is_empty() => {
                    Ok(Capability::HostFunction(name.to_string()))
                }
                _ => Err(UnknownCapability(other.to_string())),
            },
        }
    }
}

/// Risk class for a textual token, without requiring it to parse.
///
/// Unknown tokens are classified high by conservative default.
pub fn risk_of(token: &str) -> RiskLevel {
    token
        .parse::<Capability>()
        .map(|cap| cap.risk_level())
        .unwrap_or(RiskLevel::High)
}

/// An ordered set of capability grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// The empty grant set (full attenuation).
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a grant. Duplicate grants collapse to one.
    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Apply capability implications: `filesystem_write` grants
    /// `filesystem_read` as well. All other tokens expand to themselves.
    pub fn expand(&self) -> CapabilitySet {
        let mut expanded = self.0.clone();
        if expanded.contains(&Capability::FilesystemWrite) {
            expanded.insert(Capability::FilesystemRead);
        }
        CapabilitySet(expanded)
    }

    /// Whether `requested` is covered by this grant set, checked against the
    /// expanded set.
    pub fn includes(&self, requested: &Capability) -> bool {
        self.expand().contains(requested)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

impl Extend<Capability> for CapabilitySet {
    fn extend<I: IntoIterator<Item = Capability>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

/// Error carrying every token in a request that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid capability tokens: {}", tokens.join(", "))]
pub struct InvalidTokens {
    pub tokens: Vec<String>,
}

/// Parse a list of textual tokens into a capability set.
///
/// All tokens are checked; the error lists every invalid one rather than
/// stopping at the first.
pub fn parse_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<CapabilitySet, InvalidTokens> {
    let mut set = CapabilitySet::new();
    let mut invalid = Vec::new();
    for token in tokens {
        match token.as_ref().parse::<Capability>() {
            Ok(cap) => {
                set.insert(cap);
            }
            Err(UnknownCapability(tok)) => invalid.push(tok),
        }
    }
    if invalid.is_empty() {
        Ok(set)
    } else {
        Err(InvalidTokens { tokens: invalid })
    }
}

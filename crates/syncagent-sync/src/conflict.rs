//! Spec conflict resolution
//!
//! Compares the upstream and downstream spec hashes against the hash recorded
//! at the last successful sync and decides which side's spec survives.

use syncagent_common::Error;

/// What to do about downstream-only spec edits (configured per binding)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpecDriftPolicy {
    /// Overwrite downstream edits with the upstream spec
    #[default]
    UpstreamWins,
    /// Leave downstream edits in place and report them upstream
    PreserveDownstream,
}

impl std::str::FromStr for SpecDriftPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upstream-wins" => Ok(Self::UpstreamWins),
            "preserve-downstream" => Ok(Self::PreserveDownstream),
            _ => Err(Error::config(format!(
                "invalid spec drift policy: {s}, expected one of: upstream-wins, preserve-downstream"
            ))),
        }
    }
}

impl std::fmt::Display for SpecDriftPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamWins => write!(f, "upstream-wins"),
            Self::PreserveDownstream => write!(f, "preserve-downstream"),
        }
    }
}

/// Why the upstream spec is written downstream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyReason {
    /// Upstream changed, downstream untouched
    UpstreamChanged,
    /// Downstream was edited, upstream is authoritative
    DownstreamDrift,
    /// No sync has been recorded for the existing mirror
    Unrecorded,
}

/// Outcome of comparing both sides
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecResolution {
    /// Both sides match the recorded hash
    InSync,
    /// Write the upstream spec downstream
    ApplyUpstream(ApplyReason),
    /// Contents already match but the recorded hash is stale
    RecordOnly,
    /// Downstream drift is kept by policy
    KeepDownstream,
    /// Both sides changed independently; write nothing
    Hold,
}

/// Decide the spec outcome from the three hashes
pub fn resolve_spec(
    upstream: &str,
    downstream: &str,
    last_synced: Option<&str>,
    policy: SpecDriftPolicy,
) -> SpecResolution {
    let Some(last) = last_synced else {
        return if upstream == downstream {
            SpecResolution::RecordOnly
        } else {
            SpecResolution::ApplyUpstream(ApplyReason::Unrecorded)
        };
    };

    if upstream == downstream {
        return if upstream == last {
            SpecResolution::InSync
        } else {
            SpecResolution::RecordOnly
        };
    }

    match (upstream == last, downstream == last) {
        (false, true) => SpecResolution::ApplyUpstream(ApplyReason::UpstreamChanged),
        (true, false) => match policy {
            SpecDriftPolicy::UpstreamWins => {
                SpecResolution::ApplyUpstream(ApplyReason::DownstreamDrift)
            }
            SpecDriftPolicy::PreserveDownstream => SpecResolution::KeepDownstream,
        },
        (false, false) => SpecResolution::Hold,
        // upstream == last == downstream is handled above
        (true, true) => SpecResolution::InSync,
    }
}

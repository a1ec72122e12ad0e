//! Migration phases and the phase resolver.
//!
//! The phase is process-wide configuration decided once at startup. A single
//! call may override it (verification tooling, canaries) without touching
//! the configured value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::MigrationError;

/// Operator-selected migration stage controlling read/write routing.
///
/// | Phase | Writes | Reads |
/// |---|---|---|
/// | `legacy` | legacy | legacy |
/// | `dual_write` | legacy, then target (best effort) | legacy |
/// | `dual_read` | legacy, then target (best effort) | both, legacy answers, compared |
/// | `target` | target | target |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Legacy,
    DualWrite,
    DualRead,
    Target,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 4] = [
        MigrationPhase::Legacy,
        MigrationPhase::DualWrite,
        MigrationPhase::DualRead,
        MigrationPhase::Target,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::DualWrite => "dual_write",
            Self::DualRead => "dual_read",
            Self::Target => "target",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = MigrationError;

    /// Case-insensitive; `dual-write` is accepted for `dual_write`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "legacy" => Ok(Self::Legacy),
            "dual_write" => Ok(Self::DualWrite),
            "dual_read" => Ok(Self::DualRead),
            "target" => Ok(Self::Target),
            _ => Err(MigrationError::InvalidPhase {
                value: value.to_string(),
            }),
        }
    }
}

/// Resolve the phase for one call from raw configuration text.
///
/// A valid override wins. An override that is not a phase is ignored and
/// the static value is used; if that is not a phase either the call fails
/// with [`MigrationError::InvalidPhase`].
pub fn resolve(
    static_phase: &str,
    phase_override: Option<&str>,
) -> Result<MigrationPhase, MigrationError> {
    if let Some(phase) = phase_override.and_then(parse_override) {
        return Ok(phase);
    }
    static_phase.parse()
}

fn parse_override(raw: &str) -> Option<MigrationPhase> {
    match raw.parse() {
        Ok(phase) => Some(phase),
        Err(_) => {
            log::warn!("ignoring unknown migration phase override '{}'", raw);
            None
        }
    }
}

/// Phase resolver bound to an already-validated static phase.
///
/// Immutable once built; overrides only ever affect the call they came with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseResolver {
    static_phase: MigrationPhase,
}

impl PhaseResolver {
    pub fn new(static_phase: MigrationPhase) -> Self {
        Self { static_phase }
    }

    pub fn static_phase(&self) -> MigrationPhase {
        self.static_phase
    }

    pub fn resolve(&self, phase_override: Option<&str>) -> MigrationPhase {
        phase_override
            .and_then(parse_override)
            .unwrap_or(self.static_phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_phases() {
        for phase in MigrationPhase::ALL {
            assert_eq!(phase.as_str().parse::<MigrationPhase>().unwrap(), phase);
        }
        assert_eq!(
            " Dual-Read ".parse::<MigrationPhase>().unwrap(),
            MigrationPhase::DualRead
        );
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(
            resolve("legacy", Some("target")).unwrap(),
            MigrationPhase::Target
        );
    }

    #[test]
    fn test_invalid_override_falls_back_to_static() {
        assert_eq!(
            resolve("dual_write", Some("everything")).unwrap(),
            MigrationPhase::DualWrite
        );
    }

    #[test]
    fn test_invalid_static_without_override_fails() {
        let err = resolve("mongo", None).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidPhase { ref value } if value == "mongo"));

        assert!(resolve("mongo", Some("nope")).is_err());
        assert_eq!(resolve("mongo", Some("legacy")).unwrap(), MigrationPhase::Legacy);
    }

    #[test]
    fn test_resolver_does_not_remember_overrides() {
        let resolver = PhaseResolver::new(MigrationPhase::Legacy);
        assert_eq!(resolver.resolve(Some("target")), MigrationPhase::Target);
        assert_eq!(resolver.resolve(None), MigrationPhase::Legacy);
        assert_eq!(resolver.static_phase(), MigrationPhase::Legacy);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&MigrationPhase::DualWrite).unwrap();
        assert_eq!(json, "\"dual_write\"");
    }
}

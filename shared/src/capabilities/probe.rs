use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("capacity probe unsupported on this device")]
    Unsupported,

    #[error("capacity probe lacks privilege")]
    PermissionDenied,

    #[error("capacity probe returned malformed output: {0}")]
    Malformed(String),
}

/// Best-effort discovery of an elevated per-window quota.
///
/// `Ok(None)` means the probe ran but found no override.
pub trait CapacityProbe: Send + Sync {
    fn probe(&self) -> Result<Option<u32>, ProbeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl CapacityProbe for NoProbe {
    fn probe(&self) -> Result<Option<u32>, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

/// Probe with a preset answer, for hosts that learn the quota out of band.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub Option<u32>);

impl CapacityProbe for FixedProbe {
    fn probe(&self) -> Result<Option<u32>, ProbeError> {
        Ok(self.0)
    }
}

/// Parse the raw text a settings query prints (e.g. `"100\n"`, `"null"`).
pub fn parse_probe_output(raw: &str) -> Result<Option<u32>, ProbeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    trimmed
        .parse::<u32>()
        .map(Some)
        .map_err(|_| ProbeError::Malformed(trimmed.chars().take(32).collect()))
}

/// Pick the quota ceiling: the probed value only when it is strictly above
/// `default` and no larger than `max`, otherwise `default`.
pub fn resolve_quota_ceiling(probe: &dyn CapacityProbe, default: u32, max: u32) -> u32 {
    match probe.probe() {
        Ok(Some(value)) if value > default && value <= max => {
            info!(quota_ceiling = value, "Using probed quota ceiling");
            value
        }
        Ok(Some(value)) => {
            warn!(
                probed = value,
                default, "Ignoring probed quota ceiling outside accepted range"
            );
            default
        }
        Ok(None) => default,
        Err(e) => {
            info!(error = %e, default, "Capacity probe unavailable, using default ceiling");
            default
        }
    }
}

//! Analysis stages over the cleaned table and the long panel.

pub mod agreement;
pub mod clustering;
pub mod context;
pub mod echo;
pub mod moderation;
pub mod profiles;
pub mod residualize;
pub mod robustness;
pub mod structure;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// Outcome of one model fit inside a stage that tolerates small samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FitStatus {
    Ok,
    Skipped(String),
}

impl FitStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FitStatus::Ok)
    }

    pub fn label(&self) -> String {
        match self {
            FitStatus::Ok => "ok".to_string(),
            FitStatus::Skipped(reason) => format!("skipped: {reason}"),
        }
    }
}

/// Turn an underdetermined fit into a logged skip; every other error
/// propagates.
pub(crate) fn skip_underdetermined<T>(result: Result<T>, unit: &str) -> Result<std::result::Result<T, FitStatus>> {
    match result {
        Ok(v) => Ok(Ok(v)),
        Err(e) if e.is_underdetermined() => {
            warn!(unit = %unit, error = %e, "fit skipped");
            Ok(Err(FitStatus::Skipped(e.to_string())))
        }
        Err(e) => Err(e),
    }
}

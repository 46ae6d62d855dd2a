use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of the individual benchmark stages.
///
/// Stage functions surface these and the orchestrator folds them into the
/// recorded [`crate::results::TargetResult`]; only persistence problems end a
/// run early.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("build failed for service {service}: {reason}")]
    BuildFailure { service: String, reason: String },

    #[error("server on port {port} did not become ready after {attempts} attempts")]
    ReadinessTimeout { port: u16, attempts: u32 },

    #[error("unparseable stats sample '{line}': {reason}")]
    SampleParse { line: String, reason: &'static str },

    #[error("load generator failed: {0}")]
    LoadGenerator(String),

    #[error("audit failed: {0}")]
    Audit(String),

    #[error("unable to read results at {}: {reason}", path.display())]
    ResultsUnreadable { path: PathBuf, reason: String },
}

impl BenchError {
    /// Short marker stored in a target's result when the stage aborts it.
    pub fn marker(&self) -> String {
        match self {
            Self::BuildFailure { .. } => "build failed".to_string(),
            Self::ReadinessTimeout { .. } => "server did not become ready".to_string(),
            other => other.to_string(),
        }
    }
}

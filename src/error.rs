//! Top-level error type for the Wave CLI
//!
//! Wraps the specific error types from each module behind one enum so the
//! CLI entry point can render a message and map it to the documented exit
//! codes: 0 success, 1 pipeline/contract failure, 2 configuration invalid,
//! 130 interrupted.

use thiserror::Error;

/// Exit code for pipeline or contract failure
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for invalid configuration (manifest, pipeline, DAG)
pub const EXIT_CONFIG: i32 = 2;
/// Exit code after operator interruption
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Error, Debug)]
pub enum WaveError {
    #[error("{0}")]
    Manifest(#[from] crate::manifest::ManifestError),

    #[error("{0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("{0}")]
    Dag(#[from] crate::dag::DagError),

    #[error("{0}")]
    Meta(#[from] crate::router::MetaError),

    #[error("{0}")]
    Exec(#[from] crate::executor::ExecError),

    #[error("{0}")]
    State(#[from] crate::state::StateError),

    #[error("{0}")]
    Security(#[from] crate::security::SecurityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WaveError {
    pub fn other(msg: impl Into<String>) -> Self {
        WaveError::Other(msg.into())
    }

    /// Map to the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            WaveError::Manifest(_)
            | WaveError::Pipeline(_)
            | WaveError::Dag(_)
            | WaveError::Meta(_) => EXIT_CONFIG,
            WaveError::Exec(e) => match e {
                crate::executor::ExecError::Dag(_) | crate::executor::ExecError::Security(_) => {
                    EXIT_CONFIG
                }
                _ => EXIT_FAILURE,
            },
            WaveError::Security(_) => EXIT_CONFIG,
            WaveError::State(_) | WaveError::Io(_) | WaveError::Other(_) => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagError;

    #[test]
    fn configuration_errors_exit_2() {
        let err = WaveError::Dag(DagError::DuplicateStep("a".into()));
        assert_eq!(err.exit_code(), EXIT_CONFIG);

        let err = WaveError::Pipeline(crate::pipeline::PipelineError::WrongKind("X".into()));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn runtime_errors_exit_1() {
        let err = WaveError::other("adapter exploded");
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn exec_wrapped_dag_error_still_exits_2() {
        let err = WaveError::Exec(crate::executor::ExecError::Dag(DagError::DuplicateStep(
            "a".into(),
        )));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }
}

use thiserror::Error;

/// Main error type for the Autopolicy system
#[derive(Error, Debug)]
pub enum ApError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ApError {
    /// True when an optimizer reported convergence. Callers treat this as a
    /// normal end of search rather than a failure.
    pub fn is_search_exhausted(&self) -> bool {
        matches!(self, ApError::Optimizer(OptimizerError::SearchExhausted { .. }))
    }
}

/// Errors mapping between search points and runtime configs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Point has {actual} dimensions, knob space has {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("Config is missing knob: {knob}")]
    MissingKnob { knob: String },

    #[error("Config has unknown knob: {knob}")]
    UnknownKnob { knob: String },

    #[error("Value {value} out of range for knob {knob} (cardinality {cardinality})")]
    OutOfRange {
        knob: String,
        value: usize,
        cardinality: usize,
    },

    #[error("Unknown label {label:?} for knob {knob}")]
    UnknownLabel { knob: String, label: String },
}

/// Optimizer adapter errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("Search exhausted after {generations} generations: {reason}")]
    SearchExhausted { generations: usize, reason: String },

    #[error("Registered point does not match the pending suggestion: {message}")]
    UnexpectedRegistration { message: String },

    #[error("Generation {generation} still awaits {outstanding} registrations")]
    PendingGeneration { generation: usize, outstanding: usize },

    #[error("Invalid optimizer settings: {message}")]
    InvalidSettings { message: String },

    #[error("Surrogate model failure: {message}")]
    Surrogate { message: String },
}

/// Exploration ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger file {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error("Ledger {path} is already marked complete")]
    AlreadyComplete { path: String },

    #[error("Persisting ledger {path} failed: {message}")]
    PersistFailed { path: String, message: String },
}

/// Job queue reconciliation errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Schema mismatch in {file}: {message}")]
    SchemaMismatch { file: String, message: String },

    #[error("Invalid batch size: {batch_size}")]
    InvalidBatchSize { batch_size: usize },

    #[error("Batch file {path} is malformed: {message}")]
    MalformedBatch { path: String, message: String },
}

/// Evaluation boundary errors
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("No timing value could be measured for {config}: {message}")]
    MeasurementFailure { config: String, message: String },

    #[error("Process exited with status {status}: {command}")]
    ProcessFailed { command: String, status: i32 },

    #[error("Failed to launch {command}: {message}")]
    LaunchFailed { command: String, message: String },
}

/// Result type alias for Autopolicy operations
pub type ApResult<T> = Result<T, ApError>;

impl From<csv::Error> for ApError {
    fn from(error: csv::Error) -> Self {
        ApError::Csv(error.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::ApError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::ApError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ApError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CodecError::OutOfRange {
            knob: "proc_bind".to_string(),
            value: 5,
            cardinality: 2,
        };

        assert!(error.to_string().contains("proc_bind"));
        assert!(error.to_string().contains("5"));
        assert!(error.to_string().contains("cardinality 2"));
    }

    #[test]
    fn test_error_conversion() {
        let queue_error = QueueError::SchemaMismatch {
            file: "complete.csv".to_string(),
            message: "missing column".to_string(),
        };
        let ap_error: ApError = queue_error.into();

        match ap_error {
            ApError::Queue(QueueError::SchemaMismatch { .. }) => (),
            _ => panic!("Expected Queue error"),
        }
    }

    #[test]
    fn test_search_exhausted_detection() {
        let err: ApError = OptimizerError::SearchExhausted {
            generations: 12,
            reason: "tol_fun".to_string(),
        }
        .into();
        assert!(err.is_search_exhausted());

        let other: ApError = OptimizerError::InvalidSettings {
            message: "population".to_string(),
        }
        .into();
        assert!(!other.is_search_exhausted());
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "program");
    }
}

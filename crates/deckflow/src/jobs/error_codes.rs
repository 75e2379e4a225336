// crates/deckflow/src/jobs/error_codes.rs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadPayload,
    Validation,
    Processing,
    Panic,
    StageFailed,
    RetriesExhausted,
    Unknown,
}

impl ErrorCode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "BAD_PAYLOAD" => Self::BadPayload,
            "VALIDATION" => Self::Validation,
            "PROCESSING" => Self::Processing,
            "PANIC" => Self::Panic,
            "STAGE_FAILED" => Self::StageFailed,
            "RETRIES_EXHAUSTED" => Self::RetriesExhausted,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadPayload => "BAD_PAYLOAD",
            Self::Validation => "VALIDATION",
            Self::Processing => "PROCESSING",
            Self::Panic => "PANIC",
            Self::StageFailed => "STAGE_FAILED",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::from_str(code) {
        ErrorCode::BadPayload => {
            "Non-retryable. The stored job could not be decoded; fix the producer."
        }
        ErrorCode::Validation => {
            "Non-retryable. The input document was rejected; resubmit a supported file."
        }
        ErrorCode::Processing => {
            "Retried by the parent pipeline. Check the stage command output in the worker logs."
        }
        ErrorCode::Panic => {
            "Investigate crash. The stage processor panicked; the job was failed in its place."
        }
        ErrorCode::StageFailed => {
            "A sub-job failed with a non-retryable code; inspect the child job."
        }
        ErrorCode::RetriesExhausted => {
            "Sub-pipeline failed on every attempt; inspect the last child job."
        }
        ErrorCode::Unknown => {
            "Inspect status_message + logs. Decide if retryable; add mapping once understood."
        }
    }
}

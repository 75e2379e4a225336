//! Stage processing: the contract a stage's transformation implements, the
//! parameter shapes each stage reads and the checks run before processing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{Job, JobId, JobKind};

pub mod command;
pub mod worker;

pub use command::{CommandProcessor, StageCommand};
pub use worker::StageWorker;

/// Extensions the capture stage accepts.
pub const CAPTURE_EXTENSIONS: [&str; 6] = ["xlsx", "xls", "pptx", "ppt", "potx", "pot"];

/// File name given to the composed deck when it is sent to capture.
pub const COMPOSED_DECK_NAME: &str = "composer.pptx";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StageError {
    pub code: &'static str,
    pub message: String,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Processing, message)
    }
}

#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: JobId,
    pub kind: JobKind,
    pub name: String,
    pub params: Value,
    pub payload: Vec<u8>,
}

impl From<&Job> for StageInput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            name: job.name.clone(),
            params: job.params.clone(),
            payload: job.payload.clone(),
        }
    }
}

/// The transformation behind one stage. Returns result blobs in position
/// order. Must be a pure function of the input for dedup to be sound.
#[async_trait]
pub trait StageProcessor: Send + Sync + 'static {
    async fn process(&self, input: StageInput) -> Result<Vec<Vec<u8>>, StageError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slide {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Parameters of a render request, forwarded to the compose stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckParams {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default)]
    pub slides: Vec<Slide>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateParams {
    pub target_count: u32,
}

pub fn parse_params<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, StageError> {
    serde_json::from_value(params.clone())
        .map_err(|e| StageError::new(ErrorCode::BadPayload, e.to_string()))
}

pub fn file_extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

fn is_zip_container(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK")
}

fn check_template(payload: &[u8]) -> Result<(), StageError> {
    if payload.is_empty() {
        return Err(StageError::validation("No template"));
    }
    if !is_zip_container(payload) {
        return Err(StageError::validation("Old PPT format is not supported"));
    }
    Ok(())
}

/// Checks run before any processor is invoked.
pub fn validate(input: &StageInput) -> Result<(), StageError> {
    match input.kind {
        JobKind::Capture => {
            let supported = file_extension(&input.name)
                .is_some_and(|ext| CAPTURE_EXTENSIONS.contains(&ext.as_str()));
            if !supported {
                return Err(StageError::validation("Unknown file type"));
            }
            if input.payload.is_empty() {
                return Err(StageError::validation("Empty document"));
            }
            Ok(())
        }
        JobKind::Duplicate => {
            check_template(&input.payload)?;
            let params: DuplicateParams = parse_params(&input.params)?;
            if params.target_count == 0 {
                return Err(StageError::validation("target_count must be at least 1"));
            }
            Ok(())
        }
        JobKind::Compose => {
            check_template(&input.payload)?;
            let params: DeckParams = parse_params(&input.params)?;
            if params.slides.is_empty() {
                return Err(StageError::validation("No slides"));
            }
            Ok(())
        }
        JobKind::Render | JobKind::Snapshot => Err(StageError::new(
            ErrorCode::BadPayload,
            format!("{} is not a stage", input.kind),
        )),
    }
}

/// Duplicate and Compose produce exactly one artifact; Capture at least one.
pub fn check_output(kind: JobKind, items: &[Vec<u8>]) -> Result<(), StageError> {
    match kind {
        JobKind::Duplicate | JobKind::Compose if items.len() != 1 => Err(StageError::processing(
            format!("{kind} must produce exactly one item, got {}", items.len()),
        )),
        _ if items.is_empty() => Err(StageError::processing(format!(
            "{kind} produced no output"
        ))),
        _ => Ok(()),
    }
}

//! Stage processor that shells out to an external converter.
//!
//! The command line is split on whitespace (no shell) and the placeholders
//! `{input}`, `{output}` and `{params}` are replaced by paths inside a fresh
//! temporary directory. Every regular file the program leaves in `{output}`
//! becomes one result item, in file-name order.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{file_extension, StageError, StageInput, StageProcessor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn render_args(&self, input: &Path, output: &Path, params: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{params}", &params.to_string_lossy())
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    command: StageCommand,
}

impl CommandProcessor {
    pub fn new(command: StageCommand) -> Self {
        Self { command }
    }

    async fn run(&self, input: &StageInput) -> anyhow::Result<Result<Vec<Vec<u8>>, StageError>> {
        let dir = tempfile::tempdir()?;
        let ext = file_extension(&input.name).unwrap_or_else(|| "bin".to_string());
        let input_path = dir.path().join(format!("input.{ext}"));
        let params_path = dir.path().join("params.json");
        let output_dir = dir.path().join("out");

        tokio::fs::write(&input_path, &input.payload).await?;
        tokio::fs::write(&params_path, serde_json::to_vec(&input.params)?).await?;
        tokio::fs::create_dir(&output_dir).await?;

        let args = self
            .command
            .render_args(&input_path, &output_dir, &params_path);
        debug!(job_id = input.job_id, program = %self.command.program, ?args, "running stage command");

        let out = Command::new(&self.command.program)
            .args(&args)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Ok(Err(StageError::processing(format!(
                "{} exited with {}: {}",
                self.command.program,
                out.status,
                tail(stderr.trim(), 500)
            ))));
        }

        let mut files: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(&output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut items = Vec::with_capacity(files.len());
        for path in files {
            items.push(tokio::fs::read(&path).await?);
        }
        Ok(Ok(items))
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[start..]
}

#[async_trait]
impl StageProcessor for CommandProcessor {
    async fn process(&self, input: StageInput) -> Result<Vec<Vec<u8>>, StageError> {
        match self.run(&input).await {
            Ok(res) => res,
            Err(e) => Err(StageError::processing(format!(
                "{}: {e:#}",
                self.command.program
            ))),
        }
    }
}

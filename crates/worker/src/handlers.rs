use std::collections::HashMap;
use std::sync::Arc;

use deckflow::config::Config;
use deckflow::jobs::JobKind;
use deckflow::stage::{CommandProcessor, StageCommand, StageProcessor};

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobKind, Arc<dyn StageProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(kind, processor);
    }

    pub fn processor_for(&self, kind: JobKind) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(&kind).cloned()
    }
}

fn command_for(cfg: &Config, kind: JobKind) -> Option<&str> {
    match kind {
        JobKind::Capture => cfg.capture_cmd.as_deref(),
        JobKind::Duplicate => cfg.duplicate_cmd.as_deref(),
        JobKind::Compose => cfg.compose_cmd.as_deref(),
        JobKind::Render | JobKind::Snapshot => None,
    }
}

/// One external-command processor per stage that has a command configured.
pub fn build_registry(cfg: &Config) -> anyhow::Result<ProcessorRegistry> {
    let mut registry = ProcessorRegistry::new();

    for kind in JobKind::ALL.into_iter().filter(JobKind::is_stage) {
        let Some(line) = command_for(cfg, kind) else {
            continue;
        };
        let command = StageCommand::parse(line)
            .ok_or_else(|| anyhow::anyhow!("empty command configured for {kind}"))?;
        registry.register(kind, Arc::new(CommandProcessor::new(command)));
    }

    Ok(registry)
}

use crate::config::{IntakeConfig, UploadConfig};

pub struct PipelineConfig {
    pub intake: IntakeConfig,
    pub batch_size: usize,
    pub persist_not_found: bool,
    pub verify_parallelism: usize,
}

impl PipelineConfig {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            intake: config.intake.clone(),
            batch_size: config.persist.batch_size.max(1),
            persist_not_found: config.persist.persist_not_found,
            verify_parallelism: config.verify.parallelism.max(1),
        }
    }
}

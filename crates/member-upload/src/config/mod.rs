pub mod env;
pub mod schema;

pub use env::ENV_PREFIX;
pub use schema::{
    IntakeConfig, PersistConfig, QueueConfig, RetentionConfig, UploadConfig, VerifyConfig,
    WatchConfig,
};

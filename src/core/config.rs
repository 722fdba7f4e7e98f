mod parsing;
mod settings;
mod types;

pub(crate) use types::{ConfigError, OracleQuality, QueueSettings, Settings};

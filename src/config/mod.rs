//! Runner settings persisted as TOML under the application root.
//!
//! Command-line flags take precedence; the file only supplies defaults for a
//! machine or CI image.

use crate::app_dirs;

mod errors;
mod load;
mod save;
mod types;


/// Default filename used to store the runner settings.
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub use errors::ConfigError;
pub use load::{config_path, load_from_path, load_or_default};
pub use save::save_to_path;
pub use types::{
    DimensionSettings, ExecutionSettings, LoggingSettings, MAX_PARALLEL_LIMIT, OutputSettings,
    Settings,
};

fn map_app_dir_error(error: app_dirs::AppDirError) -> ConfigError {
    match error {
        app_dirs::AppDirError::NoBaseDir => ConfigError::NoConfigDir,
        app_dirs::AppDirError::CreateDir { path, source } => {
            ConfigError::CreateDir { path, source }
        }
    }
}

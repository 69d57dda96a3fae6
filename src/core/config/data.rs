use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::mask::ModelConfig;

/// Process-wide configuration. Sessions whose mask syncs with the global
/// config pick up `model_config` as their effective generation parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub model_config: ModelConfig,
    /// Generate a topic automatically once a conversation is long enough.
    #[serde(default = "default_true")]
    pub enable_auto_generate_title: bool,
    /// Synthesize a system prompt for model families that expect one.
    #[serde(default = "default_true")]
    pub inject_system_prompts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_config: ModelConfig::default(),
            enable_auto_generate_title: true,
            inject_system_prompts: true,
        }
    }
}

/// Get a user-friendly display string for a path, using ~ notation on
/// Unix-like systems when possible.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

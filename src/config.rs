use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FaultlineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Static analysis configuration
    pub analysis: AnalysisConfig,

    /// Output settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Source root the analyzed service lives under
    pub source_dir: PathBuf,

    /// Directories to ignore when indexing the source tree
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Additional module prefixes to search for error-raising routines,
    /// beyond the application's own package
    pub target_modules: Vec<String>,

    /// Maximum call depth the walker follows before giving up on a branch
    pub max_walk_depth: usize,

    /// Step budget for the constant-folding evaluator
    pub max_fold_steps: usize,

    /// Maximum file size to parse (in bytes)
    pub max_file_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Pretty-print the compiled artifact
    pub pretty: bool,

    /// Default artifact path when the CLI gives none
    pub artifact_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                source_dir: PathBuf::from("."),
                ignore_patterns: vec![
                    ".venv/".to_string(),
                    "__pycache__/".to_string(),
                    ".git/".to_string(),
                    "*.pyc".to_string(),
                ],
            },
            analysis: AnalysisConfig {
                target_modules: vec![],
                max_walk_depth: 32,
                max_fold_steps: 64,
                max_file_size: 1024 * 1024, // 1MB
            },
            output: OutputConfig {
                pretty: true,
                artifact_path: PathBuf::from("openapi.json"),
            },
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| FaultlineError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FaultlineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => {
                if p.as_ref().exists() {
                    Self::load(p)
                } else {
                    Ok(Self::default())
                }
            }
            None => {
                // Try common config file locations
                let candidates = [
                    "Faultline.toml",
                    "faultline.toml",
                    ".faultline.toml",
                ];

                for candidate in &candidates {
                    if Path::new(candidate).exists() {
                        return Self::load(candidate);
                    }
                }

                Ok(Self::default())
            }
        }
    }
}

//! Pipeline Configuration
//!
//! Settings live in `pipeline.yml`. Every field has a default, so a file
//! only needs the values that differ from them:
//!
//! ```yaml
//! data: 1
//! reference_fasta: /refs/GRCh38.fa
//! clair_model: /models/r941_prom_sup_g5014
//! engine:
//!   max_local_jobs: 8
//! cluster:
//!   queue: all.q
//! ```
//!
//! The file is looked up in the current directory first, then in its
//! parent. `ontvc variantcalling config` writes the defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the configuration.
pub const CONFIG_FILE: &str = "pipeline.yml";

/// Directories searched for [`CONFIG_FILE`], relative to the start directory.
const SEARCH_DIRS: &[&str] = &[".", ".."];

/// Where the raw reads live.
///
/// `0` means the working directory and `1` means `data.dir`. Anything
/// else is taken as a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataLocation {
    Index(u64),
    Path(PathBuf),
}

impl Default for DataLocation {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl DataLocation {
    pub fn directory(&self) -> PathBuf {
        match self {
            Self::Index(0) => PathBuf::from("."),
            Self::Index(1) => PathBuf::from("data.dir"),
            Self::Index(n) => PathBuf::from(n.to_string()),
            Self::Path(path) => path.clone(),
        }
    }
}

/// bcftools expressions used by the filtering tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Applied to clair3 small variants
    pub snv_expression: String,
    /// Applied to sniffles structural variants
    pub sv_expression: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            snv_expression: "QUAL>20 & DP>20".to_string(),
            sv_expression: "QUAL>30".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local jobs running at once
    pub max_local_jobs: usize,
    /// Cluster jobs submitted but not yet finished
    pub max_pending_submissions: usize,
    pub fail_fast: bool,
    /// Seconds between queue status polls
    pub poll_interval_secs: u64,
    /// Directory all task paths are relative to
    pub working_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_local_jobs: num_cpus::get(),
            max_pending_submissions: 100,
            fail_fast: false,
            poll_interval_secs: 30,
            working_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Queue client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Queue used by tasks without a queue of their own
    pub queue: Option<String>,
    /// Queue for GPU tasks (clair3)
    pub gpu_queue: String,
    pub submit_command: String,
    pub poll_command: String,
    pub cancel_command: String,
    /// Job scripts and queue logs, relative to the working directory
    pub log_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            queue: None,
            gpu_queue: "gpu".to_string(),
            submit_command: "sbatch".to_string(),
            poll_command: "sacct".to_string(),
            cancel_command: "scancel".to_string(),
            log_dir: PathBuf::from("cluster.dir"),
        }
    }
}

/// Contents of `pipeline.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataLocation,
    pub reference_fasta: String,
    /// Extra arguments passed to minimap2 before the reference
    pub minimap2_options: String,
    pub clair_model: String,
    /// Threads for mapping and clair3
    pub threads: usize,
    pub filter: FilterConfig,
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data: DataLocation::default(),
            reference_fasta: "reference.fasta".to_string(),
            minimap2_options: "-ax map-ont".to_string(),
            clair_model: "models/ont".to_string(),
            threads: 4,
            filter: FilterConfig::default(),
            engine: EngineConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses YAML text. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Loads the first `pipeline.yml` found in the current directory or
    /// its parent.
    pub fn discover() -> Result<(Self, PathBuf), ConfigError> {
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
            path: PathBuf::from("."),
            source,
        })?;
        Self::discover_from(&cwd)
    }

    /// Like [`discover`](Self::discover), starting from `start`.
    pub fn discover_from(start: &Path) -> Result<(Self, PathBuf), ConfigError> {
        let candidates: Vec<PathBuf> = SEARCH_DIRS
            .iter()
            .map(|dir| start.join(dir).join(CONFIG_FILE))
            .collect();

        for candidate in &candidates {
            debug!("Looking for {}", candidate.display());
            if candidate.is_file() {
                return Ok((Self::load(candidate)?, candidate.clone()));
            }
        }

        Err(ConfigError::NotFound {
            searched: candidates.iter().map(|p| p.display().to_string()).collect(),
        })
    }

    /// Serialises the configuration, with a short header.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        let body = serde_yaml::to_string(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        Ok(format!(
            "# ontvc variantcalling configuration\n\
             # data: 0 = working directory, 1 = data.dir, or a path\n\n{}",
            body
        ))
    }

    /// Writes the default configuration. An existing file is left alone.
    pub fn write_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::Write(format!(
                "{} already exists",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
            }
        }

        let yaml = Self::default().to_yaml()?;
        fs::write(path, yaml).map_err(|e| ConfigError::Write(e.to_string()))?;

        info!("Wrote default configuration to {}", path.display());
        Ok(())
    }

    /// Directory holding the `*.fastq.gz` reads.
    pub fn data_dir(&self) -> PathBuf {
        self.data.directory()
    }

    /// Working directory, resolved against `base` when relative.
    pub fn working_dir(&self, base: &Path) -> PathBuf {
        if self.engine.working_dir.is_absolute() {
            self.engine.working_dir.clone()
        } else {
            base.join(&self.engine.working_dir)
        }
    }
}

// CCLAB: Reproducible Congestion-Control Experiments on Emulated Network Paths
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Utility module collection of functions

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use thiserror::Error;
use tokio::sync::watch;

use crate::matrix::MatrixConfig;

/// Logging configuration, relative to the working directory.
pub const LOG_CONFIG: &str = "log4rs.yml";

/// Initialize logging from `log4rs.yml`, falling back to `pretty_env_logger` (configured with
/// `RUST_LOG`) if that file does not exist or is invalid. Log lines are printed above the
/// progress bars of `multi`.
pub fn init_logging(multi: MultiProgress) -> Result<(), log::SetLoggerError> {
    match log4rs::config::load_config_file(LOG_CONFIG, Default::default()) {
        Ok(config) => {
            let logger = log4rs::Logger::new(config);
            let level = logger.max_log_level();
            LogWrapper::new(multi, logger).try_init()?;
            log::set_max_level(level);
            Ok(())
        }
        Err(e) => {
            let mut builder = pretty_env_logger::formatted_timed_builder();
            match env::var("RUST_LOG") {
                Ok(filters) => builder.parse_filters(&filters),
                Err(_) => builder.filter_level(log::LevelFilter::Info),
            };
            let logger = builder.build();
            let level = logger.filter();
            LogWrapper::new(multi, logger).try_init()?;
            log::set_max_level(level);
            log::debug!("Cannot load {LOG_CONFIG} ({e}), logging to stderr");
            Ok(())
        }
    }
}

/// Wait until the flag is set. A dropped sender counts as set.
pub async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

pub trait PathBufExt: Sized {
    fn then(self, p: impl AsRef<Path>) -> PathBuf;
}

impl PathBufExt for PathBuf {
    fn then(mut self, p: impl AsRef<Path>) -> PathBuf {
        self.push(p);
        self
    }
}

impl PathBufExt for &Path {
    fn then(self, p: impl AsRef<Path>) -> PathBuf {
        let mut path = self.to_path_buf();
        path.push(p);
        path
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("Invalid YAML in {0:?}: {1}")]
    Yaml(PathBuf, serde_yaml::Error),
    #[error("Invalid JSON in {0:?}: {1}")]
    Json(PathBuf, serde_json::Error),
}

/// Load the experiment configurations. Files ending in `.json` are parsed as JSON, everything
/// else as YAML.
pub fn load_config(path: impl AsRef<Path>) -> Result<MatrixConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.into(), e))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content).map_err(|e| ConfigError::Json(path.into(), e))
    } else {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml(path.into(), e))
    }
}

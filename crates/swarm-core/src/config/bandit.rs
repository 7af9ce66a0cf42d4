//! Hot-reloadable UCB parameters persisted in `bandit.toml`
//!
//! ```toml
//! [ucb]
//! c = 1.4
//! alpha = 1.0
//! beta = 0.5
//! diversity_bonus = 0.2
//! ```
//!
//! The file is created with defaults on first load. Readers take a cheap
//! snapshot through [`BanditConfig::current`]; `reload()` and `update()`
//! replace the snapshot atomically.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// UCB v2 exploration parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditParams {
    /// Exploration constant
    pub c: f64,
    /// Multiplier applied to the exploration term
    pub alpha: f64,
    /// Weight of the per-agent novelty term
    pub beta: f64,
    /// Weight of the under-use bonus
    pub diversity_bonus: f64,
}

impl Default for BanditParams {
    fn default() -> Self {
        Self {
            c: 1.4,
            alpha: 1.0,
            beta: 0.5,
            diversity_bonus: 0.2,
        }
    }
}

impl BanditParams {
    /// Reject NaN and infinities
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("c", self.c),
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("diversity_bonus", self.diversity_bonus),
        ] {
            if !value.is_finite() {
                return Err(Error::ConfigError(format!("Invalid ucb.{}: {}", name, value)));
            }
        }
        Ok(())
    }
}

/// Partial update applied by [`BanditConfig::update`]
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BanditParamsPatch {
    pub c: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub diversity_bonus: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BanditFile {
    #[serde(default)]
    ucb: BanditParams,
}

/// File-backed bandit parameters with an in-memory snapshot
#[derive(Debug)]
pub struct BanditConfig {
    path: PathBuf,
    current: RwLock<BanditParams>,
}

impl BanditConfig {
    /// Load parameters from `path`, writing the defaults when the file is missing
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let params = read_or_create(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(params),
        })
    }

    /// In-memory parameters that never touch the filesystem
    pub fn in_memory(params: BanditParams) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(params),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the active parameters
    pub fn current(&self) -> BanditParams {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the file and replace the snapshot
    pub fn reload(&self) -> Result<BanditParams> {
        if self.path.as_os_str().is_empty() {
            return Ok(self.current());
        }
        let params = read_or_create(&self.path)?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = params;
        info!(c = params.c, alpha = params.alpha, beta = params.beta, "Bandit config reloaded");
        Ok(params)
    }

    /// Merge `patch` into the active parameters, validate and persist
    pub fn update(&self, patch: BanditParamsPatch) -> Result<BanditParams> {
        let mut next = self.current();
        if let Some(c) = patch.c {
            next.c = c;
        }
        if let Some(alpha) = patch.alpha {
            next.alpha = alpha;
        }
        if let Some(beta) = patch.beta {
            next.beta = beta;
        }
        if let Some(bonus) = patch.diversity_bonus {
            next.diversity_bonus = bonus;
        }
        next.validate()?;

        if !self.path.as_os_str().is_empty() {
            write_params(&self.path, &next)?;
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next;
        debug!(?next, "Bandit config updated");
        Ok(next)
    }
}

fn read_or_create(path: &Path) -> Result<BanditParams> {
    if !path.exists() {
        let params = BanditParams::default();
        write_params(path, &params)?;
        return Ok(params);
    }

    let contents = fs::read_to_string(path)?;
    let file: BanditFile = toml::from_str(&contents)
        .map_err(|e| Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e)))?;
    file.ucb.validate()?;
    Ok(file.ucb)
}

fn write_params(path: &Path, params: &BanditParams) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    let contents = toml::to_string_pretty(&BanditFile { ucb: *params })
        .map_err(|e| Error::ConfigError(format!("Failed to serialize bandit config: {}", e)))?;
    fs::write(path, contents)?;
    Ok(())
}

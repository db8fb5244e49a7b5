//! CLI configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/cloudgate/cloudgate.toml`
//! - Windows: `%APPDATA%/cloudgate/cloudgate.toml`
//!
//! Every section is optional. `[policy]` holds the upload tunables and
//! `[profile]` the rules the local store enforces.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use cloudgate_backend::{
    BackendProfile, HmacSha256Signer, LocalDirOptions, RequestSigner, SigV4Signer,
};
use cloudgate_upload::UploadPolicy;
use serde::{Deserialize, Serialize};

/// Request signing scheme used between the CLI and the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerKind {
    #[default]
    Hmac,
    Sigv4,
}

/// Local store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store root directory.
    pub root: PathBuf,

    /// Lifetime of issued credentials in seconds.
    pub credential_ttl_secs: u64,

    /// Require a byte-range proof before a fast-path match.
    pub challenge: bool,

    /// Length of challenged ranges.
    pub challenge_len: u64,

    pub signer: SignerKind,

    /// SigV4 region and service.
    pub region: String,
    pub service: String,
}

fn default_root() -> PathBuf {
    data_dir().join("store")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            credential_ttl_secs: 15 * 60,
            challenge: true,
            challenge_len: 4096,
            signer: SignerKind::default(),
            region: "local".into(),
            service: "cloudgate".into(),
        }
    }
}

impl StoreConfig {
    pub fn options(&self, profile: BackendProfile) -> LocalDirOptions {
        LocalDirOptions {
            profile,
            credential_ttl: Duration::from_secs(self.credential_ttl_secs),
            challenge: self.challenge,
            challenge_len: self.challenge_len,
            ..LocalDirOptions::default()
        }
    }

    pub fn signer(&self) -> Box<dyn RequestSigner> {
        match self.signer {
            SignerKind::Hmac => Box::new(HmacSha256Signer),
            SignerKind::Sigv4 => Box::new(SigV4Signer::new(&self.region, &self.service)),
        }
    }
}

/// CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub profile: BackendProfile,
    pub policy: UploadPolicy,
}

impl Config {
    /// Loads `explicit` if given, otherwise the default path. Only an
    /// explicit path is required to exist.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let config = match explicit {
            Some(path) => Self::read(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    Self::read(&path)?
                } else {
                    tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.profile.validate()?;
        self.policy.validate()?;
        if self.store.challenge && self.store.challenge_len == 0 {
            anyhow::bail!("store.challenge_len must be positive when challenges are enabled");
        }
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    config_dir().join("cloudgate.toml")
}

fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("cloudgate")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("cloudgate")
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("LOCALAPPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("cloudgate")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("cloudgate")
    }
}

//! Runtime configuration.
//!
//! Configuration comes from three layers, each overriding the previous:
//!
//! 1. Defaults ([`Config::default`]), which depend on whether the agent runs
//!    as root:
//!    - root: state in `/var/cache/procrun`, staging in `/var/tmp/procrun`
//!    - otherwise: everything under `~/.procrun`
//! 2. A YAML file ([`Config::from_yaml`]), all keys optional:
//!
//!    ```yaml
//!    tool: apptainer
//!    tool_path: /opt/apptainer/bin/apptainer
//!    state_file: /srv/agent/containers.json
//!    staging_root: /scratch/procrun
//!    publish_timeout_secs: 10
//!    ```
//!
//! 3. Environment variables ([`Config::from_env`]): `PROCRUN_TOOL`,
//!    `PROCRUN_TOOL_PATH`, `PROCRUN_SHIM_PATH`, `PROCRUN_STATE_FILE`,
//!    `PROCRUN_STAGING_ROOT`.

use crate::constants::{
    MAX_CONFIG_SIZE, PUBLISH_TIMEOUT, SHIM_BINARY, STATE_FILE_NAME, SYSTEM_IMAGE_CACHE_DIR,
    SYSTEM_STAGING_ROOT, SYSTEM_STATE_FILE, USER_BASE_DIR,
};
use crate::error::{Error, Result};
use crate::runtimes::ImageTool;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for a [`crate::runtimes::ProcessRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Image tool used to launch containers.
    pub tool: ImageTool,
    /// Explicit tool binary, instead of looking it up on `PATH`.
    pub tool_path: Option<PathBuf>,
    /// The `procrun-shim` binary.
    pub shim_path: PathBuf,
    /// Persisted container state.
    pub state_file: PathBuf,
    /// Parent of per-container staging directories.
    pub staging_root: PathBuf,
    /// Working directory for image pulls.
    pub image_cache_dir: PathBuf,
    /// Publish timeout for publishers created from this config.
    pub publish_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;
        let (state_file, staging_root, image_cache_dir) = if is_root {
            (
                PathBuf::from(SYSTEM_STATE_FILE),
                PathBuf::from(SYSTEM_STAGING_ROOT),
                PathBuf::from(SYSTEM_IMAGE_CACHE_DIR),
            )
        } else {
            let base = dirs::home_dir()
                .map(|h| h.join(USER_BASE_DIR))
                .unwrap_or_else(|| PathBuf::from(USER_BASE_DIR));
            (
                base.join(STATE_FILE_NAME),
                base.join("staging"),
                base.join("images"),
            )
        };

        Self {
            tool: ImageTool::default(),
            tool_path: None,
            shim_path: default_shim_path(),
            state_file,
            staging_root,
            image_cache_dir,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }
}

/// YAML representation; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    tool: Option<ImageTool>,
    tool_path: Option<PathBuf>,
    shim_path: Option<PathBuf>,
    state_file: Option<PathBuf>,
    staging_root: Option<PathBuf>,
    image_cache_dir: Option<PathBuf>,
    publish_timeout_secs: Option<u64>,
}

impl Config {
    /// Loads overrides from YAML on top of the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::default().merge_yaml(yaml)
    }

    /// Applies YAML overrides to `self`.
    pub fn merge_yaml(mut self, yaml: &str) -> Result<Self> {
        if yaml.len() > MAX_CONFIG_SIZE {
            return Err(Error::InvalidConfig(format!(
                "config size {} exceeds limit of {MAX_CONFIG_SIZE}",
                yaml.len()
            )));
        }
        let file: ConfigFile = if yaml.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfig(e.to_string()))?
        };

        if let Some(tool) = file.tool {
            self.tool = tool;
        }
        if file.tool_path.is_some() {
            self.tool_path = file.tool_path;
        }
        if let Some(path) = file.shim_path {
            self.shim_path = path;
        }
        if let Some(path) = file.state_file {
            self.state_file = path;
        }
        if let Some(path) = file.staging_root {
            self.staging_root = path;
        }
        if let Some(path) = file.image_cache_dir {
            self.image_cache_dir = path;
        }
        if let Some(secs) = file.publish_timeout_secs {
            self.publish_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// Loads the defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` (an environment accessor).
    pub fn merge_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(tool) = lookup("PROCRUN_TOOL") {
            self.tool = ImageTool::parse(&tool)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown image tool '{tool}'")))?;
        }
        if let Some(path) = lookup("PROCRUN_TOOL_PATH") {
            self.tool_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("PROCRUN_SHIM_PATH") {
            self.shim_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PROCRUN_STATE_FILE") {
            self.state_file = PathBuf::from(path);
        }
        if let Some(path) = lookup("PROCRUN_STAGING_ROOT") {
            self.staging_root = PathBuf::from(path);
        }
        Ok(self)
    }

    /// Roots every runtime path under `base` (used by tests and the CLI's
    /// `--root`).
    pub fn rooted_at(self, base: &Path) -> Self {
        self.with_state_file(base.join(STATE_FILE_NAME))
            .with_staging_root(base.join("staging"))
            .with_image_cache_dir(base.join("images"))
    }

    pub fn with_tool(mut self, tool: ImageTool) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = Some(path.into());
        self
    }

    pub fn with_shim_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shim_path = path.into();
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    pub fn with_staging_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_root = path.into();
        self
    }

    pub fn with_image_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_cache_dir = path.into();
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Finds `procrun-shim`: next to the running executable, then on `PATH`.
///
/// Falls back to the bare name, resolved at spawn time.
fn default_shim_path() -> PathBuf {
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SHIM_BINARY)))
        .filter(|path| path.is_file());
    if let Some(path) = sibling {
        return path;
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(SHIM_BINARY))
                .find(|path| path.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(SHIM_BINARY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_yaml_overrides() {
        let config = Config::from_yaml(
            "tool: apptainer\nstate_file: /srv/state.json\npublish_timeout_secs: 9\n",
        )
        .unwrap();
        assert_eq!(config.tool, ImageTool::Apptainer);
        assert_eq!(config.state_file, PathBuf::from("/srv/state.json"));
        assert_eq!(config.publish_timeout, Duration::from_secs(9));
        assert_eq!(config.staging_root, Config::default().staging_root);
    }

    #[test]
    fn test_yaml_rejects_unknown_keys_and_oversize() {
        assert!(matches!(
            Config::from_yaml("bogus: 1\n"),
            Err(Error::InvalidConfig(_))
        ));
        let huge = format!("tool_path: /{}\n", "a".repeat(MAX_CONFIG_SIZE));
        assert!(matches!(Config::from_yaml(&huge), Err(Error::InvalidConfig(_))));
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROCRUN_TOOL", "host"),
            ("PROCRUN_STAGING_ROOT", "/scratch"),
            ("PROCRUN_STATE_FILE", ""),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .merge_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.tool, ImageTool::Host);
        assert_eq!(config.staging_root, PathBuf::from("/scratch"));
        assert_eq!(config.state_file, Config::default().state_file);

        let err = Config::default()
            .merge_env(|k| (k == "PROCRUN_TOOL").then(|| "docker".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_rooted_at() {
        let config = Config::default().rooted_at(Path::new("/tmp/x"));
        assert_eq!(config.state_file, PathBuf::from("/tmp/x/containers.json"));
        assert_eq!(config.staging_root, PathBuf::from("/tmp/x/staging"));
        assert_eq!(config.image_cache_dir, PathBuf::from("/tmp/x/images"));
    }
}

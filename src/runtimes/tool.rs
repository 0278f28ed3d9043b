//! Image tools and launch command derivation.
//!
//! A process-backed container is a single OS process. Which process depends
//! on the image tool:
//!
//! | Tool          | Program       | Env passthrough prefix             |
//! |---------------|---------------|------------------------------------|
//! | `singularity` | `singularity` | `SINGULARITYENV_`, `APPTAINERENV_` |
//! | `apptainer`   | `apptainer`   | `SINGULARITYENV_`, `APPTAINERENV_` |
//! | `host`        | the command   | none (variables set directly)      |
//!
//! ## Mount Strategy
//!
//! Binding staged destinations individually would shadow whatever the image
//! has at those paths. Instead the whole stage directory is bound at
//! [`CONTAINER_STAGE_PATH`] and, when there is staged content, the command
//! is wrapped in a bootstrap that copies it into place and then execs the
//! real command:
//!
//! ```text
//! singularity exec --writable-tmpfs --pwd /work --env K=V \
//!     --bind <stage>:/run/procrun/stage --nv docker://img \
//!     /bin/sh -c 'cp -a /run/procrun/stage/. / && exec "$@"' procrun-bootstrap python3 train.py
//! ```
//!
//! `--writable-tmpfs` gives the bootstrap a writable root.

use crate::constants::{
    BOOTSTRAP_ARGV0, CONTAINER_STAGE_PATH, CUDA_VISIBLE_DEVICES, ROCR_VISIBLE_DEVICES,
    STAGING_DIR_ENV,
};
use crate::error::{Error, Result};
use crate::spec::{DeviceClass, PullRequest, RunSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Program used to launch containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageTool {
    #[default]
    Singularity,
    Apptainer,
    /// No image: the command runs directly on the host.
    Host,
}

/// Everything needed to spawn a container's process (before the shim).
///
/// Derived once at create time and persisted, since archive content is not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    /// Program and arguments.
    #[serde(rename = "cmd")]
    pub argv: Vec<String>,
    /// Variables added on top of the cleared environment and `PATH`.
    #[serde(default, rename = "launch_env")]
    pub env: Vec<(String, String)>,
    /// Host working directory, for the host tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
}

impl ImageTool {
    /// Returns the tool name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Singularity => "singularity",
            Self::Apptainer => "apptainer",
            Self::Host => "host",
        }
    }

    /// Parses a tool name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "singularity" => Some(Self::Singularity),
            "apptainer" => Some(Self::Apptainer),
            "host" | "local" => Some(Self::Host),
            _ => None,
        }
    }

    /// Returns the tool program, `override_path` taking precedence.
    ///
    /// `None` for the host tool.
    pub fn program(&self, override_path: Option<&Path>) -> Option<String> {
        let default = match self {
            Self::Singularity => "singularity",
            Self::Apptainer => "apptainer",
            Self::Host => return None,
        };
        Some(
            override_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| default.to_string()),
        )
    }

    /// Returns true if the tool needs an image reference.
    pub fn uses_images(&self) -> bool {
        !matches!(self, Self::Host)
    }

    /// Derives the launch plan for `spec` with its stage directory at `stage`.
    pub fn launch_plan(
        &self,
        id: &str,
        override_path: Option<&Path>,
        spec: &RunSpec,
        stage: &Path,
    ) -> Result<LaunchPlan> {
        let mut plan = LaunchPlan::default();

        let Some(program) = self.program(override_path) else {
            plan.argv = spec.cmd.clone();
            plan.env = spec
                .env
                .iter()
                .filter_map(|e| e.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            plan.env
                .push((STAGING_DIR_ENV.to_string(), stage.display().to_string()));
            for (class, var) in DEVICE_VARIABLES {
                if let Some(ids) = spec.visible_devices(*class) {
                    plan.env.push((var.to_string(), ids));
                }
            }
            if !spec.working_dir.is_empty() {
                plan.current_dir = Some(PathBuf::from(&spec.working_dir));
            }
            return Ok(plan);
        };

        if spec.image.is_empty() {
            return Err(Error::InvalidSpec {
                id: id.to_string(),
                reason: format!("{} requires an image", self.name()),
            });
        }

        let bootstrap = spec.has_archives();
        plan.argv.push(program);
        plan.argv
            .push(if bootstrap { "exec" } else { "run" }.to_string());
        plan.argv.push("--writable-tmpfs".to_string());
        if !spec.working_dir.is_empty() {
            plan.argv.push("--pwd".to_string());
            plan.argv.push(spec.working_dir.clone());
        }
        for entry in &spec.env {
            plan.argv.push("--env".to_string());
            plan.argv.push(entry.clone());
        }
        plan.argv.push("--bind".to_string());
        plan.argv
            .push(format!("{}:{CONTAINER_STAGE_PATH}", stage.display()));
        if spec.visible_devices(DeviceClass::Nvidia).is_some() {
            plan.argv.push("--nv".to_string());
        }
        if spec.visible_devices(DeviceClass::Amd).is_some() {
            plan.argv.push("--rocm".to_string());
        }
        plan.argv.push(spec.image.clone());
        if bootstrap {
            plan.argv.push("/bin/sh".to_string());
            plan.argv.push("-c".to_string());
            plan.argv
                .push(format!("cp -a {CONTAINER_STAGE_PATH}/. / && exec \"$@\""));
            plan.argv.push(BOOTSTRAP_ARGV0.to_string());
        }
        plan.argv.extend(spec.cmd.iter().cloned());

        for (class, var) in DEVICE_VARIABLES {
            if let Some(ids) = spec.visible_devices(*class) {
                for prefix in ENV_PREFIXES {
                    plan.env.push((format!("{prefix}{var}"), ids.clone()));
                }
            }
        }
        Ok(plan)
    }

    /// Returns the pull command line, or `None` if the tool has no images.
    pub fn pull_command(&self, override_path: Option<&Path>, req: &PullRequest) -> Option<Vec<String>> {
        let mut argv = vec![self.program(override_path)?, "pull".to_string()];
        if req.force_pull {
            argv.push("--force".to_string());
        }
        argv.push(req.name.clone());
        Some(argv)
    }
}

impl std::fmt::Display for ImageTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Prefixes that pass host variables into the container. Both are set so
/// either flavour of the tool picks them up.
const ENV_PREFIXES: &[&str] = &["SINGULARITYENV_", "APPTAINERENV_"];

const DEVICE_VARIABLES: &[(DeviceClass, &str)] = &[
    (DeviceClass::Nvidia, CUDA_VISIBLE_DEVICES),
    (DeviceClass::Amd, ROCR_VISIBLE_DEVICES),
];

//! Container runtime backed by the podman or docker CLI
//!
//! Both CLIs accept the same subcommands for everything imgdeps does, so
//! one implementation covers them; only the binary name differs.

use crate::error::{ImgdepsError, ImgdepsResult};
use crate::orchestration::runtime::ContainerRuntime;
use crate::orchestration::{build_error_output, stream_child_output};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Supported engine CLIs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBinary {
    Podman,
    Docker,
}

impl EngineBinary {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "podman" => Some(Self::Podman),
            "docker" => Some(Self::Docker),
            _ => None,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::Docker => "docker",
        }
    }
}

/// Container runtime driving a local engine CLI
pub struct NativeRuntime {
    binary: EngineBinary,
}

impl NativeRuntime {
    /// Create a runtime for the given engine
    pub fn new(binary: EngineBinary) -> Self {
        Self { binary }
    }

    /// Execute an engine command and return the output
    async fn exec(&self, args: &[&str]) -> ImgdepsResult<std::process::Output> {
        let bin = self.binary.command();
        debug!("Executing: {} {:?}", bin, args);

        Command::new(bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ImgdepsError::command_failed(format!("{} {:?}", bin, args), e))
    }

    /// Execute and turn a non-zero exit into `CommandExecution`
    async fn exec_ok(&self, args: &[&str]) -> ImgdepsResult<std::process::Output> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ImgdepsError::command_exec(
                format!("{} {}", self.binary.command(), args.first().unwrap_or(&"")),
                stderr.trim(),
            ))
        }
    }
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::new(EngineBinary::Podman)
    }
}

#[async_trait]
impl ContainerRuntime for NativeRuntime {
    async fn is_available(&self) -> ImgdepsResult<bool> {
        let status = Command::new(self.binary.command())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        Ok(status.map(|s| s.success()).unwrap_or(false))
    }

    async fn image_exists(&self, image: &str) -> ImgdepsResult<bool> {
        let output = self.exec(&["image", "inspect", "--format", "{{.Id}}", image]).await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> ImgdepsResult<()> {
        info!("Pulling image: {}", image);
        self.exec_ok(&["pull", image]).await?;
        Ok(())
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ImgdepsResult<()> {
        let bin = self.binary.command();
        let containerfile = context_dir.join("Containerfile");

        let mut cmd = Command::new(bin);
        cmd.arg("build").arg("-t").arg(tag).arg("-f").arg(&containerfile);
        for (key, value) in build_args {
            cmd.arg("--build-arg").arg(format!("{key}={value}"));
        }
        // A timed-out build is dropped; the engine process must go with it
        cmd.arg(context_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Building {} from {}", tag, context_dir.display());
        let mut child = cmd
            .spawn()
            .map_err(|e| ImgdepsError::command_failed(format!("{bin} build"), e))?;

        let lines = stream_child_output(&mut child, on_output).await;
        let status = child
            .wait()
            .await
            .map_err(|e| ImgdepsError::command_failed(format!("{bin} build"), e))?;

        if status.success() {
            Ok(())
        } else {
            let joined = lines.join("\n");
            Err(ImgdepsError::command_exec(
                format!("{bin} build -t {tag}"),
                build_error_output(&joined, ""),
            ))
        }
    }

    async fn save_image(&self, image: &str, archive: &Path) -> ImgdepsResult<()> {
        let archive = archive.to_string_lossy();
        self.exec_ok(&["save", "-o", &archive, image]).await?;
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> ImgdepsResult<()> {
        let archive = archive.to_string_lossy();
        self.exec_ok(&["load", "-i", &archive]).await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> ImgdepsResult<()> {
        self.exec_ok(&["tag", source, target]).await?;
        Ok(())
    }

    async fn push_image(&self, image: &str) -> ImgdepsResult<()> {
        info!("Pushing image: {}", image);
        self.exec_ok(&["push", image]).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> ImgdepsResult<()> {
        let output = self.exec(&["rmi", image]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("no such image") || stderr.contains("image not known") {
            Ok(())
        } else {
            Err(ImgdepsError::command_exec(
                format!("{} rmi", self.binary.command()),
                stderr,
            ))
        }
    }

    async fn image_size(&self, image: &str) -> ImgdepsResult<u64> {
        let output = self
            .exec_ok(&["image", "inspect", "--format", "{{.Size}}", image])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let size = stdout.trim();
        size.parse::<u64>()
            .map_err(|e| ImgdepsError::Internal(format!("unexpected image size '{size}': {e}")))
    }

    fn runtime_name(&self) -> &'static str {
        match self.binary {
            EngineBinary::Podman => "Podman",
            EngineBinary::Docker => "Docker",
        }
    }
}

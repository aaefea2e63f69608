//! Init command - write an example declaration

use crate::cli::args::{InitArgs, DEFAULT_DECLARATION};
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::ui::{self, UiContext};
use std::path::Path;
use tokio::fs;

/// Example declaration
const INIT_TEMPLATE: &str = r#"# imgdeps build declaration
# Each entry below becomes one cached layer. Editing, adding or removing
# an entry only rebuilds the layers after it.

image_name: devbox
image_tag: latest

layers:
  base: debian:12

  # One layer per package, in this order
  apt:
    - curl
    - git
    - ca-certificates

  # Several packages in one layer
  apt_batch:
    - name: editors
      packages: [vim, less]

  scripts:
    - name: rustup
      commands:
        - curl -sSf https://sh.rustup.rs | sh -s -- -y --profile minimal
    # - name: setup
    #   file: scripts/setup.sh

  # Rebuilt on every build, always on top
  config:
    - name: motd
      commands:
        - echo "devbox" > /etc/motd

# Stages with dependencies; changed stages are moved to the end
# stages:
#   - name: toolchain
#     commands: ["make toolchain"]
#   - name: app
#     dependencies: [toolchain]
#     commands: ["make app"]

# Passed as build args; never part of layer identity
env:
  DEBIAN_FRONTEND: noninteractive

optimization:
  max_layers: 100
  batch_size: 5
  parallel: 4
  cleanup_age: 30
"#;

/// Execute the init command
pub async fn execute(args: InitArgs) -> ImgdepsResult<()> {
    let ctx = UiContext::detect();

    let target_dir = match args.path {
        Some(ref p) => p.clone(),
        None => std::env::current_dir()
            .map_err(|e| ImgdepsError::io("getting current directory", e))?,
    };

    let path = target_dir.join(DEFAULT_DECLARATION);
    if path.exists() && !args.force {
        return Err(ImgdepsError::User(format!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        )));
    }

    ensure_dir(&target_dir).await?;
    fs::write(&path, INIT_TEMPLATE)
        .await
        .map_err(|e| ImgdepsError::io(format!("writing {}", path.display()), e))?;

    ui::step_ok_detail(&ctx, "Created declaration", &path.display().to_string());
    ui::remark(&ctx, "Next: imgdeps plan, then imgdeps build");
    Ok(())
}

async fn ensure_dir(dir: &Path) -> ImgdepsResult<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ImgdepsError::io(format!("creating directory {}", dir.display()), e))?;
    }
    Ok(())
}

//! Export command - save a built image to an archive

use super::{chain_images, read_index};
use crate::cache::{Lookup, TieredCache};
use crate::cli::args::ExportArgs;
use crate::config::Config;
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::orchestration::create_runtime;
use crate::ui::{self, TaskSpinner, UiContext};
use std::sync::Arc;

/// Execute the export command
pub async fn execute(args: ExportArgs, config: &Config) -> ImgdepsResult<()> {
    let ctx = UiContext::detect();
    let index = read_index(config).await?;
    let images = chain_images(&index, &args.target)?;
    let Some((_, tip)) = images.last() else {
        return Err(ImgdepsError::ChainNotFound(args.target));
    };

    let runtime = create_runtime(config).await?;
    if !runtime.image_exists(&args.target).await? {
        // The output tag was removed; restore it from the chain tip
        let cache = TieredCache::from_config(config, Arc::clone(&runtime));
        if let Lookup::Miss = cache.ensure_local(tip).await? {
            return Err(ImgdepsError::ImageNotFound(tip.clone()));
        }
        runtime.tag_image(tip, &args.target).await?;
    }

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ImgdepsError::io(format!("creating {}", parent.display()), e))?;
    }

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Saving {}...", args.target));
    match runtime.save_image(&args.target, &args.output).await {
        Ok(()) => {
            spinner.stop(&format!("Saved {}", args.output.display()));
            ui::remark(&ctx, &format!("{} layer(s) in chain", images.len()));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error("Export failed");
            Err(e)
        }
    }
}

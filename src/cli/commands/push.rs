//! Push command - publish a tracked chain to the shared tiers

use super::{chain_images, read_index};
use crate::cache::{Lookup, Tier, TieredCache};
use crate::cli::args::PushArgs;
use crate::config::Config;
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::layer::LayerKind;
use crate::orchestration::create_runtime;
use crate::ui::{self, UiContext};

/// Execute the push command
pub async fn execute(args: PushArgs, config: &Config) -> ImgdepsResult<()> {
    let ctx = UiContext::detect();
    let index = read_index(config).await?;
    let images = chain_images(&index, &args.target)?;

    let runtime = create_runtime(config).await?;
    let cache = TieredCache::from_config(config, runtime);
    let remotes: Vec<Tier> = cache.tiers().into_iter().filter(|t| *t != Tier::Local).collect();
    if remotes.is_empty() {
        return Err(ImgdepsError::User(
            "No shared store or registry configured; set cache.shared_store or cache.registry"
                .to_string(),
        ));
    }

    ui::intro(&ctx, &format!("Push {}", args.target));

    // Config layers are rebuilt on every build and never shared
    let mut refs = Vec::new();
    for (logical_id, image_ref) in images {
        if LayerKind::from_logical_id(&logical_id) == Some(LayerKind::Config) {
            continue;
        }
        if let Lookup::Miss = cache.ensure_local(&image_ref).await? {
            ui::step_warn_hint(&ctx, &logical_id, "image is gone; rebuild to publish it");
            continue;
        }
        ui::layer_step(&ctx, "push", &logical_id, None);
        refs.push(image_ref);
    }

    let errors = cache.push_all(&refs).await;
    let tiers: Vec<String> = remotes.iter().map(Tier::to_string).collect();
    if errors.is_empty() {
        ui::outro_success(&ctx, &format!("Pushed {} layer(s) to {}", refs.len(), tiers.join(", ")));
        Ok(())
    } else {
        for e in &errors {
            ui::step_warn(&ctx, &e.to_string());
        }
        Err(ImgdepsError::User(format!("{} push(es) failed", errors.len())))
    }
}

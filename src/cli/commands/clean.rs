//! Clean command - evict layers unused for a number of days

use crate::cache::{CacheIndex, CacheLock, TieredCache};
use crate::cli::args::CleanArgs;
use crate::config::{self, Config};
use crate::error::ImgdepsResult;
use crate::journal::Journal;
use crate::orchestration::create_runtime;
use crate::plan::evict_stale;
use crate::ui::{self, UiContext};
use chrono::{Duration, Utc};

/// Execute the clean command
pub async fn execute(args: CleanArgs, config: &Config) -> ImgdepsResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let cache_dir = config::cache_dir(config);
    let stale_after = Duration::seconds(config.cache.lock_stale_secs as i64);

    let _lock = CacheLock::acquire(&cache_dir, stale_after, args.break_lock).await?;
    let mut index = CacheIndex::load(CacheIndex::path_in(&cache_dir)).await?;
    index.refresh_status();

    let candidates = index
        .state()
        .eviction_plan(Duration::days(args.older_than as i64), Utc::now());

    ui::intro(&ctx, "Clean layer cache");
    if candidates.is_empty() {
        ui::outro_success(
            &ctx,
            &format!("Nothing unused for more than {} day(s)", args.older_than),
        );
        return Ok(());
    }

    let mut reclaimable = 0;
    for id in &candidates {
        if let Some(node) = index.state().get(id) {
            reclaimable += node.size_bytes;
            ui::layer_step(&ctx, "drop", &node.logical_id, Some(&node.image_ref));
        }
    }
    ui::key_value(&ctx, "reclaimable", &ui::format_size(reclaimable));

    if args.dry_run {
        let summary = format!("Dry run: {} layer(s) would be removed", candidates.len());
        ui::outro_success(&ctx, &summary);
        return Ok(());
    }

    let prompt = format!("Remove {} layer(s)?", candidates.len());
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::outro_warn(&ctx, "Nothing removed");
        return Ok(());
    }

    let runtime = create_runtime(config).await?;
    let cache = TieredCache::from_config(config, runtime);
    let removed = evict_stale(&mut index, &cache, &Journal::new(config), args.older_than).await?;
    ui::outro_success(&ctx, &format!("Removed {} layer(s)", removed.len()));
    Ok(())
}

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::archive;
use crate::config;
use crate::data::{ArchiveFeedService, FeedService};
use crate::feed::{Controller, FeedTuning};
use crate::lifecycle::Manager;
use crate::player::MpvBackend;
use crate::storage;
use crate::ui;
use crate::visibility::ActivationConfig;

#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub subreddit: String,
}

pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;

    let store =
        Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
    let prefs = store.load_feed_prefs().context("load feed preferences")?;

    let client = archive::Client::new(archive::ClientConfig {
        base_url: Some(cfg.archive.base_url.clone()),
        user_agent: cfg.archive.user_agent.clone(),
        timeout: Some(cfg.archive.timeout),
        http_client: None,
    })
    .context("create archive client")?;
    let service: Arc<dyn FeedService> = Arc::new(ArchiveFeedService::new(Arc::new(client)));

    let backend = MpvBackend::new(cfg.player.mpv_path.clone());
    let lifecycle = Manager::new(Box::new(backend));

    let tuning = FeedTuning {
        page_size: cfg.feed.page_size,
        trigger_rows: cfg.feed.trigger_rows,
        activation: ActivationConfig {
            margin_rows: cfg.feed.margin_rows,
            visible_fraction: cfg.feed.visible_fraction,
        },
    };
    let mut controller = Controller::new(service, lifecycle, tuning);
    controller.load(&options.subreddit, prefs.sort, prefs.view_mode);

    let status = format!(
        "Loading r/{} ({} / {} view)…",
        options.subreddit,
        prefs.sort.as_str(),
        prefs.view_mode.as_key()
    );

    let mut model = ui::Model::new(ui::Options {
        controller,
        subreddit: options.subreddit,
        store: Some(store),
        status_message: status,
    });
    model.run()
}

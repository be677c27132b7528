mod cli;

use anyhow::Result;
use clap::Parser;
use log::info;

use tech_idm::download::config::Settings;
use tech_idm::download::logger::setup_logger;
use tech_idm::download::{build_manager, manager::DownloadManager};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let settings = Settings::load(&args.config)?;
    setup_logger(settings.log_file.as_deref())?;

    info!("{}", settings.welcome_message);

    let manager = build_manager(settings)?;

    if !args.url.is_empty() {
        run_downloads(&manager, &args).await?;
    }

    // 退出前保存一次完整快照
    manager.save().await?;

    Ok(())
}

async fn run_downloads(manager: &DownloadManager, args: &CliArgs) -> Result<()> {
    let queue = match manager.find_queue_by_name(&args.queue) {
        Some(queue) => queue,
        None => manager.add_queue(&args.queue),
    };

    for url in &args.url {
        let dc = manager.new_download(url).await;
        manager.add_download(queue.id, dc).await?;
    }

    queue.start().await?;
    queue.wait_for_completion().await;

    for dc in queue.downloads().await {
        let state = dc.snapshot();
        info!(
            "{}: {:?} ({}/{} bytes)",
            state.file_name,
            state.status,
            state.downloaded(),
            state.total_size
        );
    }

    Ok(())
}

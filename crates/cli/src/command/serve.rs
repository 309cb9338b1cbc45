use crate::app::Args;
use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Log files larger than this are discarded on startup.
const MAX_LOG_SIZE: u64 = 8 * 1024 * 1024;

/// Starts the preview host, talking to the editor over stdio.
#[derive(Parser, Debug, Clone)]
pub struct Serve;

impl Serve {
    pub async fn run(&self, args: Args) -> Result<()> {
        let (config, config_err) = preview_config::load_config_on_startup(args.config_file.clone());

        let maybe_log = if let Some(log_path) = args.log {
            Some(log_path)
        } else if let Ok(log_path) =
            std::env::var("MDIT_PREVIEW_LOG_PATH").map(std::path::PathBuf::from)
        {
            Some(log_path)
        } else {
            config.log.log_file.as_ref().map(std::path::PathBuf::from)
        };

        let config_err = config_err.map(|err| err.to_string());

        // Stdout is the editor channel, nothing may be logged there.
        let Some(log_path) = maybe_log else {
            preview_server::start(config_err).await?;
            return Ok(());
        };

        if let Ok(metadata) = std::fs::metadata(&log_path) {
            if log_path.is_file() && metadata.len() > MAX_LOG_SIZE {
                std::fs::remove_file(&log_path)?;
            }
        }

        let file_name = log_path
            .file_name()
            .ok_or_else(|| anyhow!("no file name in {log_path:?}"))?;

        let directory = log_path
            .parent()
            .ok_or_else(|| anyhow!("{log_path:?} has no parent"))?;

        let file_appender = tracing_appender::rolling::never(directory, file_name);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

        let builder = tracing_subscriber::FmtSubscriber::builder()
            .with_line_number(true)
            .with_writer(non_blocking)
            .with_ansi(false);

        if config.log.log_target.is_empty() {
            let max_level = config
                .log
                .max_level
                .parse()
                .unwrap_or(tracing::Level::DEBUG);
            tracing::subscriber::set_global_default(builder.with_max_level(max_level).finish())?;
        } else {
            let filter = EnvFilter::try_new(&config.log.log_target)?;
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?;
        }

        preview_server::start(config_err).await?;

        Ok(())
    }
}

use crate::command;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
pub enum RunCmd {
    /// Start the preview host, talking to the editor over stdio.
    #[clap(name = "serve")]
    Serve(command::serve::Serve),
    /// Check whether a file can be previewed and what its preview would watch.
    #[clap(name = "check")]
    Check(command::check::Check),
    /// Print the page a preview of a file starts from.
    #[clap(name = "scaffold")]
    Scaffold(command::scaffold::Scaffold),
}

/// Markdown-it preview CLI arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Enable the logging system.
    #[clap(long)]
    pub log: Option<std::path::PathBuf>,

    /// Specify the path of the config file.
    #[clap(long)]
    pub config_file: Option<std::path::PathBuf>,
}

impl RunCmd {
    pub async fn run(self, args: Args) -> Result<()> {
        match self {
            Self::Serve(serve) => serve.run(args).await,
            Self::Check(check) => {
                init_stderr_logging(args);
                check.run()
            }
            Self::Scaffold(scaffold) => {
                init_stderr_logging(args);
                scaffold.run()
            }
        }
    }
}

/// One-shot commands print their result on stdout and log to stderr.
fn init_stderr_logging(args: Args) {
    let (_, config_err) = preview_config::load_config_on_startup(args.config_file);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    if let Some(err) = config_err {
        tracing::warn!(%err, "Using default host config");
    }
}

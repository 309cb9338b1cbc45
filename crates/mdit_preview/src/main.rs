use clap::Parser;
use cli::{Args, RunCmd};

#[derive(Parser, Debug)]
pub enum Cmd {
    /// Display the current version.
    #[clap(name = "version")]
    Version,

    /// Run the preview.
    #[clap(flatten)]
    Run(Box<RunCmd>),
}

#[derive(Parser, Debug)]
#[clap(name = "mdit-preview", disable_version_flag = true)]
pub struct MditPreview {
    #[clap(flatten)]
    pub args: Args,

    #[clap(subcommand)]
    pub cmd: Cmd,
}

#[tokio::main]
async fn main() {
    let mdit_preview = MditPreview::parse();

    match mdit_preview.cmd {
        Cmd::Version => {
            println!(
                "version {}, built for {}.",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::ARCH
            );
        }
        Cmd::Run(run_cmd) => {
            if let Err(e) = run_cmd.run(mdit_preview.args).await {
                eprintln!("error: {e:?}");
                std::process::exit(1);
            }
        }
    }
}

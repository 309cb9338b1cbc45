use super::DocumentContext;
use anyhow::Result;
use clap::Parser;
use preview_core::template::Scaffold as PageScaffold;
use preview_core::LocalAssetResolver;
use std::path::PathBuf;

/// Print the page a preview of the file would start from.
#[derive(Parser, Debug, Clone)]
pub struct Scaffold {
    /// Document to render the page for.
    file: PathBuf,

    /// Workspace folder containing the document.
    #[clap(long)]
    workspace_root: Option<PathBuf>,
}

impl Scaffold {
    pub fn run(&self) -> Result<()> {
        let DocumentContext {
            document,
            scope,
            config,
        } = DocumentContext::load(&self.file, self.workspace_root.as_deref())?;

        if !document.is_eligible(&config) {
            tracing::warn!(file = %document.id, "Not eligible for preview under the current config");
        }

        let page = PageScaffold {
            config: &config,
            base: scope.base(),
            resolver: &LocalAssetResolver::default(),
            markdown_it_cdn: &preview_config::config().preview.markdown_it_cdn,
        }
        .render(&document.text);

        println!("{page}");

        Ok(())
    }
}

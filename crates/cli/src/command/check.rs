use super::DocumentContext;
use anyhow::Result;
use clap::Parser;
use preview_core::assets::watch_targets;
use preview_core::{LocalAssetResolver, TargetKind};
use serde_json::json;
use std::path::PathBuf;

/// Print whether a file can be previewed, its base location and the files a
/// preview of it would watch.
#[derive(Parser, Debug, Clone)]
pub struct Check {
    /// Document to check.
    file: PathBuf,

    /// Workspace folder containing the document.
    #[clap(long)]
    workspace_root: Option<PathBuf>,
}

impl Check {
    pub fn run(&self) -> Result<()> {
        let DocumentContext {
            document,
            scope,
            config,
        } = DocumentContext::load(&self.file, self.workspace_root.as_deref())?;

        let targets = watch_targets(&scope, &config, &LocalAssetResolver::default())
            .into_iter()
            .map(|target| {
                let kind = match target.kind {
                    TargetKind::Config => "config",
                    TargetKind::Asset => "asset",
                };
                json!({ "path": target.path, "kind": kind })
            })
            .collect::<Vec<_>>();

        let report = json!({
            "file": document.id.path(),
            "eligible": document.is_eligible(&config),
            "allowedExtensions": config.allowed_extensions(),
            "base": scope.base(),
            "configFile": scope.config_file(),
            "watchTargets": targets,
        });

        println!("{}", serde_json::to_string_pretty(&report)?);

        Ok(())
    }
}

//! Page scaffold sent to the rendering surface.
//!
//! The scaffold is an HTML page loading markdown-it, the configured scripts
//! and stylesheets, and rendering the initial text once everything is loaded.
//! It is produced by filling the `%%NAME%%` placeholders of an embedded
//! template in a single pass, so placeholder-like text in the document or the
//! configuration is never expanded.

use crate::assets::AssetResolver;
use crate::config::PreviewConfig;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

/// HTML template with `%%NAME%%` placeholders.
pub const PREVIEW_TEMPLATE: &str = include_str!("../js/preview.html");

pub const DEFAULT_MARKDOWN_IT_CDN: &str =
    "https://cdn.jsdelivr.net/npm/markdown-it/dist/markdown-it.min.js";

const NONCE_LEN: usize = 32;

/// Everything besides the document text that goes into a scaffold.
pub struct Scaffold<'a> {
    pub config: &'a PreviewConfig,
    /// Base location asset paths are resolved against.
    pub base: &'a Path,
    pub resolver: &'a dyn AssetResolver,
    pub markdown_it_cdn: &'a str,
}

impl Scaffold<'_> {
    /// Renders the page with a fresh nonce.
    pub fn render(&self, initial_text: &str) -> String {
        self.render_with_nonce(initial_text, &generate_nonce())
    }

    pub fn render_with_nonce(&self, initial_text: &str, nonce: &str) -> String {
        let config = self.config;

        let mut css_links = String::new();
        for asset in config
            .css
            .iter()
            .filter_map(|path| self.resolver.resolve(self.base, path))
        {
            let _ = writeln!(css_links, r#"<link rel="stylesheet" href="{}">"#, escape_attr(&asset.uri));
        }

        let mut npm_scripts = String::new();
        for url in &config.npm_urls {
            let _ = writeln!(npm_scripts, r#"<script nonce="{nonce}" src="{}"></script>"#, escape_attr(url));
        }

        let mut module_scripts = String::new();
        for url in &config.module_urls {
            let _ = writeln!(
                module_scripts,
                r#"<script type="module" nonce="{nonce}" src="{}"></script>"#,
                escape_attr(url)
            );
        }

        let mut extra_scripts = String::new();
        for asset in config
            .js
            .iter()
            .filter_map(|path| self.resolver.resolve(self.base, path))
        {
            let _ = writeln!(extra_scripts, r#"<script nonce="{nonce}" src="{}"></script>"#, escape_attr(&asset.uri));
        }

        let initializer = config
            .initializer
            .as_deref()
            .and_then(|path| self.resolver.resolve(self.base, path));
        let initializer_script = initializer
            .as_ref()
            .map(|asset| {
                format!(
                    "<script type=\"module\" nonce=\"{nonce}\" src=\"{}\"></script>\n",
                    escape_attr(&asset.uri)
                )
            })
            .unwrap_or_default();
        let initializer_url = initializer
            .map(|asset| serde_json::Value::String(asset.uri))
            .unwrap_or(serde_json::Value::Null);

        let initial_text = serde_json::Value::String(initial_text.to_owned()).to_string();

        let values = BTreeMap::from([
            ("NONCE", nonce.to_owned()),
            ("MD_CDN", escape_attr(self.markdown_it_cdn)),
            ("CSS_LINKS", css_links),
            ("NPM_SCRIPTS", npm_scripts),
            ("MODULE_SCRIPTS", module_scripts),
            ("EXTRA_SCRIPTS", extra_scripts),
            ("INITIALIZER_SCRIPT", initializer_script),
            ("INITIALIZER_URL", escape_for_single_quoted_js(&initializer_url.to_string())),
            ("OPTIONS", escape_for_single_quoted_js(&config.options_json())),
            ("INITIAL_TEXT", escape_for_single_quoted_js(&initial_text)),
        ]);

        substitute(PREVIEW_TEMPLATE, &values)
    }
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// Replaces every known `%%NAME%%` placeholder, leaving unknown ones as is.
fn substitute(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("%%") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let placeholder = after
            .find("%%")
            .and_then(|end| values.get(&after[..end]).map(|value| (end, value)));
        match placeholder {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("%%");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Makes a JSON text safe to embed in a single-quoted JS string literal
/// inside a `<script>` element.
fn escape_for_single_quoted_js(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace("</", "<\\/")
        .replace("<!--", "<\\!--")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::LocalAssetResolver;

    fn render(config: &PreviewConfig, text: &str) -> String {
        Scaffold {
            config,
            base: Path::new("/work"),
            resolver: &LocalAssetResolver::default(),
            markdown_it_cdn: DEFAULT_MARKDOWN_IT_CDN,
        }
        .render_with_nonce(text, "NONCE123")
    }

    #[test]
    fn test_substitute_single_pass() {
        let values = BTreeMap::from([("A", "%%B%%".to_string()), ("B", "b".to_string())]);
        assert_eq!(substitute("x %%A%% y %%B%%", &values), "x %%B%% y b");
        assert_eq!(substitute("50%% of %%A", &values), "50%% of %%A");
        assert_eq!(substitute("%%UNKNOWN%% %%B%%", &values), "%%UNKNOWN%% b");
    }

    #[test]
    fn test_escape_for_single_quoted_js() {
        assert_eq!(
            escape_for_single_quoted_js(r#"{"a":"it's \"x\"</script>"}"#),
            r#"{"a":"it\'s \\"x\\"<\/script>"}"#
        );
    }

    #[test]
    fn test_comment_opener_cannot_escape_inline_script() {
        let html = render(&PreviewConfig::default(), "<!-- <script> -->");
        assert!(!html.contains("<!-- <script>"));
        assert!(html.contains(r"<\!-- <script> --"));
        assert_eq!(escape_for_single_quoted_js("a<!--b"), r"a<\!--b");
    }

    #[test]
    fn test_empty_config_scaffold() {
        let html = render(&PreviewConfig::default(), "# hi");
        assert!(html.contains(r#"<script nonce="NONCE123" src="https://cdn.jsdelivr.net/npm/markdown-it/dist/markdown-it.min.js"></script>"#));
        assert!(html.contains(r##"JSON.parse('"# hi"')"##));
        assert!(html.contains("JSON.parse('{}')"));
        assert!(html.contains("JSON.parse('null')"));
        assert!(!html.contains("%%NONCE%%"));
        assert!(!html.contains("rel=\"stylesheet\""));
    }

    #[test]
    fn test_configured_assets_are_injected() {
        let config = PreviewConfig::from_slice(
            br#"{
                "css": ["theme.css", "../escape.css"],
                "js": ["lib/extra.js"],
                "npmUrls": ["https://cdn.example.com/container.js"],
                "moduleUrls": ["https://cdn.example.com/mermaid.mjs"],
                "initializer": "init.js",
                "options": {"html": true}
            }"#,
        )
        .unwrap();
        let html = render(&config, "text with 'quotes' and %%OPTIONS%%");

        assert!(html.contains(r#"<link rel="stylesheet" href="/assets/theme.css">"#));
        assert!(!html.contains("escape.css"));
        assert!(html.contains(r#"<script nonce="NONCE123" src="/assets/lib/extra.js"></script>"#));
        assert!(html.contains(r#"<script nonce="NONCE123" src="https://cdn.example.com/container.js"></script>"#));
        assert!(html.contains(r#"<script type="module" nonce="NONCE123" src="https://cdn.example.com/mermaid.mjs"></script>"#));
        assert!(html.contains(r#"<script type="module" nonce="NONCE123" src="/assets/init.js"></script>"#));
        assert!(html.contains(r#"JSON.parse('"/assets/init.js"')"#));
        assert!(html.contains(r#"JSON.parse('{"html":true}')"#));
        assert!(html.contains(r#"JSON.parse('"text with \'quotes\' and %%OPTIONS%%"')"#));
    }

    #[test]
    fn test_nonce_is_alphanumeric() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}

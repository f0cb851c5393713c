//! Bundled renderer producing files from Tera templates.

use std::error::Error as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tera::{Context, Tera};
use tracing::debug;

use crate::scheduler::job::RenderPayload;

use super::{RenderError, Renderer};

/// Renders `payload.template` with Tera against `payload.data` and writes the
/// result to `output_dir/output_filename`.
///
/// The template is looked up by name in `template_dir` when one is set and
/// the file exists; otherwise the template string itself is the source. A
/// `css_file` is read and inlined as a `<style>` block, and is also exposed
/// to the template as `css`.
#[derive(Debug, Clone)]
pub struct TeraFileRenderer {
    output_dir: PathBuf,
    template_dir: Option<PathBuf>,
    autoescape: bool,
}

impl TeraFileRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            template_dir: None,
            autoescape: true,
        }
    }

    /// Resolves template names and CSS paths relative to `dir`.
    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(dir.into());
        self
    }

    pub fn with_autoescape(mut self, autoescape: bool) -> Self {
        self.autoescape = autoescape;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match &self.template_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    async fn template_source(&self, template: &str) -> Result<String, RenderError> {
        if let Some(dir) = &self.template_dir {
            let path = dir.join(template);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| RenderError::failed(format!("{}: {}", path.display(), e)));
            }
        }
        Ok(template.to_string())
    }

    async fn stylesheet(&self, css_file: &str) -> Result<String, RenderError> {
        let path = self.resolve(css_file);
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            let message = format!("stylesheet {}: {}", path.display(), e);
            if e.kind() == std::io::ErrorKind::NotFound {
                RenderError::permanent(message)
            } else {
                RenderError::failed(message)
            }
        })
    }
}

/// Only a bare file name may be used as output.
fn check_output_filename(name: &str) -> Result<(), RenderError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(RenderError::permanent(format!(
            "output_filename '{}' must be a plain file name",
            name
        ))),
    }
}

/// Flattens a Tera error and its causes into one line.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn inline_css(html: String, css: &str) -> String {
    let style = format!("<style>\n{}\n</style>\n", css);
    match html.find("</head>") {
        Some(at) => {
            let mut out = html;
            out.insert_str(at, &style);
            out
        }
        None => style + &html,
    }
}

#[async_trait]
impl Renderer for TeraFileRenderer {
    async fn render(&self, payload: &RenderPayload) -> Result<PathBuf, RenderError> {
        check_output_filename(&payload.output_filename)?;

        let source = self.template_source(&payload.template).await?;
        let mut context = Context::from_value(payload.data.clone())
            .map_err(|e| RenderError::permanent(format!("data must be an object: {}", describe(&e))))?;

        let css = match &payload.css_file {
            Some(css_file) => Some(self.stylesheet(css_file).await?),
            None => None,
        };
        if let Some(css) = &css {
            context.insert("css", css);
        }

        let mut rendered = Tera::one_off(&source, &context, self.autoescape)
            .map_err(|e| RenderError::permanent(describe(&e)))?;
        if let Some(css) = &css {
            rendered = inline_css(rendered, css);
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| RenderError::failed(format!("{}: {}", self.output_dir.display(), e)))?;
        let output = self.output_dir.join(&payload.output_filename);
        tokio::fs::write(&output, rendered)
            .await
            .map_err(|e| RenderError::failed(format!("{}: {}", output.display(), e)))?;

        debug!(output = %output.display(), "Rendered document");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_render_inline_template() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = TeraFileRenderer::new(dir.path());
        let payload = RenderPayload::new("<p>Hello {{ name }}</p>", json!({"name": "Ada"}), "hello.html");

        let path = renderer.render(&payload).await.unwrap();

        assert_eq!(path, dir.path().join("hello.html"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "<p>Hello Ada</p>");
    }

    #[tokio::test]
    async fn test_render_named_template_with_css() {
        let templates = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(
            templates.path().join("invoice.html"),
            "<html><head></head><body>{{ total }}</body></html>",
        )
        .unwrap();
        std::fs::write(templates.path().join("style.css"), "body { color: red; }").unwrap();

        let renderer = TeraFileRenderer::new(out.path()).with_template_dir(templates.path());
        let payload = RenderPayload::new("invoice.html", json!({"total": 42}), "invoice-1.html")
            .with_css_file("style.css");

        let path = renderer.render(&payload).await.unwrap();
        let html = std::fs::read_to_string(path).unwrap();

        assert!(html.contains("<head><style>"));
        assert!(html.contains("color: red"));
        assert!(html.contains("<body>42</body>"));
    }

    #[tokio::test]
    async fn test_broken_template_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = TeraFileRenderer::new(dir.path());
        let payload = RenderPayload::new("{% if %}", json!({"a": 1}), "broken.html");

        let err = renderer.render(&payload).await.unwrap_err();

        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_stylesheet_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = TeraFileRenderer::new(dir.path()).with_template_dir(dir.path());
        let payload =
            RenderPayload::new("x", json!({"a": 1}), "x.html").with_css_file("missing.css");

        let err = renderer.render(&payload).await.unwrap_err();

        assert!(matches!(err, RenderError::Permanent(_)));
    }

    #[test]
    fn test_output_filename_must_be_plain() {
        assert!(check_output_filename("report.pdf").is_ok());
        assert!(check_output_filename("../escape.pdf").is_err());
        assert!(check_output_filename("nested/report.pdf").is_err());
        assert!(check_output_filename("/abs.pdf").is_err());
    }
}

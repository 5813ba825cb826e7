//! Renders a chart archive's templates against a values tree (spec §4.7
//! step 3). Grounded on qovery-engine's `Tera::default()` +
//! `add_raw_template` + `Context` pattern used throughout
//! `infrastructure/helm_charts/*` (e.g. `nginx_ingress_chart.rs`), here
//! applied to every `templates/*.yaml` entry of an extracted chart archive
//! instead of a single inline override snippet, with the whole parsed values
//! tree as the template context instead of a handful of inserted scalars.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use serde_yaml::Value as YamlValue;
use tera::{Context, Tera};
use thiserror::Error;

use crate::errors::ErrorClass;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("chart archive is not a valid gzip tarball: {0}")]
    InvalidArchive(#[from] std::io::Error),

    #[error("template `{0}` failed to parse: {1}")]
    TemplateParse(String, #[source] tera::Error),

    #[error("template `{0}` failed to render: {1}")]
    TemplateRender(String, #[source] tera::Error),

    #[error("values tree could not be used as a template context: {0}")]
    InvalidValues(#[source] tera::Error),

    #[error("rendered object could not be converted back to JSON: {0}")]
    InvalidRenderedJson(#[from] serde_json::Error),

    #[error("rendered template `{0}` is not valid YAML: {1}")]
    InvalidRenderedYaml(String, #[source] serde_yaml::Error),

    #[error("chart render exceeded its configured deadline")]
    Timeout,
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RenderError::InvalidRenderedJson(_) => ErrorClass::Structural,
            RenderError::Timeout => ErrorClass::TransientInfra,
            _ => ErrorClass::Declarative,
        }
    }
}

/// One rendered cluster object extracted from the chart's `templates/`.
pub struct RenderedObject {
    pub template_path: String,
    pub content: serde_json::Value,
}

pub struct Renderer;

impl Renderer {
    pub fn new() -> Self {
        Renderer
    }

    /// `archive` is the raw `.tgz` bytes fetched by [`super::fetcher::ChartFetcher`].
    pub fn render(&self, archive: &[u8], values: &serde_json::Value) -> Result<Vec<RenderedObject>, RenderError> {
        let templates = extract_templates(archive)?;

        let mut tera = Tera::default();
        for (path, body) in &templates {
            tera.add_raw_template(path, body)
                .map_err(|e| RenderError::TemplateParse(path.clone(), e))?;
        }

        let context = Context::from_serialize(values).map_err(RenderError::InvalidValues)?;

        let mut rendered = Vec::new();
        for path in templates.keys() {
            let output = tera
                .render(path, &context)
                .map_err(|e| RenderError::TemplateRender(path.clone(), e))?;
            for doc in split_yaml_documents(&output) {
                if doc.trim().is_empty() {
                    continue;
                }
                let yaml: YamlValue = serde_yaml::from_str(doc)
                    .map_err(|e| RenderError::InvalidRenderedYaml(path.clone(), e))?;
                if yaml.is_null() {
                    continue;
                }
                let content = serde_json::to_value(&yaml)?;
                rendered.push(RenderedObject {
                    template_path: path.clone(),
                    content,
                });
            }
        }
        Ok(rendered)
    }

    /// Runs [`Renderer::render`] on the blocking pool under a deadline (spec
    /// §5's per-operation render timeout), since `render` itself is
    /// CPU-bound and synchronous. Exceeding the deadline yields
    /// [`RenderError::Timeout`], classified retryable per spec §7.
    pub async fn render_with_timeout(
        &self,
        archive: Vec<u8>,
        values: serde_json::Value,
        timeout: Duration,
    ) -> Result<Vec<RenderedObject>, RenderError> {
        let task = tokio::task::spawn_blocking(move || Renderer::new().render(&archive, &values));
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.expect("render task panicked"),
            Err(_elapsed) => Err(RenderError::Timeout),
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Renderer::new()
    }
}

/// CRD manifests (`crds/*.yaml`) are extracted alongside `templates/*.yaml`
/// so `ChartEngine::render_and_postrender` can gate their inclusion on
/// `crds.allowUpgrade` (spec P6) rather than have them silently dropped here
/// regardless of that flag.
fn extract_templates(archive: &[u8]) -> Result<BTreeMap<String, String>, std::io::Error> {
    let decoder = flate2::read::GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);
    let mut templates = BTreeMap::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let in_templates_or_crds = path.contains("/templates/") || path.contains("/crds/");
        if !in_templates_or_crds || !(path.ends_with(".yaml") || path.ends_with(".yml") || path.ends_with(".tpl")) {
            continue;
        }
        let mut body = String::new();
        entry.read_to_string(&mut body)?;
        templates.insert(path, body);
    }
    Ok(templates)
}

fn split_yaml_documents(rendered: &str) -> impl Iterator<Item = &str> {
    rendered.split("\n---").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn renders_a_template_with_the_values_context() {
        let archive = build_archive(&[(
            "demo/templates/configmap.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ name }}\n",
        )]);
        let rendered = Renderer::new().render(&archive, &json!({"name": "web-config"})).unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].content["metadata"]["name"], "web-config");
    }

    #[test]
    fn ignores_files_outside_templates_dir() {
        let archive = build_archive(&[("demo/Chart.yaml", "name: demo\n")]);
        let rendered = Renderer::new().render(&archive, &json!({})).unwrap();
        assert!(rendered.is_empty());
    }

    #[test]
    fn extracts_crds_alongside_templates() {
        let archive = build_archive(&[
            ("demo/templates/deployment.yaml", "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: demo\n"),
            (
                "demo/crds/widgets.yaml",
                "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n",
            ),
        ]);
        let rendered = Renderer::new().render(&archive, &json!({})).unwrap();
        assert_eq!(rendered.len(), 2);
        assert!(rendered.iter().any(|o| o.template_path.contains("/crds/") && o.content["kind"] == "CustomResourceDefinition"));
    }

    #[tokio::test]
    async fn render_with_timeout_fails_fast_on_a_zero_deadline() {
        let archive = build_archive(&[("demo/templates/configmap.yaml", "kind: ConfigMap\n")]);
        let result = Renderer::new().render_with_timeout(archive, json!({}), Duration::from_nanos(0)).await;
        assert!(matches!(result, Err(RenderError::Timeout)));
    }
}

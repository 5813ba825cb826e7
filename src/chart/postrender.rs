//! Merges declared patches onto a chart's rendered objects (spec §4.7 step
//! 4). A patch's `@ignore(conflict)` metadata tree travels with its content
//! so that a field introduced purely by a patch is stripped from the apply
//! payload exactly like a field ignored on a hand-written manifest
//! (`model::meta::MetaNode::strip`, shared with [`crate::apply::ApplyClient`]).

use serde_json::Value;

use crate::model::{patch_key, MetaNode, Patches};

pub struct RenderedAndPatched {
    pub content: Value,
    pub metadata: MetaNode,
}

pub struct PostRenderer;

impl PostRenderer {
    pub fn new() -> Self {
        PostRenderer
    }

    pub fn apply(&self, rendered: Vec<super::render::RenderedObject>, patches: &Patches) -> Vec<RenderedAndPatched> {
        rendered
            .into_iter()
            .map(|object| self.apply_one(object, patches))
            .collect()
    }

    fn apply_one(&self, object: super::render::RenderedObject, patches: &Patches) -> RenderedAndPatched {
        let mut content = object.content;
        let api_version = content.get("apiVersion").and_then(Value::as_str).unwrap_or("").to_string();
        let kind = content.get("kind").and_then(Value::as_str).unwrap_or("").to_string();
        let name = content
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let namespace = content
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str);

        let key = patch_key(&api_version, &kind, namespace, &name);
        match patches.get(&key) {
            Some(patch) => {
                json_patch::merge(&mut content, &patch.content);
                RenderedAndPatched {
                    content,
                    metadata: patch.metadata.clone(),
                }
            }
            None => RenderedAndPatched {
                content,
                metadata: MetaNode::default(),
            },
        }
    }
}

impl Default for PostRenderer {
    fn default() -> Self {
        PostRenderer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::render::RenderedObject;
    use crate::model::ExtendedUnstructured;
    use serde_json::json;

    #[test]
    fn merges_a_matching_patch_onto_the_rendered_object() {
        let rendered = vec![RenderedObject {
            template_path: "demo/templates/deploy.yaml".to_string(),
            content: json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "spec": {"replicas": 1},
            }),
        }];
        let mut patches = Patches::new();
        patches.insert(
            patch_key("apps/v1", "Deployment", None, "web"),
            ExtendedUnstructured {
                content: json!({"spec": {"replicas": 3}}),
                metadata: MetaNode::default(),
            },
        );

        let result = PostRenderer::new().apply(rendered, &patches);
        assert_eq!(result[0].content["spec"]["replicas"], 3);
    }

    #[test]
    fn leaves_unmatched_objects_untouched() {
        let rendered = vec![RenderedObject {
            template_path: "demo/templates/deploy.yaml".to_string(),
            content: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}}),
        }];
        let result = PostRenderer::new().apply(rendered, &Patches::new());
        assert_eq!(result[0].content["kind"], "ConfigMap");
    }
}

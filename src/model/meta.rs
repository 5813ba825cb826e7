//! The "ExtendedUnstructured" pair: a content tree (plain `serde_json::Value`)
//! plus a parallel metadata tree recording per-field attribute annotations.
//! Traversed in lockstep with the content tree by both `ApplyClient` (payload
//! stripping) and the chart engine's `PostRenderer` (patch metadata flow-through).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attributes recorded on a single field. Currently only conflict-ignore,
/// per spec §3 ("metadata... currently only 'ignore on conflict'").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub ignore_on_conflict: bool,
}

/// Recursive shadow of a content tree. Every variant carries its own
/// [`FieldMeta`] so a branch or a whole list can be marked ignored directly
/// (`@ignore(conflict)` on a sub-object or on a list field), not only a
/// scalar leaf. A missing key in a `Branch` or a missing index in a `List`
/// means "no annotations at that path" — it is never an error to look one up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MetaNode {
    Leaf(FieldMeta),
    Branch {
        #[serde(default)]
        meta: FieldMeta,
        children: BTreeMap<String, MetaNode>,
    },
    List {
        #[serde(default)]
        meta: FieldMeta,
        items: Vec<MetaNode>,
    },
}

impl Default for MetaNode {
    fn default() -> Self {
        MetaNode::Branch {
            meta: FieldMeta::default(),
            children: BTreeMap::new(),
        }
    }
}

impl MetaNode {
    pub fn leaf_ignored() -> Self {
        MetaNode::Leaf(FieldMeta { ignore_on_conflict: true })
    }

    pub fn own_meta(&self) -> &FieldMeta {
        match self {
            MetaNode::Leaf(m) => m,
            MetaNode::Branch { meta, .. } => meta,
            MetaNode::List { meta, .. } => meta,
        }
    }

    /// True when this node itself (not a descendant) carries `@ignore(conflict)`.
    pub fn is_ignored(&self) -> bool {
        self.own_meta().ignore_on_conflict
    }

    pub fn child(&self, key: &str) -> Option<&MetaNode> {
        match self {
            MetaNode::Branch { children, .. } => children.get(key),
            _ => None,
        }
    }

    pub fn index(&self, i: usize) -> Option<&MetaNode> {
        match self {
            MetaNode::List { items, .. } => items.get(i),
            _ => None,
        }
    }

    pub fn set_child(&mut self, key: &str, node: MetaNode) {
        if let MetaNode::Branch { children, .. } = self {
            children.insert(key.to_string(), node);
        } else {
            let mut children = BTreeMap::new();
            children.insert(key.to_string(), node);
            *self = MetaNode::Branch {
                meta: FieldMeta::default(),
                children,
            };
        }
    }

    pub fn mark_ignored(&mut self) {
        match self {
            MetaNode::Leaf(m) => m.ignore_on_conflict = true,
            MetaNode::Branch { meta, .. } => meta.ignore_on_conflict = true,
            MetaNode::List { meta, .. } => meta.ignore_on_conflict = true,
        }
    }

    /// Strip every field whose metadata marks it `ignore_on_conflict`,
    /// honoring the parent-chain rule of spec §4.4: a field is stripped only
    /// if its parent chain is not itself ignored (handled by the caller
    /// short-circuiting on `is_ignored()` before recursing into a subtree),
    /// and a list-level ignore removes the whole list. Per-element ignore
    /// inside a non-ignored list is also honored (permissive reading, see
    /// DESIGN.md's Open Question decision).
    pub fn strip(&self, content: &mut Value) {
        if self.is_ignored() {
            *content = Value::Null;
            return;
        }
        match (self, content) {
            (MetaNode::Branch { children, .. }, Value::Object(obj)) => {
                let mut to_remove = Vec::new();
                for (key, value) in obj.iter_mut() {
                    if let Some(child_meta) = children.get(key) {
                        if child_meta.is_ignored() {
                            to_remove.push(key.clone());
                        } else {
                            child_meta.strip(value);
                        }
                    }
                }
                for key in to_remove {
                    obj.remove(&key);
                }
            }
            (MetaNode::List { items, .. }, Value::Array(arr)) => {
                for (item_meta, item_value) in items.iter().zip(arr.iter_mut()) {
                    item_meta.strip(item_value);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_ignored_leaf_but_keeps_siblings() {
        let mut content = json!({"foo": "bar", "baz": 1});
        let mut children = BTreeMap::new();
        children.insert("foo".to_string(), MetaNode::leaf_ignored());
        let meta = MetaNode::Branch {
            meta: FieldMeta::default(),
            children,
        };
        meta.strip(&mut content);
        assert_eq!(content, json!({"baz": 1}));
    }

    #[test]
    fn list_level_ignore_removes_whole_list() {
        let mut content = json!({"items": [1, 2, 3]});
        let mut children = BTreeMap::new();
        let mut list_meta = MetaNode::List {
            meta: FieldMeta::default(),
            items: vec![],
        };
        list_meta.mark_ignored();
        children.insert("items".to_string(), list_meta);
        let meta = MetaNode::Branch {
            meta: FieldMeta::default(),
            children,
        };
        meta.strip(&mut content);
        assert_eq!(content, json!({}));
    }

    #[test]
    fn per_element_ignore_inside_list_strips_only_that_element() {
        let mut content = json!({"items": [{"a": 1, "b": 2}, {"a": 3, "b": 4}]});
        let elem0_children = {
            let mut m = BTreeMap::new();
            m.insert("a".to_string(), MetaNode::leaf_ignored());
            m
        };
        let elem0 = MetaNode::Branch {
            meta: FieldMeta::default(),
            children: elem0_children,
        };
        let list_meta = MetaNode::List {
            meta: FieldMeta::default(),
            items: vec![elem0, MetaNode::default()],
        };
        let mut children = BTreeMap::new();
        children.insert("items".to_string(), list_meta);
        let meta = MetaNode::Branch {
            meta: FieldMeta::default(),
            children,
        };
        meta.strip(&mut content);
        assert_eq!(content, json!({"items": [{"b": 2}, {"a": 3, "b": 4}]}));
    }
}

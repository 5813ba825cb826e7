use serde::Deserialize;
use serde_json::Value;

/// Kinds a compiled field can resolve to (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Struct,
    List,
    String,
    Bytes,
    Int,
    Float,
    Bool,
    Bottom,
}

/// An attribute found on a field, e.g. `@update(strategy=semver, constraint="<5.0.0")`.
/// Positional and keyed args are both recorded; keyed lookup is a convenience
/// over the raw pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub args: Vec<AttrArg>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AttrArg {
    Positional(String),
    Keyed { key: String, value: String },
}

impl Attribute {
    pub fn keyed(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            AttrArg::Keyed { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.args
            .iter()
            .filter_map(|a| match a {
                AttrArg::Positional(v) => Some(v.as_str()),
                _ => None,
            })
            .nth(index)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedNode {
    pub name: String,
    pub node: RawNode,
}

/// A single node of the compiler's enriched export: a field's kind, its
/// source line, its attributes, and (depending on kind) its scalar value,
/// ordered struct fields, list items, or disjunction default.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNode {
    pub kind: FieldKind,
    #[serde(default)]
    pub line: usize,
    #[serde(default)]
    pub attrs: Vec<Attribute>,
    #[serde(default)]
    pub scalar: Option<Value>,
    #[serde(default)]
    pub fields: Vec<NamedNode>,
    #[serde(default)]
    pub items: Vec<RawNode>,
    #[serde(default)]
    pub default: Option<Box<RawNode>>,
}

/// Borrowed view over a [`RawNode`] implementing the `CompiledValue` contract
/// of spec §4.1: ordered field iteration, kind, default resolution for
/// disjunctions, attribute enumeration, source line, and path lookup.
#[derive(Clone, Copy)]
pub struct CompiledValue<'a> {
    node: &'a RawNode,
}

impl<'a> CompiledValue<'a> {
    pub fn new(node: &'a RawNode) -> Self {
        CompiledValue { node }
    }

    pub fn kind(&self) -> FieldKind {
        self.node.kind
    }

    pub fn line(&self) -> usize {
        self.node.line
    }

    pub fn attrs(&self) -> &'a [Attribute] {
        &self.node.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&'a Attribute> {
        self.node.attrs.iter().find(|a| a.name == name)
    }

    /// Top-level (or nested struct) fields, preserving source declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&'a str, CompiledValue<'a>)> {
        self.node
            .fields
            .iter()
            .map(|f| (f.name.as_str(), CompiledValue::new(&f.node)))
    }

    pub fn field(&self, name: &str) -> Option<CompiledValue<'a>> {
        self.node.fields.iter().find(|f| f.name == name).map(|f| CompiledValue::new(&f.node))
    }

    pub fn items(&self) -> impl Iterator<Item = CompiledValue<'a>> {
        self.node.items.iter().map(CompiledValue::new)
    }

    /// Resolves a disjunction's default when this node is `Bottom` carrying
    /// a `default`. Returns `None` when there is no default (caller should
    /// then omit the field entirely, per §4.2's tie-break policy).
    pub fn resolved(&self) -> Option<CompiledValue<'a>> {
        match self.node.kind {
            FieldKind::Bottom => self.node.default.as_deref().map(CompiledValue::new),
            _ => Some(*self),
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.node.scalar.as_ref()?.as_str()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.node.scalar.as_ref()?.as_i64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.node.scalar.as_ref()?.as_f64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.node.scalar.as_ref()?.as_bool()
    }

    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        use base64::Engine;
        let s = self.as_str()?;
        base64::engine::general_purpose::STANDARD.decode(s).ok()
    }

    /// Dotted path lookup, e.g. `"metadata.name"`.
    pub fn lookup_path(&self, path: &str) -> Option<CompiledValue<'a>> {
        let mut current = *self;
        for segment in path.split('.') {
            current = current.field(segment)?;
        }
        Some(current)
    }
}

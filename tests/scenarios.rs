//! End-to-end exercises of the concrete scenarios in spec §8, built against
//! the Builder and DependencyGraph's pure, I/O-free contract: a
//! hand-constructed `CompiledPackage` stands in for the external `cue`
//! compiler's output, exactly the substitution spec §4.1 is built to allow.

use declcd_rs::decl_compiler::{AttrArg, Attribute, CompiledPackage, FieldKind, NamedNode, RawNode};
use declcd_rs::graph::{DependencyGraph, GraphError};
use declcd_rs::model::{Instance, ManifestInstance, UpdateTarget};
use serde_json::{json, Value};

fn leaf(kind: FieldKind, scalar: Value) -> RawNode {
    RawNode {
        kind,
        line: 0,
        attrs: vec![],
        scalar: Some(scalar),
        fields: vec![],
        items: vec![],
        default: None,
    }
}

fn string_node(s: &str) -> RawNode {
    leaf(FieldKind::String, Value::String(s.to_string()))
}

fn bool_node(b: bool) -> RawNode {
    leaf(FieldKind::Bool, Value::Bool(b))
}

fn struct_node(fields: Vec<(&str, RawNode)>) -> RawNode {
    RawNode {
        kind: FieldKind::Struct,
        line: 0,
        attrs: vec![],
        scalar: None,
        fields: fields.into_iter().map(|(name, node)| NamedNode { name: name.to_string(), node }).collect(),
        items: vec![],
        default: None,
    }
}

fn list_node(items: Vec<RawNode>) -> RawNode {
    RawNode {
        kind: FieldKind::List,
        line: 0,
        attrs: vec![],
        scalar: None,
        fields: vec![],
        items,
        default: None,
    }
}

fn with_attrs(mut node: RawNode, attrs: Vec<Attribute>) -> RawNode {
    node.attrs = attrs;
    node
}

fn ignore_conflict_attr() -> Attribute {
    Attribute {
        name: "ignore".to_string(),
        args: vec![AttrArg::Positional("conflict".to_string())],
    }
}

fn update_attr(strategy: &str, constraint: &str) -> Attribute {
    Attribute {
        name: "update".to_string(),
        args: vec![
            AttrArg::Keyed { key: "strategy".to_string(), value: strategy.to_string() },
            AttrArg::Keyed { key: "constraint".to_string(), value: constraint.to_string() },
        ],
    }
}

fn manifest_field(id: &str, dependencies: Vec<&str>, content: RawNode) -> RawNode {
    let mut fields = vec![("type", string_node("Manifest")), ("id", string_node(id))];
    if !dependencies.is_empty() {
        fields.push(("dependencies", list_node(dependencies.into_iter().map(string_node).collect())));
    }
    fields.push(("content", content));
    struct_node(fields)
}

/// Scenario 2 (spec §8): a namespace, a secret depending on it with
/// `data.foo @ignore(conflict)`, and a `HelmRelease` carrying a
/// chart-targeted `@update`. Expects three instances in declared order, the
/// secret's ignore annotation surviving on its metadata tree, and exactly
/// one chart `UpdateInstruction` with the declared constraint and the
/// default `pr` integration.
#[test]
fn build_emits_three_instances_with_ignore_metadata_and_one_update_instruction() {
    let ns_content = struct_node(vec![
        ("apiVersion", string_node("v1")),
        ("kind", string_node("Namespace")),
        ("metadata", struct_node(vec![("name", string_node("ns"))])),
    ]);
    let ns_field = manifest_field("ns", vec![], ns_content);

    let secret_content = struct_node(vec![
        ("apiVersion", string_node("v1")),
        ("kind", string_node("Secret")),
        ("metadata", struct_node(vec![("name", string_node("secret"))])),
        ("data", struct_node(vec![("foo", with_attrs(string_node("bar"), vec![ignore_conflict_attr()]))])),
    ]);
    let secret_field = manifest_field("secret", vec!["ns"], secret_content);

    let chart_field = with_attrs(
        struct_node(vec![
            ("name", string_node("test")),
            ("repoURL", string_node("oci://test")),
            ("version", string_node("4.9.9")),
        ]),
        vec![update_attr("semver", "<5.0.0")],
    );
    let release_field = struct_node(vec![
        ("type", string_node("HelmRelease")),
        ("id", string_node("test")),
        ("name", string_node("test")),
        ("namespace", string_node("default")),
        ("chart", chart_field),
        ("values", struct_node(vec![])),
        ("crds", struct_node(vec![("allowUpgrade", bool_node(false))])),
    ]);

    let root = struct_node(vec![("ns", ns_field), ("secret", secret_field), ("test", release_field)]);
    let pkg = CompiledPackage { root };

    let result = declcd_rs::builder::Builder::new("apps/demo.cue").build(&pkg).expect("build succeeds");

    assert_eq!(result.instances.len(), 3);
    let ids: Vec<&str> = result.instances.iter().map(Instance::id).collect();
    assert_eq!(ids, vec!["ns", "secret", "test"]);

    let Instance::Manifest(secret) = &result.instances[1] else {
        panic!("expected a Manifest instance for `secret`")
    };
    assert_eq!(secret.dependencies, vec!["ns".to_string()]);
    let data_meta = secret.metadata.child("data").and_then(|d| d.child("foo")).expect("data.foo metadata present");
    assert!(data_meta.is_ignored());

    assert_eq!(result.update_instructions.len(), 1);
    let instruction = &result.update_instructions[0];
    assert_eq!(instruction.constraint, "<5.0.0");
    assert_eq!(instruction.integration, declcd_rs::model::IntegrationMode::Pr);
    assert!(matches!(&instruction.target, UpdateTarget::ChartVersion { chart } if chart.version == "4.9.9"));
}

fn manifest(id: &str, deps: &[&str]) -> Instance {
    Instance::Manifest(ManifestInstance {
        id: id.to_string(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        content: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": id}}),
        metadata: Default::default(),
    })
}

/// Scenario 1 (spec §8): `prometheus` (no deps), `linkerd -> certmanager`,
/// `certmanager` (no deps), `emissary -> certmanager`, `keda -> prometheus`
/// sorts so `certmanager` precedes `linkerd`/`emissary` and `prometheus`
/// precedes `keda`; adding `certmanager -> linkerd` makes it cyclic.
#[test]
fn topological_sort_orders_dependencies_before_dependents_and_detects_the_introduced_cycle() {
    let mut graph = DependencyGraph::new();
    graph.insert(manifest("prometheus", &[])).unwrap();
    graph.insert(manifest("linkerd", &["certmanager"])).unwrap();
    graph.insert(manifest("certmanager", &[])).unwrap();
    graph.insert(manifest("emissary", &["certmanager"])).unwrap();
    graph.insert(manifest("keda", &["prometheus"])).unwrap();

    let sorted = graph.topological_sort().expect("dag sorts cleanly");
    let pos = |id: &str| sorted.iter().position(|i| i.id() == id).unwrap();
    assert!(pos("certmanager") < pos("linkerd"));
    assert!(pos("certmanager") < pos("emissary"));
    assert!(pos("prometheus") < pos("keda"));

    graph.delete("certmanager");
    graph
        .insert(Instance::Manifest(ManifestInstance {
            id: "certmanager".to_string(),
            dependencies: vec!["linkerd".to_string()],
            content: json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "certmanager"}}),
            metadata: Default::default(),
        }))
        .unwrap();

    assert!(matches!(graph.topological_sort(), Err(GraphError::CyclicDependency(_))));
}

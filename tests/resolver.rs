mod common;

use common::{index_with_repo, write_manifest};
use embermesh::resolver::{ComponentResolver, InitialComponent, ResolveError};
use rustc_hash::FxHashMap;
use tempfile::TempDir;

fn resolver_for(
    components: &[(&str, &str, &[&str], &[&str], &[&str])],
    defaults: &[(&str, &str)],
) -> (TempDir, ComponentResolver) {
    let base = TempDir::new().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    for (dir, name, depends, provides, mc_depends) in components {
        write_manifest(&repo, dir, name, depends, provides, mc_depends);
    }
    let index = index_with_repo(base.path(), &repo);
    let defaults_map: FxHashMap<String, String> = defaults
        .iter()
        .map(|(attr, name)| (attr.to_string(), name.to_string()))
        .collect();
    let resolver = ComponentResolver::from_index(&index, defaults_map).unwrap();
    (base, resolver)
}

fn names(resolution: &embermesh::resolver::Resolution) -> Vec<String> {
    resolution
        .ordered()
        .iter()
        .map(|r| r.component.name().to_string())
        .collect()
}

#[test]
fn single_component_no_dependencies() {
    let (_base, resolver) = resolver_for(&[("c1", "tests.single", &[], &["c1"], &[])], &[]);
    let resolution = resolver
        .resolve(&[InitialComponent::named("tests.single")])
        .unwrap();
    assert_eq!(names(&resolution), vec!["tests.single"]);
}

#[test]
fn two_component_chain_orders_provider_first() {
    let (_base, resolver) = resolver_for(
        &[
            ("a", "tests.a", &[], &["c1"], &[]),
            ("b", "tests.b", &["c1"], &["c2"], &[]),
        ],
        &[],
    );
    let resolution = resolver
        .resolve(&[InitialComponent::named("tests.b")])
        .unwrap();
    assert_eq!(names(&resolution), vec!["tests.a", "tests.b"]);
}

#[test]
fn cycle_is_fatal_and_rendered() {
    let (_base, resolver) = resolver_for(
        &[
            ("a", "tests.a", &["c2"], &["c1"], &[]),
            ("b", "tests.b", &["c1"], &["c2"], &[]),
        ],
        &[],
    );
    let err = resolver
        .resolve(&[
            InitialComponent::named("tests.a"),
            InitialComponent::named("tests.b"),
        ])
        .unwrap_err();
    let ResolveError::UnsatisfiableDependencies { cycles } = err else {
        panic!("expected UnsatisfiableDependencies, got: {err:?}");
    };
    assert!(!cycles.is_empty());
    let rendered: Vec<String> = cycles.iter().map(|chain| chain.join(" -> ")).collect();
    let all = rendered.join(" | ");
    assert!(all.contains("tests.a (Model Component)"));
    assert!(all.contains("tests.b (Model Component)"));
    assert!(all.contains("c1 (Attribute)"));
    assert!(all.contains("c2 (Attribute)"));
}

#[test]
fn default_selection_prefers_configured_provider() {
    let components: &[(&str, &str, &[&str], &[&str], &[&str])] = &[
        ("x", "tests.x", &[], &["p2"], &[]),
        ("y", "tests.y", &[], &["p2"], &[]),
        ("user", "tests.user", &["p2"], &[], &[]),
    ];
    let (_base, resolver) = resolver_for(components, &[("p2", "tests.y")]);
    let resolution = resolver
        .resolve(&[InitialComponent::named("tests.user")])
        .unwrap();
    let ordered = names(&resolution);
    assert!(ordered.contains(&"tests.y".to_string()));
    assert!(!ordered.contains(&"tests.x".to_string()));
}

#[test]
fn multiple_providers_without_default_is_fatal() {
    let components: &[(&str, &str, &[&str], &[&str], &[&str])] = &[
        ("x", "tests.x", &[], &["p2"], &[]),
        ("y", "tests.y", &[], &["p2"], &[]),
        ("user", "tests.user", &["p2"], &[], &[]),
    ];
    let (_base, resolver) = resolver_for(components, &[]);
    let err = resolver
        .resolve(&[InitialComponent::named("tests.user")])
        .unwrap_err();
    let ResolveError::NoDefaultProvider {
        attribute,
        candidates,
    } = err
    else {
        panic!("expected NoDefaultProvider, got: {err:?}");
    };
    assert_eq!(attribute, "p2");
    assert_eq!(candidates.len(), 2);
}

#[test]
fn no_provider_at_all_is_fatal() {
    let (_base, resolver) =
        resolver_for(&[("user", "tests.user", &["ghost"], &[], &[])], &[]);
    let err = resolver
        .resolve(&[InitialComponent::named("tests.user")])
        .unwrap_err();
    assert!(matches!(
        err,
        ResolveError::NoDefaultProvider { ref attribute, ref candidates }
            if attribute == "ghost" && candidates.is_empty()
    ));
}

#[test]
fn invalid_default_is_fatal() {
    let components: &[(&str, &str, &[&str], &[&str], &[&str])] = &[
        ("x", "tests.x", &[], &["p2"], &[]),
        ("y", "tests.y", &[], &["p2"], &[]),
        ("user", "tests.user", &["p2"], &[], &[]),
    ];
    // The configured default does not provide p2.
    let (_base, resolver) = resolver_for(components, &[("p2", "tests.user")]);
    let err = resolver
        .resolve(&[InitialComponent::named("tests.user")])
        .unwrap_err();
    assert!(matches!(err, ResolveError::InvalidDefaultProvider { .. }));
}

#[test]
fn transitive_component_requirements_are_expanded() {
    let (_base, resolver) = resolver_for(
        &[
            ("top", "tests.top", &[], &[], &["tests.mid"]),
            ("mid", "tests.mid", &[], &[], &["tests.leaf"]),
            ("leaf", "tests.leaf", &[], &[], &[]),
        ],
        &[],
    );
    let resolution = resolver
        .resolve(&[InitialComponent::named("tests.top")])
        .unwrap();
    let ordered = names(&resolution);
    assert_eq!(ordered.len(), 3);
    assert!(ordered.contains(&"tests.leaf".to_string()));
    assert!(ordered.contains(&"tests.mid".to_string()));
}

#[test]
fn missing_required_component_is_fatal() {
    let (_base, resolver) = resolver_for(
        &[("top", "tests.top", &[], &[], &["tests.ghost"])],
        &[],
    );
    let err = resolver
        .resolve(&[InitialComponent::named("tests.top")])
        .unwrap_err();
    let ResolveError::ComponentNotFound { name, required_by } = err else {
        panic!("expected ComponentNotFound, got: {err:?}");
    };
    assert_eq!(name, "tests.ghost");
    assert_eq!(required_by.as_deref(), Some("tests.top"));
}

#[test]
fn initial_list_order_is_preserved() {
    let (_base, resolver) = resolver_for(
        &[
            ("a", "tests.a", &[], &[], &[]),
            ("b", "tests.b", &[], &[], &[]),
            ("c", "tests.c", &[], &[], &[]),
        ],
        &[],
    );
    let resolution = resolver
        .resolve(&[
            InitialComponent::named("tests.c"),
            InitialComponent::named("tests.a"),
            InitialComponent::named("tests.b"),
        ])
        .unwrap();
    assert_eq!(names(&resolution), vec!["tests.c", "tests.a", "tests.b"]);
}

#[test]
fn resolution_is_deterministic_across_runs() {
    let components: &[(&str, &str, &[&str], &[&str], &[&str])] = &[
        ("a", "tests.a", &[], &["net"], &[]),
        ("b", "tests.b", &["net"], &["apps"], &[]),
        ("c", "tests.c", &["apps"], &[], &["tests.d"]),
        ("d", "tests.d", &[], &[], &[]),
    ];
    let (_base, resolver) = resolver_for(components, &[]);
    let initial = [InitialComponent::named("tests.c")];
    let first = names(&resolver.resolve(&initial).unwrap());
    for _ in 0..20 {
        assert_eq!(names(&resolver.resolve(&initial).unwrap()), first);
    }
}

#[test]
fn duplicates_require_the_flag() {
    let (_base, resolver) = resolver_for(&[("a", "tests.a", &[], &[], &[])], &[]);

    let suppressed = resolver
        .resolve(&[
            InitialComponent::named("tests.a"),
            InitialComponent::named("tests.a"),
        ])
        .unwrap();
    assert_eq!(suppressed.occurrences("tests.a"), 1);

    let duplicated = resolver
        .resolve(&[
            InitialComponent::named("tests.a"),
            InitialComponent {
                duplicate: true,
                ..InitialComponent::named("tests.a")
            },
        ])
        .unwrap();
    assert_eq!(duplicated.occurrences("tests.a"), 2);
    assert!(duplicated.first("tests.a").is_some());
}

#[test]
fn plugin_args_travel_with_the_component() {
    let (_base, resolver) = resolver_for(&[("a", "tests.a", &[], &[], &[])], &[]);
    let mut args = FxHashMap::default();
    args.insert("".to_string(), serde_json::json!(["one", "two"]));
    args.insert("mode".to_string(), serde_json::json!("fast"));
    let resolution = resolver
        .resolve(&[InitialComponent {
            plugin_args: args.clone(),
            ..InitialComponent::named("tests.a")
        }])
        .unwrap();
    assert_eq!(resolution.ordered()[0].plugin_args, args);
}

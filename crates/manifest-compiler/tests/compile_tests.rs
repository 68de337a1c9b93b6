//! End-to-end compiler tests: source text in, IR and diagnostics out.

use std::sync::{Arc, Mutex};

use manifest_compiler::prelude::*;
use manifest_ir::provenance::{compute_ir_hash, verify_ir_hash};
use manifest_ir::{ActionKind, Ir, PolicyAction, RelationshipKind};

const ORDERS: &str = r#"
module Sales {
    entity Customer {
        property name: string
        hasMany orders: Order
    }

    entity Order {
        property total: number = 0
        property status: string = "draft"
        versionProperty version
        versionAtProperty versionAt
        belongsTo customer: Customer

        constraint overrideable positiveTotal: self.total >= 0 "Total cannot be negative" {
            code: NEG_TOTAL,
            overridePolicy: managers
        }

        policy managers override: user.role == "manager"
        policy signedIn execute: user.id != null "Sign in first"

        command submit(note: string = "") emits OrderSubmitted {
            guard self.status == "draft"
            constraint warn bigOrder: self.total < 10000 { messageTemplate: `Large order ${self.total}` }
            mutate self.status = "submitted"
            publish Audit { note: note }
        }
    }

    event OrderSubmitted: "sales.orders" { id: string }
    store Order in memory
}
"#;

fn compile(source: &str) -> Ir {
    let out = compile_to_ir(source);
    assert!(
        !out.diagnostics.iter().any(|d| d.is_error()),
        "unexpected errors: {:?}",
        out.diagnostics
    );
    out.ir.expect("IR present when there are no errors")
}

// -- 1. Structure ---------------------------------------------------------------

#[test]
fn compiles_realistic_program() {
    let ir = compile(ORDERS);

    assert_eq!(ir.modules.len(), 1);
    assert_eq!(ir.modules[0].name, "Sales");
    assert_eq!(ir.entities.len(), 2);

    let order = ir.entity("Order").unwrap();
    assert_eq!(order.version_property.as_deref(), Some("version"));
    assert_eq!(order.version_at_property.as_deref(), Some("versionAt"));
    assert_eq!(order.relationship("customer").unwrap().kind, RelationshipKind::BelongsTo);
    assert_eq!(order.constraints[0].code, "NEG_TOTAL");
    assert_eq!(order.constraints[0].override_policy_ref.as_deref(), Some("managers"));

    let managers = ir.policy("managers").unwrap();
    assert_eq!(managers.action, PolicyAction::Override);
    assert_eq!(ir.policy("signedIn").unwrap().message.as_deref(), Some("Sign in first"));

    let submit = ir.command("submit", Some("Order")).unwrap();
    assert_eq!(submit.guards.len(), 1);
    assert_eq!(submit.constraints[0].name, "bigOrder");
    assert!(submit.constraints[0].message_template.is_some());
    assert_eq!(submit.actions[0].kind, ActionKind::Mutate);
    assert_eq!(submit.actions[1].kind, ActionKind::Publish);
    assert_eq!(submit.emits, vec!["OrderSubmitted"]);

    assert_eq!(ir.store_for("Order").unwrap().target, "memory");
    assert_eq!(ir.event("OrderSubmitted").unwrap().channel, "sales.orders");
}

#[test]
fn ir_json_roundtrip_keeps_hash_valid() {
    let ir = compile(ORDERS);
    let json = ir.to_json_pretty();
    let loaded = Ir::from_json_verified(&json).expect("hash verifies after reload");
    assert_eq!(loaded, ir);
}

// -- 2. Provenance --------------------------------------------------------------

#[test]
fn same_source_yields_same_ir_hash() {
    let a = compile(ORDERS);
    let b = compile(ORDERS);
    assert_eq!(a.provenance.ir_hash, b.provenance.ir_hash);
    assert_eq!(a.provenance.content_hash, b.provenance.content_hash);
}

#[test]
fn different_source_yields_different_ir_hash() {
    let a = compile("entity A { property x: number }");
    let b = compile("entity A { property y: number }");
    assert_ne!(a.provenance.ir_hash, b.provenance.ir_hash);
}

#[test]
fn untouched_ir_verifies_and_mutation_breaks_it() {
    let mut ir = compile(ORDERS);
    assert!(verify_ir_hash(&ir, None).valid);

    ir.entities[0].properties[0].name = "renamed".to_owned();
    assert!(!verify_ir_hash(&ir, None).valid);

    ir.provenance.ir_hash = compute_ir_hash(&ir);
    assert!(verify_ir_hash(&ir, None).valid);
}

// -- 3. Cache -------------------------------------------------------------------

#[test]
fn cached_compile_returns_cached_ir_without_diagnostics() {
    let cache = Arc::new(Mutex::new(IrCache::default()));
    let compiler = IrCompiler::with_cache(Arc::clone(&cache));
    let source = "entity A { hasMany items: Missing }";

    let first = compiler.compile(source, CompileOptions::default());
    assert_eq!(first.diagnostics.len(), 1, "dangling relationship warning");
    let second = compiler.compile(source, CompileOptions::default());
    assert!(second.diagnostics.is_empty());
    assert_eq!(second.ir, first.ir);

    let stats = cache.lock().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[test]
fn use_cache_false_bypasses_cache() {
    let cache = Arc::new(Mutex::new(IrCache::default()));
    let compiler = IrCompiler::with_cache(Arc::clone(&cache));
    let options = CompileOptions { use_cache: false };
    compiler.compile("entity A {}", options);
    compiler.compile("entity A {}", options);
    assert!(cache.lock().unwrap().is_empty());
}

#[test]
fn failed_compile_is_not_cached() {
    let cache = Arc::new(Mutex::new(IrCache::default()));
    let compiler = IrCompiler::with_cache(Arc::clone(&cache));
    let out = compiler.compile("entity {", CompileOptions::default());
    assert!(out.ir.is_none());
    assert!(cache.lock().unwrap().is_empty());
}

#[test]
fn separate_caches_do_not_interfere() {
    let a = IrCompiler::with_cache(Arc::new(Mutex::new(IrCache::default())));
    let b = IrCompiler::with_cache(Arc::new(Mutex::new(IrCache::default())));
    a.compile("entity A {}", CompileOptions::default());
    let hits = |c: &IrCompiler| c.cache().unwrap().lock().unwrap().stats().hits;
    b.compile("entity A {}", CompileOptions::default());
    assert_eq!(hits(&a), 0);
    assert_eq!(hits(&b), 0);
}

// -- 4. Constraint code scopes --------------------------------------------------

#[test]
fn duplicate_code_in_command_block_fails() {
    let out = compile_to_ir(
        r#"
        entity A {
            command go() {
                constraint one: true { code: X }
                constraint two: true { code: X }
            }
        }
        "#,
    );
    assert!(out.ir.is_none());
    let error = out.diagnostics.iter().find(|d| d.is_error()).unwrap();
    assert!(error.message.contains("'one'"));
    assert!(error.line.is_some());
}

#[test]
fn same_code_across_entities_compiles() {
    let ir = compile(
        r#"
        entity A { constraint a: true { code: SHARED } }
        entity B { constraint b: true { code: SHARED } }
        "#,
    );
    assert_eq!(ir.entities.len(), 2);
}

// -- 5. Diagnostics -------------------------------------------------------------

#[test]
fn multiple_parse_errors_are_reported_with_positions() {
    let out = compile_to_ir("entity A {\n  property entity: number\n  property ok: ?\n}\n");
    assert!(out.ir.is_none());
    let errors: Vec<_> = out.diagnostics.iter().filter(|d| d.is_error()).collect();
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert_eq!(errors[0].line, Some(2));
    assert_eq!(errors[1].line, Some(3));
}

// -- 6. Hostile input -----------------------------------------------------------

#[test]
fn pathologically_nested_expression_fails_cleanly() {
    let depth = 10_000;
    let source = format!("policy p: {}1{}", "(".repeat(depth), ")".repeat(depth));
    let out = compile_to_ir(&source);
    assert!(out.ir.is_none());
    assert!(out
        .diagnostics
        .iter()
        .any(|d| d.is_error() && d.message == "expression nested too deeply"));
}

#[test]
fn deeply_nested_arrays_and_objects_fail_cleanly() {
    let arrays = format!("policy p: {}1{}", "[".repeat(5_000), "]".repeat(5_000));
    assert!(compile_to_ir(&arrays).ir.is_none());

    let objects = format!("policy p: {}1{}", "{a: ".repeat(5_000), "}".repeat(5_000));
    assert!(compile_to_ir(&objects).ir.is_none());
}

#[test]
fn out_of_range_number_literal_is_an_error() {
    let out = compile_to_ir("policy p: 1e999 > 0");
    assert!(out.ir.is_none());
    assert!(out
        .diagnostics
        .iter()
        .any(|d| d.is_error() && d.message == "numeric literal out of range"));

    let store = compile_to_ir("entity A { property x: number }\nstore A in memory { limit: 1e400 }");
    assert!(store.ir.is_none());
}

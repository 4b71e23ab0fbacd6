use crate::error::{Error, ErrorKind, PathErrorReason};
use crate::eval::EvalOptions;
use crate::expr::{Expr, ExprTree, UnaryOp};
use crate::handle::{HandleError, Registry};
use crate::path::{Path, Segment};
use crate::value::{Kind, Scalar, Value};
use pretty_assertions::assert_eq;

// ── Shared fixture runners ──────────────────────────────────────────

/// Embed fixture files at compile time.
const EVAL_FIXTURES: &str = include_str!("../test-data/fixtures/eval.json");
const PARSE_ERROR_FIXTURES: &str = include_str!("../test-data/fixtures/parse-errors.json");

fn p(s: &str) -> Path {
    Path::parse(s).unwrap()
}

#[test]
fn test_fixture_eval() {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(EVAL_FIXTURES).unwrap();

    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let input = fixture["input"].as_str().unwrap();

        let tree = ExprTree::parse(input)
            .unwrap_or_else(|err| panic!("Fixture '{}': unexpected parse error: {}", name, err));
        let result = tree.evaluate(&Path::root());

        if let Some(kind) = fixture.get("error").and_then(|v| v.as_str()) {
            match result {
                Err(err) => assert_eq!(
                    err.kind().to_string(),
                    kind,
                    "Fixture '{}': wrong error kind for {}",
                    name,
                    err
                ),
                Ok(value) => panic!("Fixture '{}': expected {} error, got {}", name, kind, value),
            }
            continue;
        }

        let value = result
            .unwrap_or_else(|err| panic!("Fixture '{}': unexpected error: {}", name, err));
        let expected = Value::from_json(fixture["expected"].clone());
        assert_eq!(value, expected, "Fixture '{}': value mismatch", name);
    }
}

#[test]
fn test_fixture_parse_errors() {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(PARSE_ERROR_FIXTURES).unwrap();

    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let input = fixture["input"].as_str().unwrap();
        let line = fixture["line"].as_u64().unwrap() as usize;

        match ExprTree::parse(input) {
            Err(Error::Parse(err)) => {
                assert_eq!(err.begin.line, line, "Fixture '{}': {}", name, err);
                assert_eq!(err.code, "faml-parse-syntax-error");
            }
            Err(other) => panic!("Fixture '{}': expected a parse error, got {}", name, other),
            Ok(tree) => panic!("Fixture '{}': expected a parse error, got {:?}", name, tree),
        }
    }
}

// ── Parsing & positions ─────────────────────────────────────────────

#[test]
fn test_parse_error_column_counts_chars() {
    let err = match ExprTree::parse("name = \"é\" ?") {
        Err(Error::Parse(err)) => err,
        other => panic!("expected parse error, got {:?}", other),
    };
    assert_eq!(err.begin.line, 0);
    // `?` starts a conditional whose branch is missing
    assert_eq!(err.begin.column, 12);
}

#[test]
fn test_triple_quoted_and_raw_strings() {
    let value = crate::evaluate("a = \"\"\"\nline one\nline two\"\"\"\nb = 'no \\n escapes'").unwrap();
    assert_eq!(value.as_string(&p("a")).unwrap(), "line one\nline two");
    assert_eq!(value.as_string(&p("b")).unwrap(), "no \\n escapes");
}

#[test]
fn test_multiline_expression_inside_brackets() {
    let value = crate::evaluate("total = (\n  1 +\n  2\n)\nlist = [\n  1,\n  2,\n]").unwrap();
    assert_eq!(value.as_int(&p("total")).unwrap(), 3);
    assert_eq!(value.array_len(&p("list")).unwrap(), 2);
}

// ── Evaluation ──────────────────────────────────────────────────────

#[test]
fn test_override_before_evaluate() {
    let mut tree = ExprTree::parse(
        r#"
[hello]
value = 12
name = $"hello world {value + 12}"
"#,
    )
    .unwrap();
    tree.override_int(&p("hello.value"), 30).unwrap();
    let value = tree.evaluate(&Path::root()).unwrap();
    assert_eq!(value.as_string(&p("hello.name")).unwrap(), "hello world 42");
}

#[test]
fn test_evaluate_subpath_with_anchors() {
    let tree = ExprTree::parse(
        r#"
[hello]
value1 = 12
value2 = 13

[hello.test]
value3 = $"value1[{super.value1}], value2[{base.hello.value2}]"
"#,
    )
    .unwrap();
    let value3 = tree.evaluate(&p("hello.test.value3")).unwrap();
    assert_eq!(value3, Value::from("value1[12], value2[13]"));
}

#[test]
fn test_evaluate_inside_computed_value() {
    let tree = ExprTree::parse("servers = [{ port: 80 }] + [{ port: 81 }]").unwrap();
    assert_eq!(tree.evaluate(&p("servers[1].port")).unwrap(), Value::Int(81));

    match tree.evaluate(&p("servers[5].port")) {
        Err(Error::Path(err)) => {
            assert_eq!(err.segment, Segment::Index(5));
            assert_eq!(err.reason, PathErrorReason::IndexOutOfRange { len: 2 });
        }
        other => panic!("expected path error, got {:?}", other),
    }
}

#[test]
fn test_evaluation_is_deterministic() {
    let tree = ExprTree::parse("a = 2\nb = a * 3\nc = $\"{a}-{b}\"\nd = [a, b, c]").unwrap();
    let first = tree.evaluate(&Path::root()).unwrap();
    let second = tree.evaluate(&Path::root()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_string(), second.to_string());
}

#[test]
fn test_override_is_idempotent() {
    let mut once = ExprTree::parse("name = \"dev\"\nurl = $\"{name}.example.com\"").unwrap();
    once.override_string(&p("name"), "prod").unwrap();

    let mut twice = once.clone();
    twice.override_string(&p("name"), "prod").unwrap();

    assert_eq!(once, twice);
    let value = twice.evaluate(&Path::root()).unwrap();
    assert_eq!(value.as_string(&p("url")).unwrap(), "prod.example.com");
}

#[test]
fn test_override_inserts_missing_field() {
    let mut tree = ExprTree::parse("[server]\nhost = \"h\"").unwrap();
    tree.override_int(&p("server.port"), 8080).unwrap();
    let value = tree.evaluate(&Path::root()).unwrap();
    assert_eq!(value.map_keys(&p("server")).unwrap(), vec!["host", "port"]);

    let err = tree.override_int(&p("nope.port"), 1).unwrap_err();
    match err {
        Error::Path(err) => assert_eq!(err.segment, Segment::Field("nope".to_string())),
        other => panic!("expected path error, got {:?}", other),
    }
}

#[test]
fn test_reference_cycle() {
    let tree = ExprTree::parse("x = y\ny = x").unwrap();
    let err = tree.evaluate(&p("x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cycle);
    assert_eq!(err.kind().code(), 4);
}

#[test]
fn test_missing_path_names_failing_segment() {
    let tree = ExprTree::parse("name = \"x\"").unwrap();
    match tree.evaluate(&p("missing.path")) {
        Err(Error::Path(err)) => {
            assert_eq!(err.position, 0);
            assert_eq!(err.segment, Segment::Field("missing".to_string()));
            assert_eq!(err.reason, PathErrorReason::MissingField);
            assert!(err.resolved_prefix().is_root());
        }
        other => panic!("expected path error, got {:?}", other),
    }
}

#[test]
fn test_depth_limit() {
    let tree = ExprTree::parse("a = b\nb = c\nc = d\nd = 1").unwrap();
    let shallow = EvalOptions { max_depth: 2 };
    match tree.evaluate_with(&p("a"), &shallow) {
        Err(Error::DepthLimit { limit, .. }) => assert_eq!(limit, 2),
        other => panic!("expected depth limit, got {:?}", other),
    }
    assert_eq!(tree.evaluate(&p("a")).unwrap(), Value::Int(1));
}

/// `f0 = f1`, `f1 = f2`, ... with the last field set to 1.
fn field_chain(len: usize) -> ExprTree {
    let mut source = String::new();
    for i in 0..len - 1 {
        source.push_str(&format!("f{} = f{}\n", i, i + 1));
    }
    source.push_str(&format!("f{} = 1\n", len - 1));
    ExprTree::parse(&source).unwrap()
}

#[test]
fn test_depth_limit_is_exact() {
    for len in [1, 5, 40] {
        let tree = field_chain(len);
        let exact = EvalOptions { max_depth: len };
        assert_eq!(tree.evaluate_with(&p("f0"), &exact).unwrap(), Value::Int(1));

        let short = EvalOptions { max_depth: len - 1 };
        match tree.evaluate_with(&p("f0"), &short) {
            Err(Error::DepthLimit { limit, .. }) => assert_eq!(limit, len - 1),
            other => panic!("chain of {}: expected depth limit, got {:?}", len, other),
        }
    }
}

#[test]
fn test_default_depth_allows_long_chains() {
    assert_eq!(EvalOptions::default().max_depth, 256);
    let tree = field_chain(150);
    assert_eq!(tree.evaluate(&p("f0")).unwrap(), Value::Int(1));
    assert_eq!(tree.evaluate(&Path::root()).unwrap().as_int(&p("f149")).unwrap(), 1);
}

#[test]
fn test_deep_expression_hits_depth_limit() {
    let mut expr = Expr::Literal(Scalar::Int(1));
    for _ in 0..1000 {
        expr = Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(expr),
        };
    }
    let mut root = Expr::empty_struct();
    if let Expr::Struct(fields) = &mut root {
        fields.insert("x".to_string(), expr);
    }
    let tree = ExprTree::new(root);
    let err = tree.evaluate(&p("x")).unwrap_err();
    assert!(matches!(err, Error::DepthLimit { limit: 256, .. }), "{:?}", err);
}

#[test]
fn test_long_method_chain_is_rejected_at_parse() {
    let source = format!("a = 1{}", ".abs()".repeat(20_000));
    let err = ExprTree::parse(&source).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

#[test]
fn test_huge_string_repeat_is_eval_error() {
    let err = crate::evaluate("a = \"ab\" * 9223372036854775807").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Eval);
    let err = crate::evaluate("a = \"ab\".repeat(4611686018427387904)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Eval);
}

#[test]
fn test_overlapping_overrides_apply_in_order() {
    let mut tree = ExprTree::parse("[a]\nb = 1\nc = 2").unwrap();
    tree.override_int(&p("a.b"), 5).unwrap();
    tree.override_string(&p("a"), "s").unwrap();
    let value = tree.evaluate(&Path::root()).unwrap();
    assert_eq!(value.as_string(&p("a")).unwrap(), "s");

    let mut tree = ExprTree::parse("[a]\nb = 1\nc = 2").unwrap();
    tree.override_string(&p("a"), "s").unwrap();
    match tree.override_int(&p("a.b"), 5) {
        Err(Error::Path(err)) => {
            assert_eq!(err.position, 1);
            assert!(matches!(err.reason, PathErrorReason::KindMismatch { .. }));
        }
        other => panic!("expected path error, got {:?}", other),
    }
    assert_eq!(tree.evaluate(&p("a")).unwrap(), Value::String("s".to_string()));
}

#[test]
fn test_as_int_on_string_is_type_error() {
    let value = crate::evaluate("name = \"x\"").unwrap();
    let err = value.as_int(&p("name")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}

/// Every node the document spells out, with the kind its value must have
/// when that is known without evaluating.
fn authored_kinds(node: &Expr, path: Path, out: &mut Vec<(Path, Option<Kind>)>) {
    let kind = match node {
        Expr::Struct(fields) => {
            for (name, child) in fields {
                authored_kinds(child, path.field(name), out);
            }
            Some(Kind::Map)
        }
        Expr::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                authored_kinds(item, path.index(index), out);
            }
            Some(Kind::Array)
        }
        Expr::Literal(scalar) => Some(scalar.kind()),
        _ => None,
    };
    out.push((path, kind));
}

#[test]
fn test_authored_paths_round_trip() {
    let tree = ExprTree::parse(
        "name = \"svc\"\n\
         my-key = 1.5\n\
         ports = [80, 443]\n\
         busy = ports.len() > 1\n\
         point = { x: 1, y: null }\n\
         [server.tls]\n\
         enabled = true\n\
         [[workers]]\n\
         id = 1\n\
         [[workers]]\n\
         id = 2\n\
         label = $\"w{id}\"",
    )
    .unwrap();
    let value = tree.evaluate(&Path::root()).unwrap();

    let mut authored = Vec::new();
    authored_kinds(tree.root(), Path::root(), &mut authored);
    assert!(authored.len() > 15, "{:?}", authored);

    for (path, kind) in authored {
        let reparsed = p(&path.to_string());
        assert_eq!(reparsed, path);
        let found = value
            .kind_at(&reparsed)
            .unwrap_or_else(|err| panic!("{} does not resolve: {}", path, err));
        if let Some(kind) = kind {
            assert_eq!(found, kind, "kind at {}", path);
        }
    }
}

#[test]
fn test_path_display_round_trip() {
    for text in ["", "a", "a.b", "servers[0].name", "matrix[1][2]", "my-key.x_y"] {
        let path = p(text);
        assert_eq!(path.to_string(), text);
        assert_eq!(p(&path.to_string()), path);
    }
}

// ── Tracing ─────────────────────────────────────────────────────────

#[test]
fn test_trace_shows_sources_and_values() {
    let tree =
        ExprTree::parse("[hello]\nvalue = 12\nname = $\"hello world {value + 12}\"").unwrap();
    assert_eq!(
        tree.trace(&p("hello.name")).unwrap(),
        "hello.value = 12\nhello.name = $\"hello world {value + 12}\"  # \"hello world 24\""
    );
}

#[test]
fn test_trace_follows_references_transitively() {
    let tree = ExprTree::parse("a = 1\nb = a * 2\nunused = 7\n[c]\nd = b + 1\ne = \"x\"").unwrap();
    assert_eq!(
        tree.trace(&p("c")).unwrap(),
        "a = 1\nb = a * 2  # 2\nc.d = b + 1  # 3\nc.e = \"x\""
    );
}

#[test]
fn test_trace_reports_evaluation_errors() {
    let tree = ExprTree::parse("x = y\ny = x").unwrap();
    assert_eq!(tree.trace(&p("x")).unwrap_err().kind(), ErrorKind::Cycle);
    let err = tree.trace(&p("missing")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Path);
}

#[test]
fn test_expression_display_reparses() {
    for source in [
        "(a + b) * c",
        "a - (b - c)",
        "2 ** 3 ** 2",
        "(2 ** 3) ** 2",
        "-x ** 2",
        "-(x + 1)",
        "!(a && b) || c",
        "(a ? b : c).len()",
        "xs[0].name",
        "$\"{{literal}} {x}\\n\"",
        "{ k: [1, 2.5, null] }",
    ] {
        let tree = ExprTree::parse(&format!("v = {}", source)).unwrap();
        let expr = tree.get(&p("v")).unwrap();
        let rendered = expr.to_string();
        let reparsed = ExprTree::parse(&format!("v = {}", rendered)).unwrap();
        assert_eq!(reparsed.get(&p("v")).unwrap(), expr, "{} rendered as {}", source, rendered);
    }
}

// ── Serde ───────────────────────────────────────────────────────────

#[derive(serde::Deserialize, Debug, PartialEq)]
struct Hello {
    age: i32,
    name: String,
}

#[derive(serde::Deserialize, Debug, PartialEq)]
struct Config {
    hello: Hello,
}

#[test]
fn test_deserialize_after_override() {
    let mut tree = ExprTree::parse("[hello]\nage = 12\nname = \"maria\"").unwrap();
    tree.override_int(&p("hello.age"), 30).unwrap();
    let config: Config = tree.deserialize().unwrap();
    assert_eq!(
        config,
        Config {
            hello: Hello {
                age: 30,
                name: "maria".to_string()
            }
        }
    );
}

#[test]
fn test_deserialize_mismatch_is_type_error() {
    let err = crate::from_str::<Config>("[hello]\nage = \"old\"\nname = \"x\"").unwrap_err();
    assert!(matches!(err, Error::Deserialize(_)));
    assert_eq!(err.kind(), ErrorKind::Type);
}

// ── Handle lifecycle ────────────────────────────────────────────────

#[test]
fn test_parse_then_release() {
    let mut registry = Registry::new();
    let expr = registry.parse("a = 1").unwrap();
    assert_eq!(registry.live(), 1);
    registry.release(expr).unwrap();
    assert_eq!(registry.live(), 0);
    assert_eq!(
        registry.release(expr).unwrap_err(),
        HandleError::Released(expr.into_raw())
    );
}

#[test]
fn test_registry_override_and_query() {
    let mut registry = Registry::new();
    let expr = registry.parse("name = \"dev\"\nport = 80").unwrap();
    registry
        .override_expr(expr, "name", Scalar::from("prod"))
        .unwrap();
    let value = registry.evaluate(expr, "").unwrap();
    let name = registry.as_str(value, "name").unwrap();
    assert_eq!(registry.get(name).unwrap().to_str().unwrap(), "prod");

    let err = registry.as_int(value, "name").unwrap_err();
    assert_eq!(registry.error_kind(err).unwrap(), ErrorKind::Type);

    registry.release(name).unwrap();
    registry.release(err).unwrap();
    registry.release(value).unwrap();
    registry.release(expr).unwrap();
    assert_eq!(registry.live(), 0);
}

#[test]
fn test_ffi_round_trip() {
    use crate::ffi::*;
    use std::ffi::{CStr, CString};

    let src = CString::new("[server]\nhost = \"localhost\"\nport = 8000 + 80").unwrap();
    let root = CString::new("").unwrap();
    let port = CString::new("server.port").unwrap();
    let host = CString::new("server.host").unwrap();
    let server = CString::new("server").unwrap();

    unsafe {
        let (mut expr, mut err) = (0u64, 0u64);
        assert_eq!(faml_expr_from_str(src.as_ptr(), &mut expr, &mut err), 1);
        assert_eq!(faml_expr_set_int(expr, port.as_ptr(), 9090), 0);

        let mut val = 0u64;
        assert_eq!(faml_expr_evaluate(expr, root.as_ptr(), &mut val, &mut err), 1);

        let mut n = 0i64;
        assert_eq!(faml_value_as_int(val, port.as_ptr(), &mut n), 0);
        assert_eq!(n, 9090);

        let mut is_map = false;
        assert_eq!(faml_value_is_map(val, server.as_ptr(), &mut is_map), 0);
        assert!(is_map);

        let mut s = 0u64;
        assert_eq!(faml_value_as_str(val, host.as_ptr(), &mut s), 0);
        assert_eq!(CStr::from_ptr(faml_str_ptr(s)).to_str().unwrap(), "localhost");

        let (mut keys, mut len) = (0u64, 0usize);
        assert_eq!(faml_value_map_keys(val, server.as_ptr(), &mut keys), 0);
        assert_eq!(faml_str_list_len(keys, &mut len), 0);
        assert_eq!(len, 2);
        let mut key = 0u64;
        assert_eq!(faml_str_list_get(keys, 1, &mut key), 0);
        assert_eq!(CStr::from_ptr(faml_str_ptr(key)).to_str().unwrap(), "port");

        let type_err = faml_value_as_int(val, host.as_ptr(), &mut n);
        assert_ne!(type_err, 0);
        assert_eq!(faml_error_kind(type_err), 3);

        for released in [
            faml_release_str(key),
            faml_release_str_list(keys),
            faml_release_str(s),
            faml_release_error(type_err),
            faml_release_value(val),
            faml_release_expr(expr),
        ] {
            assert_eq!(released, 1);
        }
        assert_eq!(faml_release_expr(expr), 0);
        assert!(faml_str_ptr(s).is_null());
    }
}

#[test]
fn test_ffi_null_arguments() {
    use crate::ffi::*;

    unsafe {
        let (mut expr, mut err) = (0u64, 0u64);
        assert_eq!(faml_expr_from_str(std::ptr::null(), &mut expr, &mut err), 0);
        assert_eq!(expr, 0);
        assert_eq!(faml_error_kind(err), 6);
        assert_eq!(faml_release_error(err), 1);

        assert_eq!(faml_error_kind(0), 0);
        assert_eq!(faml_release_value(0), 0);
    }
}

#[test]
fn test_ffi_null_out_pointer_allocates_nothing() {
    use crate::ffi::*;
    use std::ffi::CString;
    use std::ptr;

    let src = CString::new("a = 1\nb = { c: 2 }").unwrap();
    let empty = CString::new("").unwrap();
    let before = live_handles();
    unsafe {
        let mut err = 0u64;
        assert_eq!(faml_expr_from_str(src.as_ptr(), ptr::null_mut(), &mut err), 0);
        assert_eq!(faml_error_kind(err), 6);
        assert_eq!(faml_release_error(err), 1);
        assert_eq!(live_handles(), before);

        assert_eq!(faml_expr_from_str(src.as_ptr(), ptr::null_mut(), ptr::null_mut()), 0);
        assert_eq!(live_handles(), before);

        let mut expr = 0u64;
        assert_eq!(faml_expr_from_str(src.as_ptr(), &mut expr, ptr::null_mut()), 1);
        assert_eq!(faml_expr_evaluate(expr, empty.as_ptr(), ptr::null_mut(), ptr::null_mut()), 0);
        assert_eq!(live_handles(), before + 1);

        let (mut val, mut err) = (0u64, 0u64);
        assert_eq!(faml_expr_evaluate(expr, empty.as_ptr(), &mut val, &mut err), 1);
        assert_eq!(live_handles(), before + 2);

        let err = faml_value_map_keys(val, empty.as_ptr(), ptr::null_mut());
        assert_eq!(faml_error_kind(err), 6);
        assert_eq!(faml_release_error(err), 1);
        let path = CString::new("b").unwrap();
        let err = faml_value_as_str(val, path.as_ptr(), ptr::null_mut());
        assert_ne!(err, 0);
        assert_eq!(faml_release_error(err), 1);
        assert_eq!(live_handles(), before + 2);

        assert_eq!(faml_release_value(val), 1);
        assert_eq!(faml_release_expr(expr), 1);
    }
    assert_eq!(live_handles(), before);
}

#[test]
fn test_ffi_parse_error_message() {
    use crate::ffi::*;
    use std::ffi::{CStr, CString};

    let src = CString::new("a = [1, 2").unwrap();
    unsafe {
        let (mut expr, mut err) = (0u64, 0u64);
        assert_eq!(faml_expr_from_str(src.as_ptr(), &mut expr, &mut err), 0);
        assert_eq!(faml_error_kind(err), 1);

        let mut message = 0u64;
        assert_eq!(faml_error_message(err, &mut message), 0);
        let text = CStr::from_ptr(faml_str_ptr(message)).to_str().unwrap();
        assert!(text.contains("Unclosed '['"), "{}", text);

        assert_eq!(faml_release_str(message), 1);
        assert_eq!(faml_release_error(err), 1);
    }
}

// ── Concurrency ─────────────────────────────────────────────────────

#[test]
fn test_parallel_reads() {
    let tree = ExprTree::parse("base_port = 8000\n[svc]\nport = base_port + 80").unwrap();
    let value = tree.evaluate(&Path::root()).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                assert_eq!(value.as_int(&p("svc.port")).unwrap(), 8080);
                assert_eq!(tree.evaluate(&p("svc.port")).unwrap(), Value::Int(8080));
            });
        }
    });
}

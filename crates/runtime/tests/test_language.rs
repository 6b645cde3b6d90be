//! End-to-end language scenarios: source in, stdout out
//!
//! Each case drives the full pipeline (scanner, compiler, VM, natives)
//! through `Vm::interpret` with a captured output sink.

use slo_runtime::{ExceptionKind, InterpretError, SharedWriter, Vm};

fn run(source: &str) -> String {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    if let Err(err) = vm.interpret(source, "e2e.slo") {
        panic!("unexpected error:\n{}", err.render());
    }
    writer.contents()
}

fn run_stressed(source: &str) -> String {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    vm.heap.stress = true;
    if let Err(err) = vm.interpret(source, "e2e.slo") {
        panic!("unexpected error under gc stress:\n{}", err.render());
    }
    writer.contents()
}

fn run_runtime_err(source: &str) -> slo_runtime::SloError {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    match vm.interpret(source, "e2e.slo") {
        Err(InterpretError::Runtime(err)) => err,
        Err(InterpretError::Compile(errs)) => {
            panic!("expected runtime error, got compile errors: {errs:?}")
        }
        Ok(()) => panic!("expected a runtime error"),
    }
}

#[test]
fn test_arithmetic_scenario() {
    assert_eq!(run("print(1 + 2 * 3);"), "7\n");
}

#[test]
fn test_string_accumulation_scenario() {
    assert_eq!(
        run("var s = \"\"; for (var c in [\"a\", \"b\", \"c\"]) s = s + c; print(s);"),
        "abc\n"
    );
}

#[test]
fn test_class_scenario() {
    assert_eq!(
        run("class P { func __init__(x){ self.x = x; } func g(){ return self.x; } } print(P(42).g());"),
        "42\n"
    );
}

#[test]
fn test_counter_scenario() {
    assert_eq!(
        run("func counter(){ var n = 0; func f(){ n = n + 1; return n; } return f; } var c = counter(); print(c()); print(c()); print(c());"),
        "1\n2\n3\n"
    );
}

#[test]
fn test_dict_scenario() {
    assert_eq!(
        run("var d = {\"a\": 1, \"b\": 2}; d[\"c\"] = 3; print(len(d)); print(d has \"b\"); print(d[\"c\"]);"),
        "3\ntrue\n3\n"
    );
}

#[test]
fn test_math_scenario() {
    assert_eq!(
        run("import math; print(math.floor(2.7)); print(math.sqrt(9));"),
        "2\n3\n"
    );
}

#[test]
fn test_lexical_scoping() {
    // The inner block's variable disappears with its scope; the captured
    // upvalue still reads the last assigned value.
    let out = run(
        "var observe = nil;\n\
         { var hidden = 1; func probe() { return hidden; } observe = probe; hidden = 99; }\n\
         print(observe());",
    );
    assert_eq!(out, "99\n");
}

#[test]
fn test_interning_makes_equal_literals_identical() {
    let out = run(
        "var d = {};\n\
         func key() { return \"compound\" + \"key\"; }\n\
         d[key()] = 1;\n\
         d[\"compoundkey\"] = 2;\n\
         print(len(d));",
    );
    assert_eq!(out, "1\n");
}

#[test]
fn test_interpolation_with_nested_braces() {
    assert_eq!(run("print(\"v=${ {\"a\": 7}[\"a\"] }\");"), "v=7\n");
    assert_eq!(run("print(\"x=${1 + 2}\");"), "x=3\n");
}

#[test]
fn test_escape_sequences_at_print_boundary() {
    assert_eq!(run("print(\"a\\tb\");"), "a\tb\n");
    assert_eq!(run("print(\"line1\\nline2\");"), "line1\nline2\n");
    // Escapes are raw in memory: the two characters count separately.
    assert_eq!(run("print(len(\"a\\n\"));"), "3\n");
}

#[test]
fn test_enum_scenario() {
    assert_eq!(
        run("enum Day { Mon, Tue, Wed } print(Day.Mon); print(Day.Wed);"),
        "0\n2\n"
    );
}

#[test]
fn test_error_report_format() {
    let err = run_runtime_err("var x = 1;\nvar y = x + nil;");
    assert_eq!(err.kind, ExceptionKind::Type);
    assert_eq!(err.file, "e2e.slo");
    assert_eq!(err.line, 2);
    let rendered = err.render();
    assert!(rendered.starts_with("[TypeException]"));
    assert!(rendered.contains("at e2e.slo:2:"));
    assert!(rendered.contains("    2 | var y = x + nil;"));
    assert!(rendered.contains("Stack trace:"));
}

#[test]
fn test_assertion_failure_report() {
    let err = run_runtime_err("assert 2 + 2 == 5;");
    assert_eq!(err.kind, ExceptionKind::Assertion);
    assert!(err.render().contains("assertion failed"));
}

#[test]
fn test_repl_style_state_accumulates() {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    vm.interpret("var total = 0;", "repl").expect("line 1");
    vm.interpret("func bump(n) { total = total + n; return total; }", "repl")
        .expect("line 2");
    vm.interpret("bump(3); bump(4);", "repl").expect("line 3");
    vm.interpret("print(total);", "repl").expect("line 4");
    assert_eq!(writer.contents(), "7\n");
}

#[test]
fn test_final_survives_across_lines() {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    vm.interpret("final var limit = 10;", "repl").expect("defines");
    assert!(matches!(
        vm.interpret("limit = 11;", "repl"),
        Err(InterpretError::Compile(_))
    ));
    assert!(matches!(
        vm.interpret("{ var limit = 0; }", "repl"),
        Err(InterpretError::Compile(_))
    ));
}

#[test]
fn test_gc_stress_full_program() {
    // Collection at every safe point must not disturb anything reachable
    // from closures, fields, lists, dicts, or open upvalues.
    let out = run_stressed(
        "class Node { func __init__(v) { self.v = v; self.next = nil; } }\n\
         func build(n) {\n\
             var head = nil;\n\
             for (var i = 0; i < n; i = i + 1) { var node = Node(i); node.next = head; head = node; }\n\
             return head;\n\
         }\n\
         func sum(head) {\n\
             var acc = 0;\n\
             while (head != nil) { acc = acc + head.v; head = head.next; }\n\
             return acc;\n\
         }\n\
         var cache = {};\n\
         cache[\"chain\"] = build(25);\n\
         print(sum(cache[\"chain\"]));\n\
         var strings = [];\n\
         for (var i = 0; i < 10; i = i + 1) { strings.append(\"item ${i}\"); }\n\
         print(strings[9]);",
    );
    assert_eq!(out, "300\nitem 9\n");
}

#[test]
fn test_deep_equality_is_recursive_for_lists() {
    assert_eq!(run("print([[1, 2], [3]] == [[1, 2], [3]]);"), "true\n");
    assert_eq!(run("print([[1, 2]] == [[1, 3]]);"), "false\n");
}

#[test]
fn test_instances_compare_by_identity() {
    let out = run(
        "class C { }\n\
         var a = C(); var b = C();\n\
         print(a == a); print(a == b);",
    );
    assert_eq!(out, "true\nfalse\n");
}

//! Built-in module and method coverage: math, random, os, json, files,
//! and the string/list/dict method surfaces.

use serial_test::serial;
use slo_runtime::{ExceptionKind, InterpretError, SharedWriter, Vm};
use std::io::Write;

fn run(source: &str) -> String {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    if let Err(err) = vm.interpret(source, "stdlib.slo") {
        panic!("unexpected error:\n{}", err.render());
    }
    writer.contents()
}

fn run_err_kind(source: &str) -> ExceptionKind {
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    match vm.interpret(source, "stdlib.slo") {
        Err(InterpretError::Runtime(err)) => err.kind,
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn test_string_methods() {
    assert_eq!(run("print(\"MiXeD\".upper());"), "MIXED\n");
    assert_eq!(run("print(\"MiXeD\".lower());"), "mixed\n");
    assert_eq!(run("print(\"  pad  \".strip());"), "pad\n");
    assert_eq!(run("print(\"a,b,c\".split(\",\"));"), "[\"a\", \"b\", \"c\"]\n");
    assert_eq!(run("print(\"a-b\".replace(\"-\", \"+\"));"), "a+b\n");
    assert_eq!(run("print(\"hello\".find(\"llo\"));"), "2\n");
    assert_eq!(run("print(\"hello\".find(\"zzz\"));"), "-1\n");
    assert_eq!(run("print(\"hello\".startsWith(\"he\"));"), "true\n");
    assert_eq!(run("print(\"hello\".endsWith(\"lo\"));"), "true\n");
}

#[test]
fn test_list_methods() {
    assert_eq!(run("var l = [1]; l.append(2); print(l);"), "[1, 2]\n");
    assert_eq!(run("var l = [1, 2]; print(l.pop()); print(l);"), "2\n[1]\n");
    assert_eq!(run("var l = [1, 3]; l.insert(1, 2); print(l);"), "[1, 2, 3]\n");
    assert_eq!(run("var l = [1, 2, 3]; print(l.remove(2)); print(l);"), "true\n[1, 3]\n");
    assert_eq!(run("print([\"a\", \"b\"].indexOf(\"b\"));"), "1\n");
    assert_eq!(run("var l = [1, 2, 3]; l.reverse(); print(l);"), "[3, 2, 1]\n");
    assert_eq!(run("print([1, 2, 3].join(\"-\"));"), "1-2-3\n");
    assert_eq!(run("print([].isEmpty()); print([1].isEmpty());"), "true\nfalse\n");
    assert_eq!(run("var l = [1, 2]; var c = l.copy(); l.append(3); print(c);"), "[1, 2]\n");
    assert_eq!(run("var l = [1, 2]; l.clear(); print(l); print(len(l));"), "[]\n0\n");
}

#[test]
fn test_dict_methods() {
    assert_eq!(run("print({\"a\": 1}.get(\"a\"));"), "1\n");
    assert_eq!(run("print({}.get(\"a\"));"), "nil\n");
    assert_eq!(run("print({}.get(\"a\", 9));"), "9\n");
    assert_eq!(run("print(len({\"a\": 1}.keys()));"), "1\n");
    assert_eq!(run("print({\"a\": 7}.values());"), "[7]\n");
    assert_eq!(
        run("var d = {\"a\": 1}; print(d.remove(\"a\")); print(d.remove(\"a\")); print(len(d));"),
        "true\nfalse\n0\n"
    );
    assert_eq!(run("print({}.isEmpty());"), "true\n");
}

#[test]
fn test_pop_from_empty_list_is_index_error() {
    assert_eq!(run_err_kind("[].pop();"), ExceptionKind::Index);
}

#[test]
fn test_math_module() {
    assert_eq!(run("import math; print(math.ceil(1.2));"), "2\n");
    assert_eq!(run("import math; print(math.abs(-4));"), "4\n");
    assert_eq!(run("import math; print(math.pow(2, 10));"), "1024\n");
    assert_eq!(run("import math; print(math.min(3, 1)); print(math.max(3, 1));"), "1\n3\n");
    assert_eq!(run("import math; print(math.floor(math.pi));"), "3\n");
    assert_eq!(run("import math; print(math.round(2.5));"), "3\n");
}

#[test]
fn test_math_argument_validation() {
    assert_eq!(run_err_kind("import math; math.sqrt(\"x\");"), ExceptionKind::Type);
}

#[test]
fn test_random_module_seeded_reproducibility() {
    let out = run(
        "import random;\n\
         random.seed(7);\n\
         var a = random.range(0, 1000);\n\
         random.seed(7);\n\
         var b = random.range(0, 1000);\n\
         print(a == b);",
    );
    assert_eq!(out, "true\n");
}

#[test]
fn test_random_module_bounds() {
    let out = run(
        "import random;\n\
         var ok = true;\n\
         for (var i in [1, 2, 3, 4, 5]) {\n\
             var r = random.random();\n\
             if (r < 0) ok = false;\n\
             if (r >= 1) ok = false;\n\
         }\n\
         print(ok);",
    );
    assert_eq!(out, "true\n");
    assert_eq!(run("import random; print(random.choice([5]));"), "5\n");
}

#[test]
fn test_json_round_trip() {
    assert_eq!(
        run("import json; print(json.parse(\"{\\\"a\\\": [1, 2]}\")[\"a\"][1]);"),
        "2\n"
    );
    assert_eq!(
        run("import json; print(json.stringify([1, \"x\", nil, true]));"),
        "[1,\"x\",null,true]\n"
    );
    let out = run(
        "import json;\n\
         var blob = json.stringify({\"k\": [1, 2.5]});\n\
         var back = json.parse(blob);\n\
         print(back[\"k\"][0]); print(back[\"k\"][1]);",
    );
    assert_eq!(out, "1\n2.5\n");
}

#[test]
fn test_json_rejects_unserialisable() {
    assert_eq!(
        run_err_kind("import json; func f() { } json.stringify(f);"),
        ExceptionKind::Type
    );
}

#[test]
#[serial]
fn test_os_env_round_trip() {
    let out = run(
        "import os;\n\
         os.setenv(\"SLO_TEST_VAR\", \"marker\");\n\
         print(os.getenv(\"SLO_TEST_VAR\"));\n\
         print(os.getenv(\"SLO_TEST_MISSING_VAR\"));",
    );
    assert_eq!(out, "marker\nnil\n");
}

#[test]
fn test_os_time_is_positive() {
    assert_eq!(run("import os; print(os.time() > 0);"), "true\n");
}

#[test]
fn test_file_write_then_read() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("out.txt");
    let path_str = path.display().to_string();
    let source = format!(
        "var f = open(\"{path_str}\", \"w\");\n\
         f.write(\"alpha\\nbeta\");\n\
         f.close();\n\
         var g = open(\"{path_str}\", \"r\");\n\
         print(len(g.readLines()));\n\
         g.close();"
    );
    assert_eq!(run(&source), "2\n");
    let written = std::fs::read_to_string(&path).expect("file exists");
    assert_eq!(written, "alpha\nbeta");
}

#[test]
fn test_file_read_whole() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("data.txt");
    let mut f = std::fs::File::create(&path).expect("create");
    f.write_all(b"payload").expect("write");
    drop(f);
    let source = format!(
        "var f = open(\"{}\", \"r\"); print(f.read()); f.close();",
        path.display()
    );
    assert_eq!(run(&source), "payload\n");
}

#[test]
fn test_open_missing_file_is_io_error() {
    assert_eq!(
        run_err_kind("open(\"/definitely/not/here.txt\", \"r\");"),
        ExceptionKind::Io
    );
}

#[test]
fn test_write_to_read_mode_file_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("ro.txt");
    std::fs::write(&path, "x").expect("seed file");
    let source = format!(
        "var f = open(\"{}\", \"r\"); f.write(\"nope\");",
        path.display()
    );
    assert_eq!(run_err_kind(&source), ExceptionKind::Io);
}

#[test]
fn test_closed_file_refuses_io() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("c.txt");
    std::fs::write(&path, "x").expect("seed file");
    let source = format!(
        "var f = open(\"{}\", \"r\"); f.close(); f.read();",
        path.display()
    );
    assert_eq!(run_err_kind(&source), ExceptionKind::Io);
}

/// True while some descriptor in this process points at `path`. Keyed to
/// the exact path so tests opening other files in parallel cannot
/// interfere.
#[cfg(target_os = "linux")]
fn fd_points_at(path: &std::path::Path) -> bool {
    std::fs::read_dir("/proc/self/fd")
        .expect("fd table")
        .flatten()
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .any(|target| target == path)
}

#[test]
#[cfg(target_os = "linux")]
fn test_collected_file_closes_handle() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("leaked.txt");
    let writer = SharedWriter::default();
    let mut vm = Vm::with_output(Box::new(writer.clone()));
    vm.heap.stress = true;
    let source = format!(
        "var f = open(\"{}\", \"w\"); f.write(\"data\");",
        path.display()
    );
    vm.interpret(&source, "gc_file.slo").expect("runs");
    // Reachable from the global, never close()d: the handle stays open.
    assert!(fd_points_at(&path));
    // Drop the only reference; under stress the next allocation point
    // collects, and sweeping the file object must close the OS handle.
    vm.interpret("f = nil; var keep = [1, 2];", "gc_file.slo")
        .expect("runs");
    assert!(!fd_points_at(&path));
    assert_eq!(
        std::fs::read_to_string(&path).expect("file exists"),
        "data"
    );
}

#[test]
fn test_append_mode() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("log.txt");
    std::fs::write(&path, "first|").expect("seed file");
    let source = format!(
        "var f = open(\"{}\", \"a\"); f.write(\"second\"); f.close();",
        path.display()
    );
    run(&source);
    assert_eq!(
        std::fs::read_to_string(&path).expect("file exists"),
        "first|second"
    );
}

//! End-to-end tests: source text in, final value out.

use tarn_core::bytecode::{read_module, write_module};
use tarn_core::value::{deep_equal, display_value, HeapValue};
use tarn_core::{Engine, EngineOptions, Error};

fn eval(src: &str) -> (Engine, tarn_core::ValueRef) {
    let mut engine = Engine::default();
    let value = engine
        .run_source("<test>", src)
        .unwrap_or_else(|e| panic!("{src}: {e}"));
    (engine, value)
}

fn eval_display(src: &str) -> String {
    let (engine, value) = eval(src);
    engine.display(value)
}

fn eval_err(src: &str) -> Error {
    let mut engine = Engine::default();
    engine.run_source("<test>", src).map(|_| ()).unwrap_err()
}

// ----------------------------------------------------------------------
// Core language walk-throughs
// ----------------------------------------------------------------------

#[test]
fn scenario_constant_folding() {
    assert_eq!(eval_display("let x = 1 + 2 * 3; x"), "7");
}

#[test]
fn scenario_function_call() {
    assert_eq!(eval_display("let f = fn(a, b) a + b; f(40, 2)"), "42");
}

#[test]
fn scenario_for_over_range() {
    assert_eq!(
        eval_display("let acc = []; for x in 1:4 acc.append(x); acc"),
        "[1, 2, 3]"
    );
}

#[test]
fn scenario_catch_binds_the_error() {
    assert_eq!(eval_display("let r = try 10 / 0 catch |e| e; r is error"), "true");
}

#[test]
fn scenario_closures_capture_by_value_reference() {
    assert_eq!(eval_display("let mk = fn(n) fn() n; let g = mk(7); g() + g()"), "14");
}

#[test]
fn scenario_destructuring() {
    assert_eq!(eval_display("let (a, _, b) = (1, 2, 3); a + b"), "4");
}

// ----------------------------------------------------------------------
// Laws
// ----------------------------------------------------------------------

#[test]
fn write_read_round_trips_compiled_modules() {
    let engine = Engine::default();
    let module = engine
        .compile("<test>", "let f = fn(a) a * 2; f(21)")
        .unwrap();
    let image = write_module(&module);
    let reread = read_module(&image).unwrap();
    reread.validate().unwrap();
    assert_eq!(write_module(&reread), image);

    // The round-tripped module still runs.
    let mut engine = Engine::default();
    let value = engine.run(std::rc::Rc::new(reread)).unwrap();
    assert_eq!(engine.display(value), "42");
}

#[test]
fn folding_law_constant_and_runtime_results_agree() {
    // Evaluate `a op b` twice: folded (constants) and forced through
    // registers via a function call. Both must agree.
    for op in ["+", "-", "*", "/", "//", "%", "**", "<<", ">>", "&", "|", "^"] {
        for (a, b) in [("7", "3"), ("(-9)", "4"), ("0", "5")] {
            let folded = format!("{a} {op} {b}");
            let forced = format!("let f = fn(x, y) x {op} y; f({a}, {b})");
            let mut engine = Engine::default();
            let lhs = engine.run_source("<folded>", &folded).unwrap();
            let rhs = engine.run_source("<forced>", &forced).unwrap();
            assert!(
                deep_equal(engine.vm().heap(), lhs, rhs),
                "{folded}: folded {} vs runtime {}",
                display_value(engine.vm().heap(), lhs),
                display_value(engine.vm().heap(), rhs),
            );
        }
    }
}

#[test]
fn short_circuit_law_side_effects() {
    // The probe list only grows when the right side actually runs.
    assert_eq!(
        eval_display("let l = []; let probe = fn() { l.append(1); true }; false and probe(); l"),
        "[]"
    );
    assert_eq!(
        eval_display("let l = []; let probe = fn() { l.append(1); true }; true or probe(); l"),
        "[]"
    );
    assert_eq!(
        eval_display("let l = []; let probe = fn() { l.append(1); true }; true and probe(); l"),
        "[1]"
    );
}

#[test]
fn cast_idempotence() {
    assert_eq!(eval_display("3.9 as int as int == 3.9 as int"), "true");
    assert_eq!(eval_display("(42 as str) as str == 42 as str"), "true");
}

// ----------------------------------------------------------------------
// Semantics
// ----------------------------------------------------------------------

#[test]
fn arithmetic_semantics() {
    assert_eq!(eval_display("7 / 2"), "3.5");
    assert_eq!(eval_display("-7 // 2"), "-4");
    assert_eq!(eval_display("-7 % 2"), "-1");
    assert_eq!(eval_display("2 ** -1"), "0.5");
    assert_eq!(eval_display("2 ** 10"), "1024");
    assert_eq!(eval_display("1 + 0.5"), "1.5");
    assert_eq!(eval_display("1 == 1.0"), "true");
}

#[test]
fn runtime_unary_operators() {
    // Forced through a call so the constant folder stays out of the way.
    assert_eq!(eval_display("let f = fn(x) -x; f(5)"), "-5");
    assert_eq!(eval_display("let f = fn(x) not x; f(false)"), "true");
    assert_eq!(eval_display("let f = fn(x) ~x; f(0)"), "-1");
}

#[test]
fn error_values_wrap_and_unwrap() {
    assert_eq!(eval_display("error()"), "error(null)");
    assert_eq!(eval_display("error(4) == error(4)"), "true");
    assert_eq!(eval_display("@ok == @ok"), "true");
    assert_eq!(eval_display("@ok(1) == @err(1)"), "false");
}

#[test]
fn comparison_semantics() {
    assert_eq!(eval_display("\"abc\" < \"abd\""), "true");
    assert_eq!(eval_display("(1, 2) < (1, 3)"), "true");
    assert_eq!(eval_display("[1, 2] == [1, 2]"), "true");
    assert_eq!(eval_display("(1, 2) == [1, 2]"), "false");
    let err = eval_err("let f = fn(a, b) a < b; f(1, \"x\")");
    assert!(matches!(err, Error::Runtime(_)));
}

#[test]
fn maps_preserve_insertion_order_and_overwrite() {
    assert_eq!(
        eval_display("let m = {a: 1, b: 2}; m.a = 10; m[\"c\"] = 3; m"),
        "{\"a\": 10, \"b\": 2, \"c\": 3}"
    );
    assert_eq!(eval_display("let m = {a: 1}; \"a\" in m"), "true");
}

#[test]
fn strings_index_and_iterate_by_character() {
    assert_eq!(eval_display("\"hej\"[1]"), "\"e\"");
    assert_eq!(
        eval_display("let acc = []; for c in \"ab\" acc.append(c); acc"),
        "[\"a\", \"b\"]"
    );
}

#[test]
fn ranges_are_end_exclusive_with_steps() {
    assert_eq!(
        eval_display("let acc = []; for x in 0:7:2 acc.append(x); acc"),
        "[0, 2, 4, 6]"
    );
    assert_eq!(eval_display("3 in 1:4"), "true");
    assert_eq!(eval_display("4 in 1:4"), "false");
}

#[test]
fn while_loops_break_and_continue() {
    assert_eq!(
        eval_display(
            "let acc = []; let i = 0; while (true) { i = i + 1; \
             if (i == 2) continue; if (i > 4) break; acc.append(i) }; acc"
        ),
        "[1, 3, 4]"
    );
}

#[test]
fn match_selects_the_first_matching_case() {
    let src = "let describe = fn(v) match (v) {
        0 => \"zero\",
        (x, y) => x + y,
        @some(inner) => inner,
        @none => \"none\",
        error(e) => e,
        let other => other,
    };";
    assert_eq!(eval_display(&format!("{src} describe(0)")), "\"zero\"");
    assert_eq!(eval_display(&format!("{src} describe((20, 22))")), "42");
    assert_eq!(eval_display(&format!("{src} describe(@some(5))")), "5");
    assert_eq!(eval_display(&format!("{src} describe(@none)")), "\"none\"");
    assert_eq!(eval_display(&format!("{src} describe(error(9))")), "9");
    assert_eq!(eval_display(&format!("{src} describe(\"other\")")), "\"other\"");
}

#[test]
fn tagged_values_and_error_destructuring() {
    assert_eq!(eval_display("let @ok(v) = @ok(3); v"), "3");
    assert_eq!(eval_display("let error(e) = error(\"boom\"); e"), "\"boom\"");
    let err = eval_err("let @ok(v) = @err(3); v");
    assert!(matches!(err, Error::Runtime(_)));
}

#[test]
fn throw_and_catch_without_binding() {
    assert_eq!(eval_display("throw \"boom\" catch 42"), "42");
    assert_eq!(eval_display("let x = error(1); x catch |e| 99"), "99");
    assert_eq!(eval_display("1 catch |e| 99"), "1");
}

#[test]
fn try_hands_errors_to_an_enclosing_catch() {
    // `try` under a catch delivers to the handler instead of returning.
    assert_eq!(
        eval_display("let x = error(3); (try x) catch |e| e is error"),
        "true"
    );
    // Handler stacks stay balanced when control leaves a protected region.
    assert_eq!(
        eval_display("let f = fn(c) { (if (c) return 1 else 2) catch |e| 0 }; f(true)"),
        "1"
    );
    assert_eq!(
        eval_display(
            "let acc = []; for i in 0:3 { (if (i == 1) continue else i) catch |e| 0; acc.append(i) }; acc"
        ),
        "[0, 2]"
    );
}

#[test]
fn try_propagates_errors_out_of_functions() {
    assert_eq!(
        eval_display("let f = fn(x) { let v = try x; v + 1 }; f(1)"),
        "2"
    );
    assert_eq!(
        eval_display("let f = fn(x) { let v = try x; v + 1 }; f(error(7)) is error"),
        "true"
    );
}

#[test]
fn this_binds_the_method_receiver() {
    assert_eq!(
        eval_display("let m = {x: 8, get: fn() this[\"x\"]}; m.get()"),
        "8"
    );
}

#[test]
fn arity_mismatch_and_uncallable_raise() {
    assert!(matches!(eval_err("let f = fn(a) a; f(1, 2)"), Error::Runtime(_)));
    assert!(matches!(eval_err("3(1)"), Error::Runtime(_)));
}

#[test]
fn mutating_a_list_during_iteration_raises() {
    let err = eval_err("let l = [1, 2, 3]; for x in l l.append(x)");
    match err {
        Error::Runtime(e) => assert!(e.message.contains("mutated")),
        other => panic!("expected a runtime error, got {other}"),
    }
}

#[test]
fn unhandled_errors_carry_a_traceback() {
    let err = eval_err("let f = fn() 1 / 0; let g = fn() f(); g()");
    match err {
        Error::Runtime(e) => {
            assert!(e.message.contains("division by zero"));
            // Innermost frame first: f, g, then the module top level.
            assert_eq!(e.traceback.len(), 3);
        }
        other => panic!("expected a runtime error, got {other}"),
    }
}

#[test]
fn natives_are_reachable_through_the_registry() {
    let mut engine = Engine::default();
    engine.register_native("add_all", |heap, args| {
        let mut total = 0;
        for &arg in args {
            match heap.get(arg) {
                HeapValue::Int(i) => total += *i,
                _ => return Err("add_all takes ints".into()),
            }
        }
        Ok(heap.alloc_int(total))
    });
    let value = engine
        .run_source("<test>", "let add = native(\"add_all\"); add(1, 2, 39)")
        .unwrap();
    assert_eq!(engine.display(value), "42");

    let err = engine
        .run_source("<test>", "native(\"missing\")")
        .unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}

#[test]
fn shared_mutation_through_bindings() {
    // Aggregates bind by reference: both names see the append.
    assert_eq!(eval_display("let a = []; let b = a; b.append(1); a"), "[1]");
}

#[test]
fn discarded_errors_raise() {
    let err = eval_err("error(5); 1");
    assert!(matches!(err, Error::Runtime(_)));
}

#[test]
fn gc_survives_cyclic_script_data() {
    // A self-referential list plus enough garbage to force collections.
    let src = "
        let cell = [];
        cell.append(cell);
        let i = 0;
        let junk = 0;
        while (i < 20000) { junk = i * 2; i = i + 1 };
        cell[0] == cell
    ";
    assert_eq!(eval_display(src), "true");
}

#[test]
fn import_files_runs_and_caches_modules() {
    let dir = std::env::temp_dir().join("tarn-import-test");
    std::fs::create_dir_all(&dir).unwrap();
    let lib = dir.join("lib.tarn");
    std::fs::write(&lib, "let value = 21; value * 2").unwrap();

    let mut options = EngineOptions::default();
    options.vm.import_files = true;
    let mut engine = Engine::new(options);
    let src = format!("import({:?}) + import({:?})", lib, lib);
    let value = engine.run_source("<test>", &src).unwrap();
    assert_eq!(engine.display(value), "84");
}

#[test]
fn imports_without_file_access_raise() {
    let err = eval_err("import(\"nope.tarn\")");
    assert!(matches!(err, Error::Runtime(_)));
}

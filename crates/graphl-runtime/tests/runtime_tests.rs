//! End-to-end tests for program loading and host function dispatch.
//!
//! Tests validate:
//! - Load failures: missing or malformed metadata, unresolved imports,
//!   unknown types, missing exports, invalid binaries
//! - Host functions are reached by id through shared trampolines
//! - Results flow back into guest computation
//! - Host errors and contract violations surface intact and leave the
//!   program usable
//! - Options blob, fuel metering and memory limits

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use graphl_guest::layout::GLOBAL_INIT_OPTS;
use graphl_guest::GuestBuilder;
use graphl_runtime::types::{FunctionMeta, Metadata, METADATA_MARKER};
use graphl_runtime::{
    HostEnv, HostFunctionDesc, HostFunctionKind, LoadStage, Program, RuntimeConfig, RuntimeError,
    StructValue, Value,
};
use wasm_encoder::{BlockType, CustomSection, Instruction, Section};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn load(builder: GuestBuilder, env: &HostEnv) -> Program {
    load_with(builder, env, RuntimeConfig::default()).expect("instantiation failed")
}

fn load_with(
    builder: GuestBuilder,
    env: &HostEnv,
    config: RuntimeConfig,
) -> Result<Program, RuntimeError> {
    let wasm = builder.finish().expect("assembly failed");
    Program::instantiate(&wasm, env, config)
}

fn int(args: &[Value], i: usize) -> i128 {
    args[i].as_int().expect("integer argument")
}

fn add() -> HostFunctionDesc {
    HostFunctionDesc::new(|args| Ok(Value::Int(int(args, 0) + int(args, 1))))
        .input("a", "i32")
        .input("b", "i32")
        .output("sum", "i32")
}

fn mul() -> HostFunctionDesc {
    HostFunctionDesc::new(|args| Ok(Value::Int(int(args, 0) * int(args, 1))))
        .input("a", "i32")
        .input("b", "i32")
        .output("product", "i32")
}

/// Export `name(a: i32, b: i32) -> i32` forwarding to host function `host`.
fn forward_binary(b: &mut GuestBuilder, name: &str, host: &'static str) {
    b.export(name, &["i32", "i32"], &["i32"], vec![], move |s| {
        let f = s.host(host)?;
        Ok(vec![
            f.push_id(),
            Instruction::LocalGet(0),
            Instruction::LocalGet(1),
            f.call(),
        ])
    })
    .unwrap();
}

/// Export `name(x: T) -> U` forwarding to host function `host`.
fn forward_unary(b: &mut GuestBuilder, name: &str, host: &'static str, input: &str, output: &str) {
    b.export(name, &[input], &[output], vec![], move |s| {
        let f = s.host(host)?;
        Ok(vec![f.push_id(), Instruction::LocalGet(0), f.call()])
    })
    .unwrap();
}

/// A `main() -> i32` computing `Add(3, 4) * 10` in the guest.
fn arithmetic_module() -> GuestBuilder {
    let mut b = GuestBuilder::new();
    b.host_function(0, "Add", &["i32", "i32"], &["i32"]).unwrap();
    b.host_function(1, "Mul", &["i32", "i32"], &["i32"]).unwrap();
    b.export("main", &[], &["i32"], vec![], |s| {
        let add = s.host("Add")?;
        Ok(vec![
            add.push_id(),
            Instruction::I32Const(3),
            Instruction::I32Const(4),
            add.call(),
            Instruction::I32Const(10),
            Instruction::I32Mul,
        ])
    })
    .unwrap();
    forward_binary(&mut b, "add", "Add");
    forward_binary(&mut b, "mul", "Mul");
    b
}

fn arithmetic_env() -> HostEnv {
    HostEnv::new().with("Add", add()).with("Mul", mul())
}

fn with_custom_metadata(mut wasm: Vec<u8>, metadata: &Metadata) -> Vec<u8> {
    let json = metadata.to_embedded_json().unwrap();
    CustomSection {
        name: "metadata".into(),
        data: json.as_slice().into(),
    }
    .append_to(&mut wasm);
    wasm
}

// ══════════════════════════════════════════════════════════════════════════════
// Loading
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn loads_and_lists_exports() {
    let program = load(arithmetic_module(), &arithmetic_env());
    let names: Vec<&str> = program.functions().map(|f| f.name()).collect();
    assert_eq!(names, vec!["add", "main", "mul"]);
    let main = program.function("main").unwrap();
    assert!(main.inputs().is_empty());
    assert_eq!(main.return_type().name(), "i32");
    assert_eq!(program.metadata().host.functions.len(), 2);
    assert_eq!(program.fingerprint().len(), 64);
    assert!(program.fingerprint().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn fingerprint_is_stable_per_binary() {
    let wasm = arithmetic_module().finish().unwrap();
    let env = arithmetic_env();
    let a = Program::instantiate(&wasm, &env, RuntimeConfig::default()).unwrap();
    let b = Program::instantiate(&wasm, &env, RuntimeConfig::default()).unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.runtime_id(), b.runtime_id());
}

#[test]
fn missing_metadata_is_not_found() {
    let mut b = arithmetic_module();
    b.without_metadata();
    let err = load_with(b, &arithmetic_env(), RuntimeConfig::default()).unwrap_err();
    assert!(matches!(err, RuntimeError::MetadataNotFound), "got {err}");
}

#[test]
fn truncated_metadata_is_malformed() {
    let doc = format!("{{\"{METADATA_MARKER}\": true, \"functions\": [");
    let err = Program::instantiate(doc.as_bytes(), &HostEnv::new(), RuntimeConfig::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::MetadataMalformed(_)), "got {err}");
}

#[test]
fn unresolved_imports_are_listed() {
    let mut b = GuestBuilder::new();
    b.host_function(0, "A", &["i32"], &["i32"]).unwrap();
    b.host_function(1, "B", &["i32"], &["i32"]).unwrap();
    let env = HostEnv::new().with(
        "A",
        HostFunctionDesc::new(|args| Ok(args[0].clone()))
            .input("x", "i32")
            .output("y", "i32"),
    );
    match load_with(b, &env, RuntimeConfig::default()) {
        Err(RuntimeError::ImportsUnresolved { names }) => assert_eq!(names, vec!["B"]),
        other => panic!("expected unresolved imports, got {:?}", other.err()),
    }
}

#[test]
fn extra_host_functions_are_ignored() {
    let env = arithmetic_env().with(
        "Unused",
        HostFunctionDesc::new(|_| Ok(Value::Void)).kind(HostFunctionKind::Effectful),
    );
    let mut program = load(arithmetic_module(), &env);
    assert_eq!(program.call("main", &[]).unwrap(), Value::Int(70));
}

#[test]
fn unknown_type_in_metadata_is_rejected() {
    let metadata = Metadata {
        functions: vec![FunctionMeta {
            name: "spin".into(),
            inputs: vec!["quat".into()],
            outputs: vec![],
        }],
        ..Metadata::default()
    };
    let err = Program::instantiate(
        &metadata.to_embedded_json().unwrap(),
        &HostEnv::new(),
        RuntimeConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownType(ref n) if n == "quat"), "got {err}");
}

#[test]
fn invalid_binary_is_an_engine_error() {
    let bytes = Metadata::default().to_embedded_json().unwrap();
    let err = Program::instantiate(&bytes, &HostEnv::new(), RuntimeConfig::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Wasm(_)), "got {err}");
}

#[test]
fn declared_but_absent_export_is_missing() {
    let mut b = GuestBuilder::new();
    b.without_metadata();
    let metadata = Metadata {
        functions: vec![FunctionMeta {
            name: "ghost".into(),
            inputs: vec![],
            outputs: vec![],
        }],
        ..Metadata::default()
    };
    let wasm = with_custom_metadata(b.finish().unwrap(), &metadata);
    let err = Program::instantiate(&wasm, &HostEnv::new(), RuntimeConfig::default())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::MissingExport(ref n) if n == "ghost"), "got {err}");
}

#[test]
fn load_stages_progress_in_order() {
    let stages = [
        LoadStage::Unloaded,
        LoadStage::MetadataParsed,
        LoadStage::ImportsResolved,
        LoadStage::Instantiated,
        LoadStage::Ready,
    ];
    assert!(stages.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(LoadStage::Ready.to_string(), "ready");
}

// ══════════════════════════════════════════════════════════════════════════════
// Calling
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn guest_computes_with_host_result() {
    let mut program = load(arithmetic_module(), &arithmetic_env());
    assert_eq!(program.call("main", &[]).unwrap(), Value::Int(70));
}

#[test]
fn same_signature_functions_dispatch_by_id() {
    let mut program = load(arithmetic_module(), &arithmetic_env());
    let args = [Value::from(3), Value::from(4)];
    assert_eq!(program.call("add", &args).unwrap(), Value::Int(7));
    assert_eq!(program.call("mul", &args).unwrap(), Value::Int(12));
    assert_eq!(
        program.call("add", &[Value::from(-5), Value::from(2)]).unwrap(),
        Value::Int(-3)
    );
}

#[test]
fn unknown_function_and_arity() {
    let mut program = load(arithmetic_module(), &arithmetic_env());
    assert!(matches!(
        program.call("nope", &[]),
        Err(RuntimeError::UnknownFunction(ref n)) if n == "nope"
    ));
    assert!(matches!(
        program.call("add", &[Value::from(1)]),
        Err(RuntimeError::ArityMismatch { expected: 2, found: 1, .. })
    ));
}

#[test]
fn strings_cross_into_host_functions() {
    let mut b = GuestBuilder::new();
    b.host_function(0, "Greet", &["string"], &["string"]).unwrap();
    forward_unary(&mut b, "greet", "Greet", "string", "string");
    let env = HostEnv::new().with(
        "Greet",
        HostFunctionDesc::new(|args| {
            let name = args[0].as_str().unwrap_or_default();
            Ok(Value::String(format!("hello, {name}")))
        })
        .input("name", "string")
        .output("greeting", "string"),
    );
    let mut program = load(b, &env);
    assert_eq!(
        program.call("greet", &[Value::from("world")]).unwrap(),
        Value::from("hello, world")
    );
    let long = "w".repeat(6000);
    let back = program.call("greet", &[Value::from(long.as_str())]).unwrap();
    assert_eq!(back.as_str().map(str::len), Some(6000 + "hello, ".len()));
}

#[test]
fn structs_cross_into_host_functions() {
    let mut b = GuestBuilder::new();
    b.define_struct("note", &[("id", "u32"), ("text", "string"), ("at", "vec3")])
        .unwrap();
    b.host_function(0, "Shift", &["vec3"], &["vec3"]).unwrap();
    b.host_function(1, "Describe", &["note"], &["string"]).unwrap();
    forward_unary(&mut b, "shift", "Shift", "vec3", "vec3");
    forward_unary(&mut b, "describe", "Describe", "note", "string");
    let env = HostEnv::new()
        .with(
            "Shift",
            HostFunctionDesc::new(|args| {
                let mut v = args[0].as_struct().cloned().unwrap_or_default();
                let x = v.get("x").and_then(Value::as_f64).unwrap_or_default();
                v.set("x", x + 1.0);
                Ok(Value::Struct(v))
            })
            .input("v", "vec3")
            .output("shifted", "vec3"),
        )
        .with(
            "Describe",
            HostFunctionDesc::new(|args| {
                let note = args[0].as_struct().cloned().unwrap_or_default();
                let id = note.get("id").and_then(Value::as_int).unwrap_or_default();
                let text = note.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(Value::String(format!("#{id}: {text}")))
            })
            .input("note", "note")
            .output("text", "string"),
        );
    let mut program = load(b, &env);

    let v = StructValue::new().with("x", 1.0).with("y", 2.0).with("z", 3.0);
    let shifted = program.call("shift", &[Value::Struct(v)]).unwrap();
    assert_eq!(
        shifted,
        Value::Struct(StructValue::new().with("x", 2.0).with("y", 2.0).with("z", 3.0))
    );

    let note = StructValue::new()
        .with("id", 7u32)
        .with("text", "pinned")
        .with("at", StructValue::new().with("x", 0.0).with("y", 0.0).with("z", 0.0));
    assert_eq!(
        program.call("describe", &[Value::Struct(note)]).unwrap(),
        Value::from("#7: pinned")
    );
}

#[test]
fn multiple_outputs_return_a_tuple_struct() {
    let mut b = GuestBuilder::new();
    b.host_function(0, "Pair", &[], &["i32", "string"]).unwrap();
    b.export("pair", &[], &["i32", "string"], vec![], |s| {
        let pair = s.host("Pair")?;
        Ok(vec![pair.push_id(), pair.call()])
    })
    .unwrap();
    let env = HostEnv::new().with(
        "Pair",
        HostFunctionDesc::new(|_| {
            Ok(Value::Struct(
                StructValue::new().with("0", 7).with("1", "seven"),
            ))
        })
        .output("n", "i32")
        .output("name", "string"),
    );
    let mut program = load(b, &env);
    assert_eq!(
        program.function("pair").unwrap().return_type().name(),
        "tuple_i32_string"
    );
    let result = program.call("pair", &[]).unwrap();
    assert_eq!(
        result,
        Value::Struct(StructValue::new().with("0", 7).with("1", "seven"))
    );
}

#[test]
fn void_host_function_is_called_for_effect() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let mut b = GuestBuilder::new();
    b.host_function(0, "Tick", &["u64"], &[]).unwrap();
    b.export("tick", &["u64"], &[], vec![], |s| {
        let tick = s.host("Tick")?;
        Ok(vec![tick.push_id(), Instruction::LocalGet(0), tick.call()])
    })
    .unwrap();
    let env = HostEnv::new().with(
        "Tick",
        HostFunctionDesc::new(move |args| {
            assert_eq!(args[0], Value::Int(u64::MAX as i128));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Void)
        })
        .input("n", "u64")
        .kind(HostFunctionKind::Effectful),
    );
    let mut program = load(b, &env);
    let result = program.call("tick", &[Value::from(u64::MAX)]).unwrap();
    assert!(result.is_void());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ══════════════════════════════════════════════════════════════════════════════
// Failures inside host calls
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn host_error_propagates_and_program_stays_usable() {
    let mut b = arithmetic_module();
    b.host_function(2, "Fail", &[], &["i32"]).unwrap();
    b.export("fail", &[], &["i32"], vec![], |s| {
        let fail = s.host("Fail")?;
        Ok(vec![fail.push_id(), fail.call()])
    })
    .unwrap();
    let env = arithmetic_env().with(
        "Fail",
        HostFunctionDesc::new(|_| Err("boom".into())).output("n", "i32"),
    );
    let mut program = load(b, &env);

    match program.call("fail", &[]) {
        Err(RuntimeError::HostFunctionFailed { name, source }) => {
            assert_eq!(name, "Fail");
            assert_eq!(source.to_string(), "boom");
        }
        other => panic!("expected host failure, got {other:?}"),
    }
    assert_eq!(program.call("main", &[]).unwrap(), Value::Int(70));
}

#[test]
fn host_result_of_wrong_type_is_a_mismatch() {
    let env = HostEnv::new().with(
        "Add",
        HostFunctionDesc::new(|_| Ok(Value::from("seven")))
            .input("a", "i32")
            .input("b", "i32")
            .output("sum", "i32"),
    )
    .with("Mul", mul());
    let mut program = load(arithmetic_module(), &env);
    let err = program.call("main", &[]).unwrap_err();
    assert!(
        matches!(err, RuntimeError::ValueTypeMismatch { ref field, .. } if field == "Add result"),
        "got {err}"
    );
    assert_eq!(
        program.call("mul", &[Value::from(2), Value::from(3)]).unwrap(),
        Value::Int(6)
    );
}

#[test]
fn disagreeing_signature_is_a_contract_violation() {
    let env = HostEnv::new()
        .with(
            "Add",
            HostFunctionDesc::new(|_| Ok(Value::Int(0)))
                .input("a", "i32")
                .input("b", "i64")
                .output("sum", "i32"),
        )
        .with("Mul", mul());
    let mut program = load(arithmetic_module(), &env);
    match program.call("main", &[]) {
        Err(RuntimeError::HostFunctionContractViolation {
            name,
            declared,
            key,
        }) => {
            assert_eq!(name, "Add");
            assert_eq!(declared, "callUserFunc_i32_i64_R_i32");
            assert_eq!(key, "callUserFunc_i32_i32_R_i32");
        }
        other => panic!("expected contract violation, got {other:?}"),
    }
    assert_eq!(
        program.call("mul", &[Value::from(2), Value::from(3)]).unwrap(),
        Value::Int(6)
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Configuration
// ══════════════════════════════════════════════════════════════════════════════

fn options_module() -> GuestBuilder {
    let mut b = GuestBuilder::new();
    b.export("opts", &[], &["string"], vec![], |_| {
        Ok(vec![Instruction::GlobalGet(GLOBAL_INIT_OPTS)])
    })
    .unwrap();
    b
}

#[test]
fn options_blob_reaches_guest() {
    let config = RuntimeConfig::new().with_options(serde_json::json!({ "seed": 7 }));
    let mut program = load_with(options_module(), &HostEnv::new(), config).unwrap();
    assert_eq!(
        program.call("opts", &[]).unwrap(),
        Value::from(r#"{"seed":7}"#)
    );
}

#[test]
fn no_options_leaves_empty_blob() {
    let mut program = load(options_module(), &HostEnv::new());
    assert_eq!(program.call("opts", &[]).unwrap(), Value::from(""));
}

#[test]
fn oversized_options_are_rejected() {
    let config = RuntimeConfig::new().with_options(serde_json::json!("x".repeat(5000)));
    match load_with(options_module(), &HostEnv::new(), config) {
        Err(RuntimeError::OptionsTooLarge { size }) => assert_eq!(size, 5002),
        other => panic!("expected oversized options, got {:?}", other.err()),
    }
}

#[test]
fn fuel_exhaustion_traps() {
    let mut b = GuestBuilder::new();
    b.export("spin", &[], &[], vec![], |_| {
        Ok(vec![
            Instruction::Loop(BlockType::Empty),
            Instruction::Br(0),
            Instruction::End,
        ])
    })
    .unwrap();
    forward_binary(&mut b, "noop", "Add");
    b.host_function(0, "Add", &["i32", "i32"], &["i32"]).unwrap();

    let env = HostEnv::new().with("Add", add());
    let config = RuntimeConfig::new().with_fuel(100_000);
    let mut program = load_with(b, &env, config).unwrap();

    let before = program.remaining_fuel().expect("fuel metering enabled");
    assert_eq!(
        program.call("noop", &[Value::from(1), Value::from(2)]).unwrap(),
        Value::Int(3)
    );
    assert!(program.remaining_fuel().unwrap() < before);

    let err = program.call("spin", &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::Wasm(_)), "got {err}");
}

#[test]
fn fuel_is_unmetered_by_default() {
    let program = load(options_module(), &HostEnv::new());
    assert_eq!(program.remaining_fuel(), None);
}

#[test]
fn memory_limit_stops_growth() {
    let mut b = GuestBuilder::new();
    b.export("echo", &["string"], &["string"], vec![], |_| {
        Ok(vec![Instruction::LocalGet(0)])
    })
    .unwrap();
    let config = RuntimeConfig::new().with_max_memory_bytes(64 * 1024);
    let mut program = load_with(b, &HostEnv::new(), config).unwrap();

    let small = Value::from("fits");
    assert_eq!(program.call("echo", &[small.clone()]).unwrap(), small);
    let huge = Value::from("h".repeat(100_000));
    let err = program.call("echo", &[huge]).unwrap_err();
    assert!(matches!(err, RuntimeError::Wasm(_)), "got {err}");
}

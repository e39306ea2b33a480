//! Host functions callable from guest code.
//!
//! The guest calls every host function through a trampoline shared by all
//! functions with the same signature.  The trampoline's import name is the
//! signature's dispatch key; the guest passes the function's dense id as the
//! first argument and the trampoline looks the implementation up in the
//! [`UserFuncRegistry`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use graphl_types::{dispatch_key, dispatch_key_from_names, return_type, AbiType, Type};
use serde::Serialize;
use tracing::debug;
use wasmi::{Caller, FuncType, Val, ValType};

use crate::error::{BoxError, RuntimeError, RuntimeResult};
use crate::runtime::HostState;
use crate::value::Value;

/// A host function implementation.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync>;

// ══════════════════════════════════════════════════════════════════════════════
// Host environment
// ══════════════════════════════════════════════════════════════════════════════

/// Whether a host function may be reordered or elided by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostFunctionKind {
    #[default]
    Pure,
    Effectful,
}

/// A named, typed parameter or result of a host function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// Description of a host function supplied by the embedder.
#[derive(Clone, Serialize)]
pub struct HostFunctionDesc {
    pub inputs: Vec<Param>,
    pub outputs: Vec<Param>,
    pub kind: HostFunctionKind,
    #[serde(skip)]
    imp: HostFn,
}

impl HostFunctionDesc {
    pub fn new<F>(imp: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind: HostFunctionKind::default(),
            imp: Arc::new(imp),
        }
    }

    pub fn input(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.inputs.push(Param::new(name, ty));
        self
    }

    pub fn output(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.outputs.push(Param::new(name, ty));
        self
    }

    pub fn kind(mut self, kind: HostFunctionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn input_types(&self) -> Vec<String> {
        self.inputs.iter().map(|p| p.ty.clone()).collect()
    }

    pub fn output_types(&self) -> Vec<String> {
        self.outputs.iter().map(|p| p.ty.clone()).collect()
    }

    pub(crate) fn implementation(&self) -> HostFn {
        Arc::clone(&self.imp)
    }
}

impl fmt::Debug for HostFunctionDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunctionDesc")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// The set of host functions an embedder offers a program.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    functions: BTreeMap<String, HostFunctionDesc>,
}

impl HostEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, desc: HostFunctionDesc) -> &mut Self {
        self.functions.insert(name.into(), desc);
        self
    }

    /// Builder-style [`Self::register`].
    pub fn with(mut self, name: impl Into<String>, desc: HostFunctionDesc) -> Self {
        self.register(name, desc);
        self
    }

    pub fn get(&self, name: &str) -> Option<&HostFunctionDesc> {
        self.functions.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostFunctionDesc)> {
        self.functions.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// The declaration document handed to the compiler: name → signature
    /// and kind, ordered by name.
    pub fn declarations_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.functions).unwrap_or(serde_json::Value::Null)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Registry
// ══════════════════════════════════════════════════════════════════════════════

/// A host function bound to the id the compiler assigned it.
pub(crate) struct RegisteredFunction {
    pub name: String,
    /// Type names as declared by the embedder.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub imp: HostFn,
}

/// Id → implementation, frozen once imports are resolved.
#[derive(Default)]
pub(crate) struct UserFuncRegistry {
    functions: BTreeMap<u32, RegisteredFunction>,
}

impl UserFuncRegistry {
    pub fn insert(&mut self, id: u32, function: RegisteredFunction) {
        self.functions.insert(id, function);
    }

    pub fn get(&self, id: u32) -> Option<&RegisteredFunction> {
        self.functions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Trampolines
// ══════════════════════════════════════════════════════════════════════════════

/// The signature one trampoline serves.
#[derive(Debug, Clone)]
pub(crate) struct Signature {
    pub key: String,
    pub inputs: Vec<Type>,
    pub outputs: Vec<Type>,
}

impl Signature {
    pub fn new(inputs: Vec<Type>, outputs: Vec<Type>) -> Self {
        Self {
            key: dispatch_key(&inputs, &outputs),
            inputs,
            outputs,
        }
    }

    /// Wasm type of the import: `(id: i32, args...) -> result?`.
    pub fn func_type(&self) -> FuncType {
        let params = std::iter::once(ValType::I32)
            .chain(self.inputs.iter().filter_map(Type::abi).map(val_type))
            .collect::<Vec<_>>();
        let results = return_type(&self.outputs)
            .abi()
            .map(val_type)
            .into_iter()
            .collect::<Vec<_>>();
        FuncType::new(params, results)
    }

    fn matches(&self, function: &RegisteredFunction) -> bool {
        type_names(&self.inputs) == function.inputs && type_names(&self.outputs) == function.outputs
    }
}

fn type_names(types: &[Type]) -> Vec<&str> {
    types.iter().map(Type::name).collect()
}

pub(crate) fn val_type(abi: AbiType) -> ValType {
    match abi {
        AbiType::I32 => ValType::I32,
        AbiType::I64 => ValType::I64,
        AbiType::F32 => ValType::F32,
        AbiType::F64 => ValType::F64,
    }
}

/// Build the trampoline for `signature`.
///
/// Errors are parked in the store's [`HostState`] and the engine only sees a
/// trap; the caller of the export retrieves the original error afterwards.
pub(crate) fn trampoline(
    signature: Arc<Signature>,
    registry: Arc<UserFuncRegistry>,
) -> impl Fn(Caller<'_, HostState>, &[Val], &mut [Val]) -> Result<(), wasmi::Error> + Send + Sync + 'static
{
    move |mut caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
        dispatch(&mut caller, &signature, &registry, params, results).map_err(|err| {
            let message = err.to_string();
            caller.data_mut().park_error(err);
            wasmi::Error::new(message)
        })
    }
}

fn dispatch(
    caller: &mut Caller<'_, HostState>,
    signature: &Signature,
    registry: &UserFuncRegistry,
    params: &[Val],
    results: &mut [Val],
) -> RuntimeResult<()> {
    let (id, args) = params
        .split_first()
        .ok_or_else(|| RuntimeError::GuestProtocol("host call without function id".into()))?;
    let id = id
        .i32()
        .ok_or_else(|| RuntimeError::GuestProtocol("function id is not an i32".into()))?
        as u32;
    let function = registry
        .get(id)
        .ok_or(RuntimeError::UnknownHostFunctionId(id))?;

    if !signature.matches(function) {
        return Err(RuntimeError::HostFunctionContractViolation {
            name: function.name.clone(),
            declared: dispatch_key_from_names(&function.inputs, &function.outputs),
            key: signature.key.clone(),
        });
    }
    if args.len() != signature.inputs.len() {
        return Err(RuntimeError::ArityMismatch {
            name: function.name.clone(),
            expected: signature.inputs.len(),
            found: args.len(),
        });
    }

    let codec = caller.data().codec()?;
    debug!(function = %function.name, id, key = %signature.key, "dispatching host call");

    let mut values = Vec::with_capacity(args.len());
    for (raw, ty) in args.iter().zip(&signature.inputs) {
        values.push(codec.guest_to_host(caller, raw, ty)?);
    }

    let result = (function.imp)(&values).map_err(|source| RuntimeError::HostFunctionFailed {
        name: function.name.clone(),
        source,
    })?;

    let ret = return_type(&signature.outputs);
    if let Some(slot) = results.first_mut() {
        let field = format!("{} result", function.name);
        *slot = codec.host_to_guest(caller, &result, &ret, &field)?;
    }
    Ok(())
}

//! Program instantiation and the exported-function calling surface.
//!
//! Loading walks a fixed sequence of stages:
//!
//! ```text
//! Unloaded → MetadataParsed → ImportsResolved → Instantiated → Ready
//! ```
//!
//! A failure at any stage aborts the load; no [`Program`] is produced.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use graphl_types::abi::{HOST_MODULE, MEMORY_EXPORT, SET_INIT_OPTS};
use graphl_types::{
    dispatch_key_from_names, return_type, AbiType, HostFunctionMeta, Metadata, Type, TypeTable,
    TRANSFER_BUFFER_EXPORT,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use wasmi::core::{F32, F64};
use wasmi::{
    Engine, Func, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Val,
};

use crate::codec::ValueCodec;
use crate::config::RuntimeConfig;
use crate::dispatch::{trampoline, HostEnv, RegisteredFunction, Signature, UserFuncRegistry};
use crate::error::{RuntimeError, RuntimeResult};
use crate::metadata;
use crate::transfer::TransferBuffer;
use crate::value::Value;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle stage of a program load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadStage {
    Unloaded,
    MetadataParsed,
    ImportsResolved,
    Instantiated,
    Ready,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadStage::Unloaded => "unloaded",
            LoadStage::MetadataParsed => "metadata-parsed",
            LoadStage::ImportsResolved => "imports-resolved",
            LoadStage::Instantiated => "instantiated",
            LoadStage::Ready => "ready",
        })
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Host state
// ══════════════════════════════════════════════════════════════════════════════

/// Per-instance data carried by the sandbox store.
#[derive(Debug)]
pub struct HostState {
    runtime_id: u64,
    codec: Option<Arc<ValueCodec>>,
    pending_error: Option<RuntimeError>,
    limits: StoreLimits,
}

impl HostState {
    fn new(runtime_id: u64, limits: StoreLimits) -> Self {
        Self {
            runtime_id,
            codec: None,
            pending_error: None,
            limits,
        }
    }

    pub fn runtime_id(&self) -> u64 {
        self.runtime_id
    }

    /// The codec, available once the instance exists.
    pub(crate) fn codec(&self) -> RuntimeResult<Arc<ValueCodec>> {
        self.codec.clone().ok_or_else(|| {
            RuntimeError::GuestProtocol("host function called during instantiation".to_string())
        })
    }

    /// Keep an error raised inside a trampoline until the export returns.
    pub(crate) fn park_error(&mut self, err: RuntimeError) {
        self.pending_error = Some(err);
    }

    fn take_error(&mut self) -> Option<RuntimeError> {
        self.pending_error.take()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Program
// ══════════════════════════════════════════════════════════════════════════════

/// An exported function bound to its declared signature.
#[derive(Debug, Clone)]
pub struct ExportedFunction {
    name: String,
    inputs: Vec<Type>,
    outputs: Vec<Type>,
    func: Func,
}

impl ExportedFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Type] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Type] {
        &self.outputs
    }

    /// The type of the single value the export returns: void, the sole
    /// output, or the synthesized tuple struct.
    pub fn return_type(&self) -> Type {
        return_type(&self.outputs)
    }

    pub fn func(&self) -> Func {
        self.func
    }
}

/// A loaded, ready-to-call guest program.
pub struct Program {
    store: Store<HostState>,
    instance: Instance,
    codec: Arc<ValueCodec>,
    metadata: Metadata,
    functions: BTreeMap<String, ExportedFunction>,
    fingerprint: String,
}

/// Export signatures resolved against the type table.
struct ExportSignature {
    name: String,
    inputs: Vec<Type>,
    outputs: Vec<Type>,
}

impl Program {
    /// Load `wasm`, wire the host functions it requires from `env`, and
    /// bind its exports.
    pub fn instantiate(wasm: &[u8], env: &HostEnv, config: RuntimeConfig) -> RuntimeResult<Self> {
        let runtime_id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let fingerprint = fingerprint(wasm);
        info!(runtime_id, %fingerprint, bytes = wasm.len(), stage = %LoadStage::Unloaded, "loading program");

        // ── Metadata ────────────────────────────────────────────────────
        let metadata = metadata::parse(wasm)?;
        let table = TypeTable::from_metadata(&metadata)?;
        let exports = metadata
            .functions
            .iter()
            .map(|f| {
                Ok(ExportSignature {
                    name: f.name.clone(),
                    inputs: table.resolve_all(&f.inputs)?,
                    outputs: table.resolve_all(&f.outputs)?,
                })
            })
            .collect::<RuntimeResult<Vec<_>>>()?;
        info!(
            runtime_id,
            functions = exports.len(),
            host_functions = metadata.host.functions.len(),
            stage = %LoadStage::MetadataParsed,
            "metadata parsed"
        );

        // ── Imports ─────────────────────────────────────────────────────
        let (registry, signatures) = resolve_imports(&metadata, &table, env)?;
        info!(
            runtime_id,
            registered = registry.len(),
            trampolines = signatures.len(),
            stage = %LoadStage::ImportsResolved,
            "imports resolved"
        );

        // ── Instantiate ─────────────────────────────────────────────────
        let engine = Engine::new(&config.engine_config());
        let module = Module::new(&engine, wasm)?;
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = config.max_memory_bytes {
            limits = limits.memory_size(bytes);
        }
        let mut store = Store::new(&engine, HostState::new(runtime_id, limits.build()));
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel {
            store.set_fuel(fuel)?;
        }

        let registry = Arc::new(registry);
        let mut linker = Linker::<HostState>::new(&engine);
        for signature in signatures {
            let signature = Arc::new(signature);
            linker
                .func_new(
                    HOST_MODULE,
                    &signature.key,
                    signature.func_type(),
                    trampoline(Arc::clone(&signature), Arc::clone(&registry)),
                )
                .map_err(|e| RuntimeError::Wasm(e.to_string()))?;
        }
        let instance = linker.instantiate(&mut store, &module)?.start(&mut store)?;

        let memory = instance
            .get_memory(&store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::MissingExport(MEMORY_EXPORT.to_string()))?;
        let base = instance
            .get_global(&store, TRANSFER_BUFFER_EXPORT)
            .and_then(|g| g.get(&store).i32())
            .ok_or_else(|| RuntimeError::MissingExport(TRANSFER_BUFFER_EXPORT.to_string()))?;
        let transfer = TransferBuffer::new(memory, base as u32, &store)?;
        let codec = Arc::new(ValueCodec::new(runtime_id, instance, transfer));
        store.data_mut().codec = Some(Arc::clone(&codec));
        info!(runtime_id, transfer_buffer = base, stage = %LoadStage::Instantiated, "instantiated");

        // ── Bind exports ────────────────────────────────────────────────
        let mut functions = BTreeMap::new();
        for export in exports {
            let func = instance
                .get_func(&store, &export.name)
                .ok_or_else(|| RuntimeError::MissingExport(export.name.clone()))?;
            functions.insert(
                export.name.clone(),
                ExportedFunction {
                    name: export.name,
                    inputs: export.inputs,
                    outputs: export.outputs,
                    func,
                },
            );
        }

        let mut program = Self {
            store,
            instance,
            codec,
            metadata,
            functions,
            fingerprint,
        };
        if let Some(options) = &config.options {
            program.send_options(options)?;
        }
        info!(runtime_id, stage = %LoadStage::Ready, "program ready");
        Ok(program)
    }

    /// Call an exported function by name.
    ///
    /// Argument `i` is reported as `name(i)` in type mismatch errors.
    pub fn call(&mut self, name: &str, args: &[Value]) -> RuntimeResult<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownFunction(name.to_string()))?;
        if args.len() != function.inputs.len() {
            return Err(RuntimeError::ArityMismatch {
                name: name.to_string(),
                expected: function.inputs.len(),
                found: args.len(),
            });
        }

        // Every argument is checked before the first one is written to the guest.
        let prepared = args
            .iter()
            .zip(&function.inputs)
            .enumerate()
            .map(|(i, (arg, ty))| self.codec.prepare(arg, ty, &format!("{name}({i})")))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let mut params = Vec::with_capacity(prepared.len());
        for arg in prepared {
            params.push(self.codec.commit(&mut self.store, arg)?);
        }

        let ret = function.return_type();
        let mut results = ret.abi().map(zero).into_iter().collect::<Vec<_>>();
        self.store.data_mut().take_error();
        debug!(function = name, args = params.len(), "calling export");
        if let Err(err) = function.func.call(&mut self.store, &params, &mut results) {
            return Err(self
                .store
                .data_mut()
                .take_error()
                .unwrap_or_else(|| err.into()));
        }

        match results.first() {
            Some(raw) => self.codec.guest_to_host(&mut self.store, raw, &ret),
            None => Ok(Value::Void),
        }
    }

    /// Hand the serialized options blob to the guest's `set_init_opts`.
    fn send_options(&mut self, options: &serde_json::Value) -> RuntimeResult<()> {
        let blob = options.to_string().into_bytes();
        if blob.len() > TransferBuffer::SIZE {
            return Err(RuntimeError::OptionsTooLarge { size: blob.len() });
        }
        self.codec.transfer().write(&mut self.store, 0, &blob)?;
        let set_init_opts = self
            .instance
            .get_typed_func::<i32, i32>(&self.store, SET_INIT_OPTS)
            .map_err(|_| RuntimeError::MissingExport(SET_INIT_OPTS.to_string()))?;
        if set_init_opts.call(&mut self.store, blob.len() as i32)? == 0 {
            return Err(RuntimeError::OptionsRejected);
        }
        debug!(bytes = blob.len(), "sent options blob");
        Ok(())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn function(&self, name: &str) -> Option<&ExportedFunction> {
        self.functions.get(name)
    }

    /// Exported functions, ordered by name.
    pub fn functions(&self) -> impl Iterator<Item = &ExportedFunction> {
        self.functions.values()
    }

    /// The underlying sandbox instance.
    pub fn instance(&self) -> Instance {
        self.instance
    }

    pub fn store(&self) -> &Store<HostState> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    /// SHA-256 of the loaded binary, lowercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn runtime_id(&self) -> u64 {
        self.store.data().runtime_id()
    }

    /// Fuel left, when metering is enabled.
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("runtime_id", &self.runtime_id())
            .field("fingerprint", &self.fingerprint)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Import resolution
// ══════════════════════════════════════════════════════════════════════════════

/// Match the environment against the program's required host functions.
///
/// Returns the id registry and one signature per distinct dispatch key.
fn resolve_imports(
    metadata: &Metadata,
    table: &TypeTable,
    env: &HostEnv,
) -> RuntimeResult<(UserFuncRegistry, Vec<Signature>)> {
    let mut required: BTreeMap<&str, &HostFunctionMeta> = metadata
        .host
        .functions
        .iter()
        .map(|f| (f.name.as_str(), f))
        .collect();
    let mut registry = UserFuncRegistry::default();
    let mut signatures: BTreeMap<String, Signature> = BTreeMap::new();

    for (name, desc) in env.iter() {
        let Some(meta) = required.remove(name) else {
            warn!(function = name, "host function not required by program");
            continue;
        };
        let signature = Signature::new(
            table.resolve_all(&meta.inputs)?,
            table.resolve_all(&meta.outputs)?,
        );
        let inputs = desc.input_types();
        let outputs = desc.output_types();
        if inputs != meta.inputs || outputs != meta.outputs {
            warn!(
                function = name,
                declared = %dispatch_key_from_names(&inputs, &outputs),
                key = %signature.key,
                "host function signature disagrees with program"
            );
        }
        registry.insert(
            meta.id,
            RegisteredFunction {
                name: name.to_string(),
                inputs,
                outputs,
                imp: desc.implementation(),
            },
        );
        if !signatures.contains_key(&signature.key) {
            debug!(key = %signature.key, "created trampoline");
            signatures.insert(signature.key.clone(), signature);
        }
    }

    if !required.is_empty() {
        let names = metadata
            .host
            .functions
            .iter()
            .filter(|f| required.contains_key(f.name.as_str()))
            .map(|f| f.name.clone())
            .collect();
        return Err(RuntimeError::ImportsUnresolved { names });
    }
    Ok((registry, signatures.into_values().collect()))
}

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn fingerprint(wasm: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wasm);
    hex::encode(hasher.finalize())
}

fn zero(abi: AbiType) -> Val {
    match abi {
        AbiType::I32 => Val::I32(0),
        AbiType::I64 => Val::I64(0),
        AbiType::F32 => Val::F32(F32::from_float(0.0)),
        AbiType::F64 => Val::F64(F64::from_float(0.0)),
    }
}

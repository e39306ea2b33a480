//! Guest module assembler.
//!
//! Orchestrates module assembly:
//! 1. Resolve every signature against the type table
//! 2. Assign function indices (imports → runtime helpers → struct helpers → exports)
//! 3. Emit runtime and per-struct helper functions
//! 4. Emit user-supplied export bodies
//! 5. Embed the metadata document in the data section
//! 6. Assemble all sections and validate with `wasmparser`

use std::collections::{BTreeMap, HashMap};

use graphl_types::abi::{self, HOST_MODULE, MEMORY_EXPORT};
use graphl_types::{
    dispatch_key, return_type, AbiType, FieldDecl, FunctionMeta, HostFunctionMeta, HostMeta,
    Metadata, StructDecl, StructType, Type, TypeTable, TRANSFER_BUFFER_EXPORT,
    TRANSFER_BUFFER_SIZE,
};
use wasm_encoder::{
    CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction,
    MemorySection, MemoryType, Module, TypeSection, ValType,
};

use crate::error::{GuestError, GuestResult};
use crate::layout::*;
use crate::runtime::{self, HelperIndices, RT_FUNC_COUNT, STRUCT_FUNC_COUNT};

/// Produces the instructions of an export body once indices are known.
///
/// The trailing `end` is appended by the assembler.
pub type BodyFn = Box<dyn FnOnce(&Symbols) -> GuestResult<Vec<Instruction<'static>>>>;

// ══════════════════════════════════════════════════════════════════════════════
// Symbols
// ══════════════════════════════════════════════════════════════════════════════

/// A resolved host function: its dense id and the index of the shared
/// dispatch import it is called through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRef {
    pub id: u32,
    pub func: u32,
}

impl HostRef {
    /// Instructions that push the id; arguments follow, then [`Self::call`].
    pub fn push_id(&self) -> Instruction<'static> {
        Instruction::I32Const(self.id as i32)
    }

    pub fn call(&self) -> Instruction<'static> {
        Instruction::Call(self.func)
    }
}

/// Function indices visible to export bodies.
#[derive(Debug, Default)]
pub struct Symbols {
    funcs: HashMap<String, u32>,
    hosts: HashMap<String, HostRef>,
}

impl Symbols {
    /// Index of an exported function or contract entry point by export name.
    pub fn func(&self, name: &str) -> GuestResult<u32> {
        self.funcs
            .get(name)
            .copied()
            .ok_or_else(|| GuestError::UnresolvedSymbol(name.to_string()))
    }

    /// A required host function by name.
    pub fn host(&self, name: &str) -> GuestResult<HostRef> {
        self.hosts
            .get(name)
            .copied()
            .ok_or_else(|| GuestError::UnresolvedSymbol(name.to_string()))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Builder
// ══════════════════════════════════════════════════════════════════════════════

struct HostImport {
    id: u32,
    name: String,
    inputs: Vec<Type>,
    outputs: Vec<Type>,
}

struct ExportDef {
    name: String,
    inputs: Vec<Type>,
    outputs: Vec<Type>,
    locals: Vec<ValType>,
    body: BodyFn,
}

/// Builds a guest module implementing the full calling contract.
///
/// ```ignore
/// let mut b = GuestBuilder::new();
/// b.host_function(0, "Add", &["i32", "i32"], &["i32"])?;
/// b.export("main", &[], &["i32"], vec![], |s| {
///     let add = s.host("Add")?;
///     Ok(vec![add.push_id(), I32Const(3), I32Const(4), add.call()])
/// })?;
/// let wasm = b.finish()?;
/// ```
pub struct GuestBuilder {
    table: TypeTable,
    struct_decls: Vec<StructDecl>,
    hosts: Vec<HostImport>,
    exports: Vec<ExportDef>,
    embed_metadata: bool,
}

impl Default for GuestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestBuilder {
    pub fn new() -> Self {
        Self {
            table: TypeTable::new(),
            struct_decls: Vec::new(),
            hosts: Vec::new(),
            exports: Vec::new(),
            embed_metadata: true,
        }
    }

    /// Declare a struct.  Field types must already be known.
    pub fn define_struct(&mut self, name: &str, fields: &[(&str, &str)]) -> GuestResult<Type> {
        let decl = StructDecl {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(field, ty)| FieldDecl {
                    name: field.to_string(),
                    ty: ty.to_string(),
                })
                .collect(),
        };
        let ty = self.table.define_struct(&decl)?;
        check_struct_size(&ty)?;
        self.struct_decls.push(decl);
        Ok(ty)
    }

    /// Require a host function, imported through its signature's dispatch key.
    pub fn host_function(
        &mut self,
        id: u32,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> GuestResult<()> {
        if self.hosts.iter().any(|h| h.id == id) {
            return Err(GuestError::DuplicateHostId(id));
        }
        let inputs = self.resolve(inputs)?;
        let outputs = self.resolve(outputs)?;
        check_struct_size(&return_type(&outputs))?;
        self.hosts.push(HostImport {
            id,
            name: name.to_string(),
            inputs,
            outputs,
        });
        Ok(())
    }

    /// Export a function whose body is produced once indices are assigned.
    pub fn export<F>(
        &mut self,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
        locals: Vec<ValType>,
        body: F,
    ) -> GuestResult<()>
    where
        F: FnOnce(&Symbols) -> GuestResult<Vec<Instruction<'static>>> + 'static,
    {
        if self.exports.iter().any(|e| e.name == name) || is_contract_name(name) {
            return Err(GuestError::DuplicateExport(name.to_string()));
        }
        let inputs = self.resolve(inputs)?;
        let outputs = self.resolve(outputs)?;
        check_struct_size(&return_type(&outputs))?;
        self.exports.push(ExportDef {
            name: name.to_string(),
            inputs,
            outputs,
            locals,
            body: Box::new(body),
        });
        Ok(())
    }

    /// Leave the metadata document out of the binary.
    pub fn without_metadata(&mut self) -> &mut Self {
        self.embed_metadata = false;
        self
    }

    /// The metadata document describing the module built so far.
    pub fn metadata(&self) -> Metadata {
        let names = |types: &[Type]| -> Vec<String> {
            types.iter().map(|t| t.name().to_string()).collect()
        };
        Metadata {
            functions: self
                .exports
                .iter()
                .map(|e| FunctionMeta {
                    name: e.name.clone(),
                    inputs: names(&e.inputs),
                    outputs: names(&e.outputs),
                })
                .collect(),
            host: HostMeta {
                functions: self
                    .hosts
                    .iter()
                    .map(|h| HostFunctionMeta {
                        id: h.id,
                        name: h.name.clone(),
                        inputs: names(&h.inputs),
                        outputs: names(&h.outputs),
                    })
                    .collect(),
            },
            structs: self.struct_decls.clone(),
        }
    }

    fn resolve(&self, names: &[&str]) -> GuestResult<Vec<Type>> {
        names
            .iter()
            .map(|n| self.table.resolve(n).map_err(GuestError::from))
            .collect()
    }

    /// Assemble and validate the module.
    pub fn finish(self) -> GuestResult<Vec<u8>> {
        let metadata = if self.embed_metadata {
            self.metadata().to_embedded_json()?
        } else {
            Vec::new()
        };
        let structs = self.struct_types();

        let mut types = TypeInterner::default();
        let mut symbols = Symbols::default();

        // ── Imports: one per distinct dispatch key ──────────────────────
        let mut import_keys: Vec<(String, u32)> = Vec::new();
        for host in &self.hosts {
            let key = dispatch_key(&host.inputs, &host.outputs);
            let func = match import_keys.iter().position(|(k, _)| *k == key) {
                Some(idx) => idx as u32,
                None => {
                    let mut params = vec![ValType::I32];
                    params.extend(abi_types(&host.inputs));
                    let ty = types.intern(params, abi_types(&[return_type(&host.outputs)]));
                    import_keys.push((key, ty));
                    (import_keys.len() - 1) as u32
                }
            };
            symbols
                .hosts
                .insert(host.name.clone(), HostRef { id: host.id, func });
        }
        let import_count = import_keys.len() as u32;
        let ix = HelperIndices::new(import_count);

        // ── Index assignment ────────────────────────────────────────────
        let contract = [
            (abi::CREATE_ARRAY, ix.create_array),
            (abi::COMMIT_ARRAY_PAGE, ix.commit_array_page),
            (abi::COPY_ARRAY_PAGE, ix.copy_array_page),
            (abi::SET_INIT_OPTS, import_count + runtime::RT_SET_INIT_OPTS),
        ];
        for (name, idx) in contract {
            symbols.funcs.insert(name.to_string(), idx);
        }
        let struct_base = import_count + RT_FUNC_COUNT;
        for (i, st) in structs.iter().enumerate() {
            let base = struct_base + i as u32 * STRUCT_FUNC_COUNT;
            for (offset, name) in struct_helper_names(st.name()).into_iter().enumerate() {
                symbols.funcs.insert(name, base + offset as u32);
            }
        }
        let export_base = struct_base + structs.len() as u32 * STRUCT_FUNC_COUNT;
        for (i, export) in self.exports.iter().enumerate() {
            symbols
                .funcs
                .insert(export.name.clone(), export_base + i as u32);
        }

        // ── Function + code sections ────────────────────────────────────
        let mut funcs = FunctionSection::new();
        let mut code = CodeSection::new();
        let i32x = |n: usize| vec![ValType::I32; n];

        // RT_ALLOC
        funcs.function(types.intern(i32x(1), i32x(1)));
        code.function(&runtime::emit_alloc());
        // RT_CREATE_ARRAY
        funcs.function(types.intern(i32x(1), i32x(1)));
        code.function(&runtime::emit_create_array(ix));
        // RT_COMMIT_ARRAY_PAGE
        funcs.function(types.intern(i32x(2), vec![]));
        code.function(&runtime::emit_commit_array_page());
        // RT_COPY_ARRAY_PAGE
        funcs.function(types.intern(i32x(2), i32x(1)));
        code.function(&runtime::emit_copy_array_page());
        // RT_SET_INIT_OPTS
        funcs.function(types.intern(i32x(1), i32x(1)));
        code.function(&runtime::emit_set_init_opts(ix));

        for st in &structs {
            funcs.function(types.intern(vec![], i32x(1)));
            code.function(&runtime::emit_materialize_struct(st, ix));
            funcs.function(types.intern(i32x(4), vec![]));
            code.function(&runtime::emit_commit_struct_array(st, ix));
            funcs.function(types.intern(i32x(1), i32x(1)));
            code.function(&runtime::emit_extract_struct_fields(st));
            funcs.function(types.intern(i32x(3), i32x(1)));
            code.function(&runtime::emit_extract_struct_array(st, ix));
        }

        let mut export_names = Vec::with_capacity(self.exports.len());
        for export in self.exports {
            let ty = types.intern(
                abi_types(&export.inputs),
                abi_types(&[return_type(&export.outputs)]),
            );
            funcs.function(ty);
            let mut f = Function::new(export.locals.iter().map(|t| (1, *t)));
            for instruction in (export.body)(&symbols)? {
                f.instruction(&instruction);
            }
            f.instruction(&Instruction::End);
            code.function(&f);
            export_names.push(export.name);
        }

        // ── Import section ──────────────────────────────────────────────
        let mut imports = ImportSection::new();
        for (key, ty) in &import_keys {
            imports.import(HOST_MODULE, key, EntityType::Function(*ty));
        }

        // ── Memory section ──────────────────────────────────────────────
        let mut memory = MemorySection::new();
        memory.memory(MemoryType {
            minimum: INITIAL_MEMORY_PAGES,
            maximum: Some(MAX_MEMORY_PAGES),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });

        // ── Global section ──────────────────────────────────────────────
        let mut globals = GlobalSection::new();
        // GLOBAL_HEAP_PTR, starts after the metadata document
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: true,
                shared: false,
            },
            &ConstExpr::i32_const(heap_start(metadata.len() as u32) as i32),
        );
        // GLOBAL_TRANSFER_BUFFER
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: false,
                shared: false,
            },
            &ConstExpr::i32_const(TRANSFER_BUFFER_OFFSET as i32),
        );
        // GLOBAL_INIT_OPTS
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: true,
                shared: false,
            },
            &ConstExpr::i32_const(0),
        );

        // ── Export section ──────────────────────────────────────────────
        let mut exports = ExportSection::new();
        exports.export(MEMORY_EXPORT, ExportKind::Memory, 0);
        exports.export(
            TRANSFER_BUFFER_EXPORT,
            ExportKind::Global,
            GLOBAL_TRANSFER_BUFFER,
        );
        for (name, idx) in contract {
            exports.export(name, ExportKind::Func, idx);
        }
        for st in &structs {
            for name in struct_helper_names(st.name()) {
                exports.export(&name, ExportKind::Func, symbols.func(&name)?);
            }
        }
        for name in &export_names {
            exports.export(name, ExportKind::Func, symbols.func(name)?);
        }

        // ── Data section ────────────────────────────────────────────────
        let mut data = DataSection::new();
        if !metadata.is_empty() {
            data.active(
                0,
                &ConstExpr::i32_const(METADATA_OFFSET as i32),
                metadata.iter().copied(),
            );
        }

        let custom = CustomSection {
            name: CUSTOM_SECTION_NAME.into(),
            data: ASSEMBLER_VERSION.as_bytes().into(),
        };

        let mut module = Module::new();
        module.section(&types.section());
        module.section(&imports);
        module.section(&funcs);
        module.section(&memory);
        module.section(&globals);
        module.section(&exports);
        module.section(&code);
        module.section(&data);
        module.section(&custom);

        let wasm_bytes = module.finish();
        wasmparser::validate(&wasm_bytes)
            .map_err(|e| GuestError::ValidationFailed(format!("{e}")))?;
        Ok(wasm_bytes)
    }

    /// Every struct needing helpers: table structs plus synthesized tuples.
    fn struct_types(&self) -> Vec<StructType> {
        let mut out: BTreeMap<String, StructType> = self
            .table
            .structs()
            .map(|st| (st.name().to_string(), st.clone()))
            .collect();
        let signatures = self
            .hosts
            .iter()
            .map(|h| &h.outputs)
            .chain(self.exports.iter().map(|e| &e.outputs));
        for outputs in signatures {
            if outputs.len() > 1 {
                if let Some(st) = return_type(outputs).as_struct() {
                    out.entry(st.name().to_string()).or_insert_with(|| st.clone());
                }
            }
        }
        out.into_values().collect()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct TypeInterner {
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
}

impl TypeInterner {
    fn intern(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        let sig = (params, results);
        match self.types.iter().position(|t| *t == sig) {
            Some(idx) => idx as u32,
            None => {
                self.types.push(sig);
                (self.types.len() - 1) as u32
            }
        }
    }

    fn section(&self) -> TypeSection {
        let mut section = TypeSection::new();
        for (params, results) in &self.types {
            section
                .ty()
                .function(params.iter().copied(), results.iter().copied());
        }
        section
    }
}

fn val_type(abi: AbiType) -> ValType {
    match abi {
        AbiType::I32 => ValType::I32,
        AbiType::I64 => ValType::I64,
        AbiType::F32 => ValType::F32,
        AbiType::F64 => ValType::F64,
    }
}

fn abi_types(types: &[Type]) -> Vec<ValType> {
    types.iter().filter_map(Type::abi).map(val_type).collect()
}

fn struct_helper_names(name: &str) -> [String; 4] {
    [
        abi::materialize_struct_fields(name),
        abi::commit_struct_array(name),
        abi::extract_struct_fields(name),
        abi::extract_struct_array(name),
    ]
}

fn is_contract_name(name: &str) -> bool {
    matches!(
        name,
        abi::MEMORY_EXPORT
            | abi::CREATE_ARRAY
            | abi::COMMIT_ARRAY_PAGE
            | abi::COPY_ARRAY_PAGE
            | abi::SET_INIT_OPTS
            | TRANSFER_BUFFER_EXPORT
    ) || name.starts_with("materialize_struct_")
        || name.starts_with("commit_struct_")
        || name.starts_with("extract_struct_")
}

fn check_struct_size(ty: &Type) -> GuestResult<()> {
    match ty.as_struct() {
        Some(st) if st.size() > TRANSFER_BUFFER_SIZE => Err(GuestError::StructTooLarge {
            name: st.name().to_string(),
            size: st.size(),
        }),
        _ => Ok(()),
    }
}

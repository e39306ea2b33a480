//! Conversion between host [`Value`]s and guest representations.
//!
//! Fixed-width values cross the boundary as plain wasm values.  Strings and
//! structs live in guest memory and cross as `i32` handles; their bytes are
//! streamed through the [`TransferBuffer`] one page at a time.
//!
//! ```text
//! string encode:  create_array(len) → h;  { write page; commit_array_page(h, off) }*
//! string decode:  { n = copy_array_page(h, off); read page } until n == 0
//! struct encode:  write packed fields; materialize_struct_T_fields() → h;
//!                 per string slot: { write page; commit_struct_T_array(h, slot, off, len) }+
//! struct decode:  extract_struct_T_fields(h) → slots; read packed fields;
//!                 per slot: { n = extract_struct_T_array(h, slot, off) } until n == 0
//! ```

use graphl_types::abi::{self, COMMIT_ARRAY_PAGE, COPY_ARRAY_PAGE, CREATE_ARRAY};
use graphl_types::{Primitive, StructType, Type};
use tracing::trace;
use wasmi::core::{F32, F64};
use wasmi::{AsContext, AsContextMut, Instance, TypedFunc, Val, WasmParams, WasmResults};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::HostState;
use crate::transfer::TransferBuffer;
use crate::value::{GuestHandle, StructValue, Value};

const PAGE: usize = TransferBuffer::SIZE;

/// A host value that passed every check for its guest type but has not been
/// written to the guest yet.
#[derive(Debug)]
pub enum Prepared<'v> {
    Fixed(Val),
    String { text: &'v str, len: i32 },
    Struct(PackedStruct<'v>),
}

/// Packed fixed-width fields of a struct plus its string slots in slot
/// order, or the guest handle it already has.
#[derive(Debug)]
pub struct PackedStruct<'v> {
    ty: &'v StructType,
    reuse: Option<i32>,
    fields: Vec<u8>,
    strings: Vec<(&'v str, i32)>,
}

/// Encodes and decodes values for one program instance.
#[derive(Debug)]
pub struct ValueCodec {
    runtime_id: u64,
    instance: Instance,
    transfer: TransferBuffer,
}

impl ValueCodec {
    pub(crate) fn new(runtime_id: u64, instance: Instance, transfer: TransferBuffer) -> Self {
        Self {
            runtime_id,
            instance,
            transfer,
        }
    }

    pub fn transfer(&self) -> &TransferBuffer {
        &self.transfer
    }

    /// Convert a host value into its guest representation.
    ///
    /// `field` names the value in mismatch reports.  Equivalent to
    /// [`prepare`](Self::prepare) followed by [`commit`](Self::commit).
    pub fn host_to_guest<C>(
        &self,
        ctx: &mut C,
        value: &Value,
        ty: &Type,
        field: &str,
    ) -> RuntimeResult<Val>
    where
        C: AsContextMut<Data = HostState>,
    {
        let prepared = self.prepare(value, ty, field)?;
        self.commit(ctx, prepared)
    }

    /// Check `value` against `ty` and pack it without touching the guest.
    ///
    /// Every range, kind and length check happens here, so a value that
    /// prepares successfully can only fail to commit on a guest fault.
    pub fn prepare<'v>(
        &self,
        value: &'v Value,
        ty: &'v Type,
        field: &str,
    ) -> RuntimeResult<Prepared<'v>> {
        match (ty, value) {
            (Type::Struct(st), Value::Struct(sv)) => {
                Ok(Prepared::Struct(self.pack_struct(sv, st, field)?))
            }
            (Type::Primitive(Primitive::String), Value::String(s)) => Ok(Prepared::String {
                len: stream_len(s.len(), field)?,
                text: s,
            }),
            (Type::Primitive(Primitive::Void), _) => Err(RuntimeError::GuestProtocol(format!(
                "`{field}` is declared void and has no guest representation"
            ))),
            (Type::Primitive(p), value) if !ty.is_array() => {
                Ok(Prepared::Fixed(encode_primitive(*p, value, field)?))
            }
            (ty, value) => Err(mismatch(field, ty.name(), value)),
        }
    }

    /// Write a prepared value into the guest.
    pub fn commit<C>(&self, ctx: &mut C, prepared: Prepared<'_>) -> RuntimeResult<Val>
    where
        C: AsContextMut<Data = HostState>,
    {
        Ok(match prepared {
            Prepared::Fixed(val) => val,
            Prepared::String { text, len } => Val::I32(self.encode_string(ctx, text, len)?),
            Prepared::Struct(packed) => Val::I32(self.commit_struct(ctx, packed)?),
        })
    }

    /// Convert a guest value back into a host value.
    pub fn guest_to_host<C>(&self, ctx: &mut C, raw: &Val, ty: &Type) -> RuntimeResult<Value>
    where
        C: AsContextMut<Data = HostState>,
    {
        match ty {
            Type::Primitive(Primitive::Void) => Ok(Value::Void),
            Type::Primitive(Primitive::String) => {
                let handle = expect_i32(raw, ty)?;
                Ok(Value::String(self.decode_string(ctx, handle)?))
            }
            Type::Primitive(p) => decode_primitive(*p, raw),
            Type::Struct(st) => {
                let handle = expect_i32(raw, ty)?;
                Ok(Value::Struct(self.decode_struct(ctx, handle, st)?))
            }
        }
    }

    // ── Strings ──────────────────────────────────────────────────────────

    fn encode_string<C>(&self, ctx: &mut C, s: &str, len: i32) -> RuntimeResult<i32>
    where
        C: AsContextMut<Data = HostState>,
    {
        let bytes = s.as_bytes();
        let create: TypedFunc<i32, i32> = self.func(ctx, CREATE_ARRAY)?;
        let commit: TypedFunc<(i32, i32), ()> = self.func(ctx, COMMIT_ARRAY_PAGE)?;

        let handle = create.call(&mut *ctx, len)?;
        for (page, chunk) in bytes.chunks(PAGE).enumerate() {
            self.transfer.write(ctx, 0, chunk)?;
            commit.call(&mut *ctx, (handle, (page * PAGE) as i32))?;
            trace!(handle, bytes = chunk.len(), "committed string page");
        }
        Ok(handle)
    }

    fn decode_string<C>(&self, ctx: &mut C, handle: i32) -> RuntimeResult<String>
    where
        C: AsContextMut<Data = HostState>,
    {
        let copy: TypedFunc<(i32, i32), i32> = self.func(ctx, COPY_ARRAY_PAGE)?;
        self.read_stream(ctx, |ctx, offset| Ok(copy.call(&mut *ctx, (handle, offset))?))
    }

    /// Pull pages until the guest reports a zero-length page.
    fn read_stream<C, F>(&self, ctx: &mut C, mut next_page: F) -> RuntimeResult<String>
    where
        C: AsContextMut<Data = HostState>,
        F: FnMut(&mut C, i32) -> RuntimeResult<i32>,
    {
        let mut bytes = Vec::new();
        loop {
            let offset = i32::try_from(bytes.len()).map_err(|_| {
                RuntimeError::GuestProtocol("streamed array exceeds i32 range".to_string())
            })?;
            let n = next_page(ctx, offset)?;
            if n == 0 {
                break;
            }
            if n < 0 || n as usize > PAGE {
                return Err(RuntimeError::GuestProtocol(format!(
                    "guest reported a page of {n} bytes"
                )));
            }
            bytes.extend(self.transfer.read(&*ctx, 0, n as usize)?);
            trace!(bytes = n, total = bytes.len(), "received page");
        }
        Ok(String::from_utf8(bytes)?)
    }

    // ── Structs ──────────────────────────────────────────────────────────

    fn pack_struct<'v>(
        &self,
        sv: &'v StructValue,
        st: &'v StructType,
        field: &str,
    ) -> RuntimeResult<PackedStruct<'v>> {
        if let Some(handle) = sv.handle() {
            if handle.runtime_id == self.runtime_id && handle.type_name == st.name() {
                return Ok(PackedStruct {
                    ty: st,
                    reuse: Some(handle.raw),
                    fields: Vec::new(),
                    strings: Vec::new(),
                });
            }
        }

        let mut fields = vec![0u8; st.size() as usize];
        let mut texts = Vec::new();
        write_fields(st, sv, &mut fields, 0, field, &mut texts)?;
        let strings = texts
            .into_iter()
            .map(|s| stream_len(s.len(), field).map(|len| (s, len)))
            .collect::<RuntimeResult<Vec<_>>>()?;
        Ok(PackedStruct {
            ty: st,
            reuse: None,
            fields,
            strings,
        })
    }

    fn commit_struct<C>(&self, ctx: &mut C, packed: PackedStruct<'_>) -> RuntimeResult<i32>
    where
        C: AsContextMut<Data = HostState>,
    {
        let st = packed.ty;
        if let Some(handle) = packed.reuse {
            trace!(handle, ty = st.name(), "reusing guest handle");
            return Ok(handle);
        }

        self.transfer.write(ctx, 0, &packed.fields)?;
        let materialize: TypedFunc<(), i32> =
            self.func(ctx, &abi::materialize_struct_fields(st.name()))?;
        let handle = materialize.call(&mut *ctx, ())?;

        if !packed.strings.is_empty() {
            let commit: TypedFunc<(i32, i32, i32, i32), ()> =
                self.func(ctx, &abi::commit_struct_array(st.name()))?;
            for (slot, (s, len)) in packed.strings.iter().enumerate() {
                let bytes = s.as_bytes();
                let mut offset = 0usize;
                // At least one commit per slot, so empty strings are allocated too.
                loop {
                    let n = (bytes.len() - offset).min(PAGE);
                    self.transfer.write(ctx, 0, &bytes[offset..offset + n])?;
                    commit.call(&mut *ctx, (handle, slot as i32, offset as i32, *len))?;
                    trace!(handle, slot, bytes = n, "committed struct slot page");
                    offset += n;
                    if offset >= bytes.len() {
                        break;
                    }
                }
            }
        }
        Ok(handle)
    }

    fn decode_struct<C>(
        &self,
        ctx: &mut C,
        handle: i32,
        st: &StructType,
    ) -> RuntimeResult<StructValue>
    where
        C: AsContextMut<Data = HostState>,
    {
        let extract: TypedFunc<i32, i32> = self.func(ctx, &abi::extract_struct_fields(st.name()))?;
        let count = extract.call(&mut *ctx, handle)?;
        let fields = self.transfer.read(&*ctx, 0, st.size() as usize)?;

        let slots = st.array_slots();
        if usize::try_from(count).ok() != Some(slots.len()) {
            return Err(RuntimeError::GuestProtocol(format!(
                "struct `{}` reported {count} array slots, expected {}",
                st.name(),
                slots.len()
            )));
        }

        let mut value = read_fields(st, &fields, 0)?;
        if !slots.is_empty() {
            let extract_array: TypedFunc<(i32, i32, i32), i32> =
                self.func(ctx, &abi::extract_struct_array(st.name()))?;
            for (i, slot) in slots.iter().enumerate() {
                let text = self.read_stream(ctx, |ctx, offset| {
                    Ok(extract_array.call(&mut *ctx, (handle, i as i32, offset))?)
                })?;
                assign(&mut value, &slot.path, Value::String(text))?;
            }
        }

        value.attach_handle(GuestHandle {
            runtime_id: self.runtime_id,
            type_name: st.name().to_string(),
            raw: handle,
        });
        Ok(value)
    }

    fn func<C, P, R>(&self, ctx: &C, name: &str) -> RuntimeResult<TypedFunc<P, R>>
    where
        C: AsContext<Data = HostState>,
        P: WasmParams,
        R: WasmResults,
    {
        self.instance
            .get_typed_func::<P, R>(ctx, name)
            .map_err(|_| RuntimeError::MissingExport(name.to_string()))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Fixed-width values
// ══════════════════════════════════════════════════════════════════════════════

fn mismatch(field: &str, expected: &str, found: &Value) -> RuntimeError {
    RuntimeError::ValueTypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        found: found.describe(),
    }
}

fn stream_len(len: usize, field: &str) -> RuntimeResult<i32> {
    i32::try_from(len).map_err(|_| RuntimeError::ValueTypeMismatch {
        field: field.to_string(),
        expected: "string".to_string(),
        found: format!("string of {len} bytes"),
    })
}

/// An integral host value within `[min, max]`.
fn integral(value: &Value, p: Primitive, field: &str, min: i128, max: i128) -> RuntimeResult<i128> {
    let n = match value {
        Value::Int(n) => Some(*n),
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i128),
        _ => None,
    };
    n.filter(|n| (min..=max).contains(n))
        .ok_or_else(|| mismatch(field, p.name(), value))
}

fn encode_primitive(p: Primitive, value: &Value, field: &str) -> RuntimeResult<Val> {
    let float = || value.as_f64().ok_or_else(|| mismatch(field, p.name(), value));
    Ok(match p {
        Primitive::Bool => match value {
            Value::Bool(b) => Val::I32(*b as i32),
            other => return Err(mismatch(field, p.name(), other)),
        },
        Primitive::I32 => {
            Val::I32(integral(value, p, field, i32::MIN.into(), i32::MAX.into())? as i32)
        }
        Primitive::U32 => Val::I32(integral(value, p, field, 0, u32::MAX.into())? as u32 as i32),
        Primitive::I64 => {
            Val::I64(integral(value, p, field, i64::MIN.into(), i64::MAX.into())? as i64)
        }
        Primitive::U64 => Val::I64(integral(value, p, field, 0, u64::MAX.into())? as u64 as i64),
        Primitive::F32 => Val::F32(F32::from_float(float()? as f32)),
        Primitive::F64 => Val::F64(F64::from_float(float()?)),
        Primitive::Void | Primitive::String => {
            return Err(RuntimeError::GuestProtocol(format!(
                "`{}` is not a fixed-width type",
                p.name()
            )))
        }
    })
}

fn decode_primitive(p: Primitive, raw: &Val) -> RuntimeResult<Value> {
    let bad = || {
        RuntimeError::GuestProtocol(format!("expected a {} value, got {raw:?}", p.name()))
    };
    Ok(match p {
        Primitive::Bool => Value::Bool(raw.i32().ok_or_else(bad)? != 0),
        Primitive::I32 => Value::Int(raw.i32().ok_or_else(bad)?.into()),
        Primitive::U32 => Value::Int((raw.i32().ok_or_else(bad)? as u32).into()),
        Primitive::I64 => Value::Int(raw.i64().ok_or_else(bad)?.into()),
        Primitive::U64 => Value::Int((raw.i64().ok_or_else(bad)? as u64).into()),
        Primitive::F32 => Value::Float(raw.f32().ok_or_else(bad)?.to_float().into()),
        Primitive::F64 => Value::Float(raw.f64().ok_or_else(bad)?.to_float()),
        Primitive::Void => Value::Void,
        Primitive::String => return Err(bad()),
    })
}

fn expect_i32(raw: &Val, ty: &Type) -> RuntimeResult<i32> {
    raw.i32().ok_or_else(|| {
        RuntimeError::GuestProtocol(format!("expected an i32 handle for {ty}, got {raw:?}"))
    })
}

/// Little-endian bytes of a fixed-width value as laid out in a struct.
fn le_bytes(val: &Val) -> Vec<u8> {
    match val {
        Val::I32(v) => v.to_le_bytes().to_vec(),
        Val::I64(v) => v.to_le_bytes().to_vec(),
        Val::F32(v) => v.to_float().to_le_bytes().to_vec(),
        Val::F64(v) => v.to_float().to_le_bytes().to_vec(),
        _ => Vec::new(),
    }
}

fn le<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

fn read_primitive(p: Primitive, buf: &[u8], at: usize) -> Value {
    match p {
        Primitive::Bool => Value::Bool(u32::from_le_bytes(le(buf, at)) != 0),
        Primitive::I32 => Value::Int(i32::from_le_bytes(le(buf, at)).into()),
        Primitive::U32 => Value::Int(u32::from_le_bytes(le(buf, at)).into()),
        Primitive::I64 => Value::Int(i64::from_le_bytes(le(buf, at)).into()),
        Primitive::U64 => Value::Int(u64::from_le_bytes(le(buf, at)).into()),
        Primitive::F32 => Value::Float(f32::from_le_bytes(le(buf, at)).into()),
        Primitive::F64 => Value::Float(f64::from_le_bytes(le(buf, at))),
        Primitive::String => Value::String(String::new()),
        Primitive::Void => Value::Void,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Struct layout
// ══════════════════════════════════════════════════════════════════════════════

/// Write the fixed-width fields of `sv` into `buf` at `base`, queueing
/// string fields in slot order.
fn write_fields<'v>(
    st: &StructType,
    sv: &'v StructValue,
    buf: &mut [u8],
    base: usize,
    path: &str,
    strings: &mut Vec<&'v str>,
) -> RuntimeResult<()> {
    for field in st.fields() {
        let field_path = format!("{path}.{}", field.name);
        let value = sv.get(&field.name).ok_or_else(|| RuntimeError::ValueTypeMismatch {
            field: field_path.clone(),
            expected: field.ty.name().to_string(),
            found: "missing field".to_string(),
        })?;
        let at = base + field.offset as usize;
        match (&field.ty, value) {
            (Type::Struct(nested), Value::Struct(inner)) => {
                write_fields(nested, inner, buf, at, &field_path, strings)?
            }
            (Type::Primitive(Primitive::String), Value::String(s)) => strings.push(s),
            (Type::Primitive(p), value) if !field.ty.is_array() => {
                let bytes = le_bytes(&encode_primitive(*p, value, &field_path)?);
                buf[at..at + bytes.len()].copy_from_slice(&bytes);
            }
            (ty, value) => return Err(mismatch(&field_path, ty.name(), value)),
        }
    }
    Ok(())
}

/// Read packed fields back out; string fields are left empty for the slot
/// pass to fill in.
fn read_fields(st: &StructType, buf: &[u8], base: usize) -> RuntimeResult<StructValue> {
    let mut out = StructValue::new();
    for field in st.fields() {
        let at = base + field.offset as usize;
        let value = match &field.ty {
            Type::Struct(nested) => Value::Struct(read_fields(nested, buf, at)?),
            Type::Primitive(p) => read_primitive(*p, buf, at),
        };
        out = out.with(field.name.clone(), value);
    }
    Ok(out)
}

/// Store `value` at the nested field `path`.
fn assign(target: &mut StructValue, path: &[String], value: Value) -> RuntimeResult<()> {
    let missing = || RuntimeError::GuestProtocol(format!("no field at `{}`", path.join(".")));
    let (last, parents) = path.split_last().ok_or_else(missing)?;
    let mut current = target;
    for name in parents {
        current = match current.get_mut(name) {
            Some(Value::Struct(inner)) => inner,
            _ => return Err(missing()),
        };
    }
    let slot = current.get_mut(last).ok_or_else(missing)?;
    *slot = value;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphl_types::vec3;

    fn labeled() -> StructType {
        let inner = Type::structure(StructType::new(
            "inner",
            [("n", Type::I32), ("name", Type::STRING)],
        ));
        StructType::new(
            "labeled",
            [
                ("id", Type::U64),
                ("label", Type::STRING),
                ("inner", inner),
                ("pos", vec3()),
            ],
        )
    }

    fn labeled_value() -> StructValue {
        StructValue::new()
            .with("id", 9u64)
            .with("label", "outer")
            .with("inner", StructValue::new().with("n", -3).with("name", "in"))
            .with(
                "pos",
                StructValue::new().with("x", 1.0).with("y", 2.0).with("z", 3.0),
            )
    }

    #[test]
    fn u64_range_is_enforced() {
        let ok = encode_primitive(Primitive::U64, &Value::Int(u64::MAX as i128), "f").unwrap();
        assert_eq!(ok.i64(), Some(-1));
        for bad in [Value::Int(-1), Value::Int(1i128 << 64)] {
            assert!(matches!(
                encode_primitive(Primitive::U64, &bad, "f"),
                Err(RuntimeError::ValueTypeMismatch { .. })
            ));
        }
    }

    #[test]
    fn i32_range_and_kind_are_enforced() {
        assert!(encode_primitive(Primitive::I32, &Value::Int(i32::MIN as i128), "f").is_ok());
        assert!(encode_primitive(Primitive::I32, &Value::Int(1 << 31), "f").is_err());
        assert!(encode_primitive(Primitive::I32, &Value::Float(1.5), "f").is_err());
        assert_eq!(
            encode_primitive(Primitive::I32, &Value::Float(4.0), "f")
                .unwrap()
                .i32(),
            Some(4)
        );
        assert!(encode_primitive(Primitive::Bool, &Value::Int(1), "f").is_err());
    }

    #[test]
    fn mismatch_names_field_and_type() {
        let err = encode_primitive(Primitive::U32, &Value::from("x"), "args.count").unwrap_err();
        match err {
            RuntimeError::ValueTypeMismatch {
                field,
                expected,
                found,
            } => {
                assert_eq!(field, "args.count");
                assert_eq!(expected, "u32");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fields_round_trip_through_packed_layout() {
        let st = labeled();
        let value = labeled_value();
        let mut buf = vec![0u8; st.size() as usize];
        let mut strings = Vec::new();
        write_fields(&st, &value, &mut buf, 0, "v", &mut strings).unwrap();
        assert_eq!(strings, vec!["outer", "in"]);

        let mut back = read_fields(&st, &buf, 0).unwrap();
        for (slot, text) in st.array_slots().iter().zip(strings) {
            assign(&mut back, &slot.path, Value::from(text)).unwrap();
        }
        assert_eq!(back, value);
    }

    #[test]
    fn nested_mismatch_reports_full_path() {
        let st = labeled();
        let mut value = labeled_value();
        value.set("pos", StructValue::new().with("x", 1.0).with("y", "no").with("z", 0.0));
        let mut buf = vec![0u8; st.size() as usize];
        let err = write_fields(&st, &value, &mut buf, 0, "arg0", &mut Vec::new()).unwrap_err();
        assert!(
            matches!(err, RuntimeError::ValueTypeMismatch { ref field, .. } if field == "arg0.pos.y")
        );
    }

    #[test]
    fn missing_field_is_a_mismatch() {
        let st = labeled();
        let value = StructValue::new().with("id", 1);
        let mut buf = vec![0u8; st.size() as usize];
        let err = write_fields(&st, &value, &mut buf, 0, "v", &mut Vec::new()).unwrap_err();
        assert!(
            matches!(err, RuntimeError::ValueTypeMismatch { ref found, .. } if found == "missing field")
        );
    }

    #[test]
    fn decode_primitive_rejects_wrong_abi_kind() {
        assert_eq!(
            decode_primitive(Primitive::U32, &Val::I32(-1)).unwrap(),
            Value::Int(u32::MAX as i128)
        );
        assert!(decode_primitive(Primitive::F64, &Val::I32(0)).is_err());
    }
}

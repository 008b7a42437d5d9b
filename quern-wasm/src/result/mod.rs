//! The result-set reader.
//!
//! Invoked by the guest through `read_result_set(offset, count)` once the
//! pipelines have filled the result buffer. The reader recovers the matched
//! root's schema, derives the deduplicated and payload views, locates the
//! projection that defines every constant column, and materializes `count`
//! output rows into the query's sink.
//!
//! One [`RowMaterializer`] is built per query and covers the three cases:
//!
//! - **Constant**: the payload is empty, every column is constant. One
//!   template row is built from the projection and emitted `count` times;
//!   the buffer is never read.
//! - **Direct**: no identifier is duplicated. Rows decode straight from
//!   the buffer; constants are re-inserted at their positions.
//! - **Dedup**: duplicated identifiers collapsed in the buffer. A copy
//!   program (payload column -> all matching output positions) is compiled
//!   once; constants are planted once in the template.

pub mod fmt;

use std::io::Write;

use quern_plan::{
    DataType, OpData, Operator, OperatorKind, PhysicalPlan, ProjExpr, RowLayout, Schema, Tuple,
    Value,
};

use crate::context::WasmContext;
use crate::error::{BackendError, Result};

/// Destination of query output rows.
pub enum ResultSink {
    /// CSV-ish lines to a text stream.
    Print(Box<dyn Write + Send>),
    /// One typed `(schema, tuple)` call per row.
    Callback(Box<dyn FnMut(&Schema, &Tuple) + Send>),
    /// Rows are dropped.
    NoOp,
}

impl ResultSink {
    pub fn stdout() -> Self {
        ResultSink::Print(Box::new(std::io::stdout()))
    }

    pub fn print_to(writer: impl Write + Send + 'static) -> Self {
        ResultSink::Print(Box::new(writer))
    }

    pub fn callback(f: impl FnMut(&Schema, &Tuple) + Send + 'static) -> Self {
        ResultSink::Callback(Box::new(f))
    }

    pub fn noop() -> Self {
        ResultSink::NoOp
    }
}

/// Host side of the `read_result_set` callback.
pub fn read_result_set(ctx: &WasmContext, offset: u32, count: u32) -> Result<()> {
    let root = ctx.plan().matched_root();
    if !root.kind.is_sink() {
        return Err(BackendError::Invariant(format!(
            "plan root must be a sink, found {:?}",
            root.kind
        )));
    }
    let schema = &root.schema;
    let payload = schema.deduplicated_without_constants();
    if (offset == 0) != payload.is_empty() {
        return Err(BackendError::Invariant(format!(
            "result offset {offset} contradicts a payload of {} columns",
            payload.len()
        )));
    }
    if root.kind == OperatorKind::NoOp {
        return Ok(());
    }

    let projection = locate_projection(ctx.plan(), schema)?;
    let template = constant_template(schema, projection)?;
    let materializer = RowMaterializer::new(ctx, schema, payload, template, offset)?;

    match root.kind {
        OperatorKind::Print => materializer.for_each(ctx, count, &mut |tuple| {
            let mut line = fmt::format_row(tuple);
            line.push('\n');
            ctx.with_sink(|sink| match sink {
                ResultSink::Print(w) => w
                    .write_all(line.as_bytes())
                    .map_err(|e| BackendError::Sink(e.to_string())),
                _ => Err(BackendError::Invariant(
                    "plan root is a print sink but no print sink is attached".into(),
                )),
            })
        }),
        OperatorKind::Callback => materializer.for_each(ctx, count, &mut |tuple| {
            ctx.with_sink(|sink| match sink {
                ResultSink::Callback(f) => {
                    f(schema, tuple);
                    Ok(())
                }
                _ => Err(BackendError::Invariant(
                    "plan root is a callback sink but no callback is attached".into(),
                )),
            })
        }),
        _ => unreachable!("no-op sinks return above"),
    }
}

/// The single projection on the root's single-child chain. Its output
/// identifiers must match the root schema's, in order; a chain without a
/// projection has no source for constant columns and is flagged, not
/// guessed at.
fn locate_projection<'a>(plan: &'a PhysicalPlan, schema: &Schema) -> Result<&'a Operator> {
    let mut found = plan
        .chain()
        .filter(|op| op.kind == OperatorKind::Projection);
    let projection = match (found.next(), found.next()) {
        (Some(op), None) => op,
        (None, _) => {
            return Err(BackendError::Invariant(
                "no projection operator on the root chain".into(),
            ));
        }
        (Some(_), Some(_)) => {
            return Err(BackendError::Invariant(
                "more than one projection operator on the root chain".into(),
            ));
        }
    };
    let matches = projection.schema.len() == schema.len()
        && projection
            .schema
            .iter()
            .zip(schema.iter())
            .all(|(p, r)| p.ident == r.ident);
    if !matches {
        return Err(BackendError::Invariant(
            "projection output does not match the root schema".into(),
        ));
    }
    Ok(projection)
}

/// Template row holding every constant column's value; NULL-typed constants
/// stay unset.
fn constant_template(schema: &Schema, projection: &Operator) -> Result<Tuple> {
    let OpData::Projection { exprs } = &projection.data else {
        return Err(BackendError::Invariant(
            "projection operator without expressions".into(),
        ));
    };
    let mut template = Tuple::with_arity(schema.len());
    for (i, entry) in schema.iter().enumerate() {
        if !entry.constant {
            continue;
        }
        match &exprs[i] {
            ProjExpr::Constant(value) => template.set(i, value.clone()),
            ProjExpr::Column(_) => {
                return Err(BackendError::Invariant(format!(
                    "constant column `{}` backed by a non-constant expression",
                    entry.ident
                )));
            }
        }
    }
    Ok(template)
}

/// Per-query row decoder; see the module docs for the three cases.
enum RowMaterializer {
    Constant {
        template: Tuple,
    },
    Direct {
        base: u32,
        layout: RowLayout,
        payload: Schema,
        /// (payload column, output position)
        slots: Vec<(usize, usize)>,
        template: Tuple,
    },
    Dedup {
        base: u32,
        layout: RowLayout,
        payload: Schema,
        /// (payload column, every matching output position)
        copy: Vec<(usize, Vec<usize>)>,
        template: Tuple,
    },
}

impl RowMaterializer {
    fn new(
        ctx: &WasmContext,
        schema: &Schema,
        payload: Schema,
        template: Tuple,
        base: u32,
    ) -> Result<Self> {
        if payload.is_empty() {
            return Ok(RowMaterializer::Constant { template });
        }
        let layout = ctx.layouts().payload_layout(&payload);
        let positions = |ident: &str| -> Vec<usize> {
            schema
                .iter()
                .enumerate()
                .filter(|(_, e)| e.ident == ident && !e.constant)
                .map(|(i, _)| i)
                .collect()
        };
        if *schema == schema.deduplicated() {
            let mut slots = Vec::with_capacity(payload.len());
            for (pi, entry) in payload.iter().enumerate() {
                match positions(&entry.ident).as_slice() {
                    [only] => slots.push((pi, *only)),
                    other => {
                        return Err(BackendError::Invariant(format!(
                            "payload column `{}` matches {} output positions in an \
                             undeduplicated schema",
                            entry.ident,
                            other.len()
                        )));
                    }
                }
            }
            Ok(RowMaterializer::Direct {
                base,
                layout,
                payload,
                slots,
                template,
            })
        } else {
            let copy = payload
                .iter()
                .enumerate()
                .map(|(pi, entry)| (pi, positions(&entry.ident)))
                .collect();
            Ok(RowMaterializer::Dedup {
                base,
                layout,
                payload,
                copy,
                template,
            })
        }
    }

    fn for_each(
        &self,
        ctx: &WasmContext,
        count: u32,
        emit: &mut dyn FnMut(&Tuple) -> Result<()>,
    ) -> Result<()> {
        match self {
            RowMaterializer::Constant { template } => {
                for _ in 0..count {
                    emit(template)?;
                }
            }
            RowMaterializer::Direct {
                base,
                layout,
                payload,
                slots,
                template,
            } => {
                for r in 0..count {
                    let row = base + r * layout.stride();
                    let mut tuple = template.clone();
                    for (pi, out) in slots {
                        tuple.set(*out, load_value(ctx, row, layout, *pi, payload)?);
                    }
                    emit(&tuple)?;
                }
            }
            RowMaterializer::Dedup {
                base,
                layout,
                payload,
                copy,
                template,
            } => {
                for r in 0..count {
                    let row = base + r * layout.stride();
                    let mut tuple = template.clone();
                    for (pi, outs) in copy {
                        let value = load_value(ctx, row, layout, *pi, payload)?;
                        for out in outs {
                            tuple.set(*out, value.clone());
                        }
                    }
                    emit(&tuple)?;
                }
            }
        }
        Ok(())
    }
}

/// Decodes one payload column of the row at `row_base`, honoring its NULL
/// bit. Strings are 4-byte arena offsets to NUL-terminated bytes.
fn load_value(
    ctx: &WasmContext,
    row_base: u32,
    layout: &RowLayout,
    idx: usize,
    payload: &Schema,
) -> Result<Option<Value>> {
    let arena = ctx.arena();
    let null_byte = arena.read_bytes(row_base + RowLayout::null_byte(idx), 1)?[0];
    if null_byte >> RowLayout::null_bit(idx) & 1 == 1 {
        return Ok(None);
    }
    let off = row_base + layout.offset_of(idx);
    let ty = payload
        .get(idx)
        .map(|e| e.ty)
        .ok_or_else(|| BackendError::Invariant(format!("payload column {idx} out of range")))?;
    let value = match ty {
        DataType::Bool => Value::Bool(arena.read_bytes(off, 1)?[0] != 0),
        DataType::I8 => Value::I8(arena.read_bytes(off, 1)?[0] as i8),
        DataType::I16 => Value::I16(i16::from_le_bytes(le(arena.read_bytes(off, 2)?))),
        DataType::I32 => Value::I32(i32::from_le_bytes(le(arena.read_bytes(off, 4)?))),
        DataType::I64 => Value::I64(i64::from_le_bytes(le(arena.read_bytes(off, 8)?))),
        DataType::F32 => Value::F32(f32::from_le_bytes(le(arena.read_bytes(off, 4)?))),
        DataType::F64 => Value::F64(f64::from_le_bytes(le(arena.read_bytes(off, 8)?))),
        DataType::Decimal { .. } => {
            Value::Decimal(i64::from_le_bytes(le(arena.read_bytes(off, 8)?)))
        }
        DataType::Date => Value::Date(i32::from_le_bytes(le(arena.read_bytes(off, 4)?))),
        DataType::DateTime => Value::DateTime(i64::from_le_bytes(le(arena.read_bytes(off, 8)?))),
        DataType::Char(_) => {
            let ptr = u32::from_le_bytes(le(arena.read_bytes(off, 4)?));
            Value::Str(arena.read_cstr(ptr)?)
        }
        DataType::Null => return Ok(None),
    };
    Ok(Some(value))
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    <[u8; N]>::try_from(bytes).expect("read_bytes returns the requested length")
}

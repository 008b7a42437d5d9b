//! Pipeline code generation.
//!
//! Lowers a matched plan chain (Scan, Filter / DisjunctiveFilter,
//! Projection, Limit, sink) into the module's `run` body. The emitted loop
//! walks the mapped table image row by row, evaluates predicates in place,
//! and appends payload rows to the pre-allocated result buffer:
//!
//! ```text
//! block $done
//!   loop $rows
//!     br_if $done (row >= num_rows)
//!     base = <table>_mem + row * stride
//!     block $skip
//!       br_if $skip (!predicates)
//!       <copy NULL bits and payload columns, count += 1>
//!       br_if $done (count >= limit)
//!     end
//!     row += 1
//!     br $rows
//! ```
//!
//! Comparisons against NULL are false, string equality runs as an inline
//! byte loop against the literal pool, and a capacity check `insist`s that
//! the loop never outgrows the buffer. Join, Grouping, Aggregation and
//! Sorting lower through the external plan emitter, not here.

use wasm_encoder::{BlockType, Function, Instruction, MemArg, ValType};

use quern_plan::{
    Catalog, CmpOp, DataType, OpData, Operator, OperatorKind, PhysicalPlan, Predicate, ProjExpr,
    RowLayout, Schema, Value,
};

use crate::abi::host_imports;
use crate::context::WasmContext;
use crate::error::{BackendError, Result};
use crate::module::ModuleBuilder;

// Locals of the `run` function, all i32.
const L_ROW: u32 = 0;
const L_OUT: u32 = 1;
const L_COUNT: u32 = 2;
const L_BASE: u32 = 3;
const L_RES: u32 = 4;
const L_SA: u32 = 5;
const L_SB: u32 = 6;
const NUM_LOCALS: u32 = 7;

/// What the driver needs to know about the emitted pipeline.
#[derive(Clone, Copy, Debug)]
pub struct EmitInfo {
    pub result_offset: u32,
    pub capacity: u32,
    pub sink: OperatorKind,
}

/// Base tables referenced by scans, in first-reference order.
pub fn collect_tables(plan: &PhysicalPlan) -> Vec<String> {
    let mut tables = Vec::new();
    visit(plan.matched_root(), &mut |op| {
        if let OpData::Scan { table } = &op.data {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
    });
    tables
}

/// Every string constant occurring in filter, join, projection or grouping
/// predicates, in plan order. Deduplication happens when the pool is
/// installed.
pub fn collect_string_literals(plan: &PhysicalPlan) -> Vec<String> {
    let mut literals = Vec::new();
    visit(plan.matched_root(), &mut |op| match &op.data {
        OpData::Filter { conjuncts } => collect_pred_literals(conjuncts, &mut literals),
        OpData::DisjunctiveFilter { arms } => {
            for arm in arms {
                collect_pred_literals(arm, &mut literals);
            }
        }
        OpData::Projection { exprs } => {
            for expr in exprs {
                if let ProjExpr::Constant(Some(Value::Str(s))) = expr {
                    literals.push(s.clone());
                }
            }
        }
        _ => {}
    });
    literals
}

fn collect_pred_literals(preds: &[Predicate], out: &mut Vec<String>) {
    for pred in preds {
        if let Value::Str(s) = &pred.rhs {
            out.push(s.clone());
        }
    }
}

fn visit<'a>(op: &'a Operator, f: &mut impl FnMut(&'a Operator)) {
    f(op);
    for child in &op.children {
        visit(child, f);
    }
}

struct Shape<'a> {
    sink: OperatorKind,
    limit: Option<u64>,
    projection: &'a Operator,
    filters: Vec<&'a OpData>,
    scan: Option<&'a Operator>,
}

fn analyze(plan: &PhysicalPlan) -> Result<Shape<'_>> {
    let root = plan.matched_root();
    if !root.kind.is_sink() {
        return Err(BackendError::Invariant(format!(
            "plan root must be a sink, found {:?}",
            root.kind
        )));
    }
    let mut limit = None;
    let mut projections = Vec::new();
    let mut filters = Vec::new();
    let mut scan = None;
    for op in plan.chain().skip(1) {
        match op.kind {
            OperatorKind::Scan => scan = Some(op),
            OperatorKind::Filter | OperatorKind::DisjunctiveFilter => filters.push(&op.data),
            OperatorKind::Projection => projections.push(op),
            OperatorKind::Limit => {
                if let OpData::Limit { limit: l, offset } = &op.data {
                    let (l, offset) = (*l, *offset);
                    if offset != 0 {
                        return Err(BackendError::Unsupported(
                            "limit offsets are folded upstream".into(),
                        ));
                    }
                    limit = Some(limit.map_or(l, |cur: u64| cur.min(l)));
                }
            }
            OperatorKind::Callback | OperatorKind::Print | OperatorKind::NoOp => {
                return Err(BackendError::Invariant(
                    "sink operator below the plan root".into(),
                ));
            }
            other => {
                return Err(BackendError::Unsupported(format!(
                    "{other:?} pipelines lower through the external plan emitter"
                )));
            }
        }
    }
    let projection = match projections.as_slice() {
        [only] => *only,
        found => {
            return Err(BackendError::Invariant(format!(
                "expected exactly one projection on the root chain, found {}",
                found.len()
            )));
        }
    };
    Ok(Shape {
        sink: root.kind,
        limit,
        projection,
        filters,
        scan,
    })
}

struct ScanInfo {
    mem_global: u32,
    rows_global: u32,
    layout: RowLayout,
    schema: Schema,
    num_rows: u32,
}

struct PayloadCol {
    /// Column index in the scan schema.
    src: usize,
    /// Column index in the payload schema.
    payload_idx: usize,
    ty: DataType,
}

struct ResolvedPred<'a> {
    src: usize,
    op: CmpOp,
    rhs: &'a Value,
    ty: DataType,
}

/// Emits the query pipeline into `builder` and returns where the result
/// buffer lives. Tables must already be mapped into the context's arena.
pub fn emit_query(
    builder: &mut ModuleBuilder,
    ctx: &mut WasmContext,
    catalog: &Catalog,
) -> Result<EmitInfo> {
    let plan = ctx.plan_arc();
    let shape = analyze(&plan)?;
    let root_schema = &plan.matched_root().schema;
    let payload = root_schema.deduplicated_without_constants();

    let literals = collect_string_literals(&plan);
    builder.install_literals(ctx.arena_mut(), &literals)?;

    let rrs = builder.import_func(
        host_imports::READ_RESULT_SET,
        &[ValType::I32, ValType::I32],
        &[],
    );
    let insist = builder.import_func(host_imports::INSIST, &[ValType::I64], &[]);
    builder.import_func(
        host_imports::PRINT_MEMORY_CONSUMPTION,
        &[ValType::I32, ValType::I32],
        &[],
    );

    let scan_info = match shape.scan {
        Some(op) => {
            let OpData::Scan { table } = &op.data else {
                return Err(BackendError::Invariant("scan operator without a table".into()));
            };
            let store = catalog.store(table).ok_or_else(|| {
                BackendError::Invariant(format!("plan references unknown table `{table}`"))
            })?;
            if ctx.table(table).is_none() {
                return Err(BackendError::Invariant(format!(
                    "table `{table}` is not mapped into the arena"
                )));
            }
            Some(ScanInfo {
                mem_global: builder.import_global(&format!("{table}_mem")),
                rows_global: builder.import_global(&format!("{table}_num_rows")),
                layout: store.layout().clone(),
                schema: store.schema().clone(),
                num_rows: store.num_rows(),
            })
        }
        None => None,
    };

    let payload_layout = if payload.is_empty() {
        None
    } else {
        Some(ctx.layouts().payload_layout(&payload))
    };

    let capacity = match (&scan_info, shape.limit) {
        (Some(s), Some(l)) => s.num_rows.min(l.min(u32::MAX as u64) as u32),
        (Some(s), None) => s.num_rows,
        (None, limit) => 1u32.min(limit.unwrap_or(1).min(u32::MAX as u64) as u32),
    };

    let result_offset = match &payload_layout {
        Some(layout) => {
            let len = layout.stride() * capacity.max(1);
            builder.preallocate(ctx.arena_mut(), len)?
        }
        None => 0,
    };

    let payload_cols = match (&payload_layout, &scan_info) {
        (None, _) => Vec::new(),
        (Some(_), None) => {
            return Err(BackendError::Unsupported(
                "non-constant result columns need a scan pipeline".into(),
            ));
        }
        (Some(_), Some(scan)) => resolve_payload(&payload, shape.projection, &scan.schema)?,
    };

    let stages: Vec<Vec<Vec<ResolvedPred<'_>>>> = match &scan_info {
        Some(scan) => shape
            .filters
            .iter()
            .map(|data| resolve_stage(data, &scan.schema))
            .collect::<Result<_>>()?,
        None if shape.filters.is_empty() => Vec::new(),
        None => {
            return Err(BackendError::Unsupported(
                "filters need a scan pipeline".into(),
            ));
        }
    };

    let mut f = Function::new(vec![(NUM_LOCALS, ValType::I32)]);
    match &scan_info {
        None => {
            f.instruction(&Instruction::I32Const(capacity as i32));
            f.instruction(&Instruction::LocalSet(L_COUNT));
        }
        Some(scan) => {
            if payload_layout.is_some() {
                f.instruction(&Instruction::I32Const(result_offset as i32));
                f.instruction(&Instruction::LocalSet(L_OUT));
            }
            f.instruction(&Instruction::Block(BlockType::Empty)); // $done
            f.instruction(&Instruction::Loop(BlockType::Empty)); // $rows
            f.instruction(&Instruction::LocalGet(L_ROW));
            f.instruction(&Instruction::GlobalGet(scan.rows_global));
            f.instruction(&Instruction::I32GeU);
            f.instruction(&Instruction::BrIf(1)); // -> $done
            f.instruction(&Instruction::GlobalGet(scan.mem_global));
            f.instruction(&Instruction::LocalGet(L_ROW));
            f.instruction(&Instruction::I32Const(scan.layout.stride() as i32));
            f.instruction(&Instruction::I32Mul);
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::LocalSet(L_BASE));
            f.instruction(&Instruction::Block(BlockType::Empty)); // $skip
            for stage in &stages {
                emit_stage(&mut f, stage, scan, builder)?;
                f.instruction(&Instruction::I32Eqz);
                f.instruction(&Instruction::BrIf(0)); // -> $skip
            }
            if let Some(layout) = &payload_layout {
                emit_null_bitmap(&mut f, layout, &payload_cols);
                for col in &payload_cols {
                    emit_payload_store(&mut f, layout, col, scan);
                }
                f.instruction(&Instruction::LocalGet(L_OUT));
                f.instruction(&Instruction::I32Const(layout.stride() as i32));
                f.instruction(&Instruction::I32Add);
                f.instruction(&Instruction::LocalSet(L_OUT));
            }
            f.instruction(&Instruction::LocalGet(L_COUNT));
            f.instruction(&Instruction::I32Const(1));
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::LocalSet(L_COUNT));
            if let Some(limit) = shape.limit {
                f.instruction(&Instruction::LocalGet(L_COUNT));
                f.instruction(&Instruction::I32Const(limit.min(u32::MAX as u64) as i32));
                f.instruction(&Instruction::I32GeU);
                f.instruction(&Instruction::BrIf(2)); // -> $done
            }
            f.instruction(&Instruction::End); // $skip
            f.instruction(&Instruction::LocalGet(L_ROW));
            f.instruction(&Instruction::I32Const(1));
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::LocalSet(L_ROW));
            f.instruction(&Instruction::Br(0)); // -> $rows
            f.instruction(&Instruction::End); // $rows
            f.instruction(&Instruction::End); // $done
        }
    }

    if payload_layout.is_some() {
        let msg = builder.add_message(file!(), line!(), "result buffer overrun");
        f.instruction(&Instruction::LocalGet(L_COUNT));
        f.instruction(&Instruction::I32Const(capacity as i32));
        f.instruction(&Instruction::I32GtU);
        f.instruction(&Instruction::If(BlockType::Empty));
        f.instruction(&Instruction::I64Const(msg));
        f.instruction(&Instruction::Call(insist));
        f.instruction(&Instruction::End);
    }

    f.instruction(&Instruction::LocalGet(L_COUNT));
    f.instruction(&Instruction::GlobalSet(builder.rows_global_index()));
    f.instruction(&Instruction::I32Const(result_offset as i32));
    f.instruction(&Instruction::LocalGet(L_COUNT));
    f.instruction(&Instruction::Call(rrs));
    f.instruction(&Instruction::End);
    builder.set_run_body(f);

    Ok(EmitInfo {
        result_offset,
        capacity,
        sink: shape.sink,
    })
}

/// Maps each payload column to its source column in the scan schema via the
/// projection's expressions.
fn resolve_payload(
    payload: &Schema,
    projection: &Operator,
    scan_schema: &Schema,
) -> Result<Vec<PayloadCol>> {
    let OpData::Projection { exprs } = &projection.data else {
        return Err(BackendError::Invariant(
            "projection operator without expressions".into(),
        ));
    };
    let mut cols = Vec::with_capacity(payload.len());
    for (payload_idx, entry) in payload.iter().enumerate() {
        let proj_idx = projection
            .schema
            .iter()
            .position(|e| e.ident == entry.ident && !e.constant)
            .ok_or_else(|| {
                BackendError::Invariant(format!(
                    "payload column `{}` missing from the projection",
                    entry.ident
                ))
            })?;
        let ProjExpr::Column(source) = &exprs[proj_idx] else {
            return Err(BackendError::Unsupported(format!(
                "payload column `{}` is not a plain column reference",
                entry.ident
            )));
        };
        let src = scan_schema.position(source).ok_or_else(|| {
            BackendError::Invariant(format!(
                "projection references unknown column `{source}`"
            ))
        })?;
        cols.push(PayloadCol {
            src,
            payload_idx,
            ty: entry.ty,
        });
    }
    Ok(cols)
}

/// Normalizes one filter stage into disjunctive form: a list of arms, each
/// an ANDed conjunction.
fn resolve_stage<'a>(
    data: &'a OpData,
    scan_schema: &Schema,
) -> Result<Vec<Vec<ResolvedPred<'a>>>> {
    match data {
        OpData::Filter { conjuncts } => Ok(vec![resolve_preds(conjuncts, scan_schema)?]),
        OpData::DisjunctiveFilter { arms } => arms
            .iter()
            .map(|arm| resolve_preds(arm, scan_schema))
            .collect(),
        _ => Err(BackendError::Invariant(
            "filter operator without predicates".into(),
        )),
    }
}

fn resolve_preds<'a>(
    preds: &'a [Predicate],
    scan_schema: &Schema,
) -> Result<Vec<ResolvedPred<'a>>> {
    preds
        .iter()
        .map(|pred| {
            let src = scan_schema.position(&pred.column).ok_or_else(|| {
                BackendError::Invariant(format!(
                    "filter references unknown column `{}`",
                    pred.column
                ))
            })?;
            let ty = scan_schema.get(src).map(|e| e.ty).unwrap_or(DataType::Null);
            let ordered_ok = !matches!(ty, DataType::Bool | DataType::Char(_));
            if !ordered_ok && !matches!(pred.op, CmpOp::Eq | CmpOp::Ne) {
                return Err(BackendError::Unsupported(format!(
                    "ordering comparison on {ty:?} column `{}`",
                    pred.column
                )));
            }
            if !literal_matches(ty, &pred.rhs) {
                return Err(BackendError::Unsupported(format!(
                    "predicate literal type mismatch on column `{}`",
                    pred.column
                )));
            }
            Ok(ResolvedPred {
                src,
                op: pred.op,
                rhs: &pred.rhs,
                ty,
            })
        })
        .collect()
}

fn literal_matches(ty: DataType, rhs: &Value) -> bool {
    matches!(
        (ty, rhs),
        (DataType::Bool, Value::Bool(_))
            | (DataType::I8, Value::I8(_))
            | (DataType::I16, Value::I16(_))
            | (DataType::I32, Value::I32(_))
            | (DataType::I64, Value::I64(_))
            | (DataType::F32, Value::F32(_))
            | (DataType::F64, Value::F64(_))
            | (DataType::Decimal { .. }, Value::Decimal(_))
            | (DataType::Char(_), Value::Str(_))
            | (DataType::Date, Value::Date(_))
            | (DataType::DateTime, Value::DateTime(_))
    )
}

/// Leaves the stage's truth value (i32 0/1) on the stack.
fn emit_stage(
    f: &mut Function,
    arms: &[Vec<ResolvedPred<'_>>],
    scan: &ScanInfo,
    builder: &ModuleBuilder,
) -> Result<()> {
    if arms.is_empty() {
        f.instruction(&Instruction::I32Const(1));
        return Ok(());
    }
    for (i, arm) in arms.iter().enumerate() {
        if arm.is_empty() {
            f.instruction(&Instruction::I32Const(1));
        }
        for (j, pred) in arm.iter().enumerate() {
            emit_pred(f, pred, scan, builder)?;
            if j > 0 {
                f.instruction(&Instruction::I32And);
            }
        }
        if i > 0 {
            f.instruction(&Instruction::I32Or);
        }
    }
    Ok(())
}

/// `NOT NULL && <cmp>` for one predicate; leaves i32 0/1 on the stack.
fn emit_pred(
    f: &mut Function,
    pred: &ResolvedPred<'_>,
    scan: &ScanInfo,
    builder: &ModuleBuilder,
) -> Result<()> {
    // NULL bit of the source column; comparisons against NULL are false.
    f.instruction(&Instruction::LocalGet(L_BASE));
    f.instruction(&Instruction::I32Load8U(memarg(
        RowLayout::null_byte(pred.src),
    )));
    let bit = RowLayout::null_bit(pred.src);
    if bit != 0 {
        f.instruction(&Instruction::I32Const(bit as i32));
        f.instruction(&Instruction::I32ShrU);
    }
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::I32Eqz); // not-null

    let off = scan.layout.offset_of(pred.src);
    match (pred.ty, pred.rhs) {
        (DataType::Bool, Value::Bool(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load8U(memarg(off)));
            f.instruction(&Instruction::I32Const(*v as i32));
            f.instruction(&i32_cmp(pred.op));
        }
        (DataType::I8, Value::I8(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load8S(memarg(off)));
            f.instruction(&Instruction::I32Const(*v as i32));
            f.instruction(&i32_cmp(pred.op));
        }
        (DataType::I16, Value::I16(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load16S(memarg(off)));
            f.instruction(&Instruction::I32Const(*v as i32));
            f.instruction(&i32_cmp(pred.op));
        }
        (DataType::I32, Value::I32(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load(memarg(off)));
            f.instruction(&Instruction::I32Const(*v));
            f.instruction(&i32_cmp(pred.op));
        }
        (DataType::Date, Value::Date(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load(memarg(off)));
            f.instruction(&Instruction::I32Const(*v));
            f.instruction(&i32_cmp(pred.op));
        }
        (DataType::I64, Value::I64(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I64Load(memarg(off)));
            f.instruction(&Instruction::I64Const(*v));
            f.instruction(&i64_cmp(pred.op));
        }
        (DataType::DateTime, Value::DateTime(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I64Load(memarg(off)));
            f.instruction(&Instruction::I64Const(*v));
            f.instruction(&i64_cmp(pred.op));
        }
        (DataType::Decimal { .. }, Value::Decimal(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I64Load(memarg(off)));
            f.instruction(&Instruction::I64Const(*v));
            f.instruction(&i64_cmp(pred.op));
        }
        (DataType::F32, Value::F32(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::F32Load(memarg(off)));
            f.instruction(&Instruction::F32Const((*v).into()));
            f.instruction(&f32_cmp(pred.op));
        }
        (DataType::F64, Value::F64(v)) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::F64Load(memarg(off)));
            f.instruction(&Instruction::F64Const((*v).into()));
            f.instruction(&f64_cmp(pred.op));
        }
        (DataType::Char(_), Value::Str(s)) => {
            let literal = builder.literal_offset(s).ok_or_else(|| {
                BackendError::Invariant(format!("string literal `{s}` missing from the pool"))
            })?;
            emit_streq(f, off, literal);
            if pred.op == CmpOp::Ne {
                f.instruction(&Instruction::I32Eqz);
            }
        }
        _ => {
            return Err(BackendError::Unsupported(
                "predicate literal type mismatch slipped past resolution".into(),
            ));
        }
    }
    f.instruction(&Instruction::I32And);
    Ok(())
}

/// Inline NUL-terminated byte comparison of the column at `base + off`
/// against the pooled literal; leaves 1 on equality.
fn emit_streq(f: &mut Function, off: u32, literal: u32) {
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::LocalSet(L_RES));
    f.instruction(&Instruction::LocalGet(L_BASE));
    f.instruction(&Instruction::I32Const(off as i32));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalSet(L_SA));
    f.instruction(&Instruction::I32Const(literal as i32));
    f.instruction(&Instruction::LocalSet(L_SB));
    f.instruction(&Instruction::Block(BlockType::Empty)); // $brk
    f.instruction(&Instruction::Loop(BlockType::Empty)); // $cmp
    f.instruction(&Instruction::LocalGet(L_SA));
    f.instruction(&Instruction::I32Load8U(memarg(0)));
    f.instruction(&Instruction::LocalGet(L_SB));
    f.instruction(&Instruction::I32Load8U(memarg(0)));
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalSet(L_RES));
    f.instruction(&Instruction::Br(2)); // -> $brk
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::LocalGet(L_SA));
    f.instruction(&Instruction::I32Load8U(memarg(0)));
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::BrIf(1)); // terminator reached -> $brk
    f.instruction(&Instruction::LocalGet(L_SA));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalSet(L_SA));
    f.instruction(&Instruction::LocalGet(L_SB));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalSet(L_SB));
    f.instruction(&Instruction::Br(0)); // -> $cmp
    f.instruction(&Instruction::End); // $cmp
    f.instruction(&Instruction::End); // $brk
    f.instruction(&Instruction::LocalGet(L_RES));
}

/// Transfers the NULL bits of the payload columns from the store row into
/// the result row's bitmap. Bytes without any payload column stay zero (the
/// buffer is pre-zeroed).
fn emit_null_bitmap(f: &mut Function, layout: &RowLayout, cols: &[PayloadCol]) {
    for byte in 0..layout.null_bitmap_len() {
        let in_byte: Vec<&PayloadCol> = cols
            .iter()
            .filter(|c| RowLayout::null_byte(c.payload_idx) == byte)
            .collect();
        if in_byte.is_empty() {
            continue;
        }
        f.instruction(&Instruction::I32Const(0));
        f.instruction(&Instruction::LocalSet(L_RES));
        for col in in_byte {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load8U(memarg(
                RowLayout::null_byte(col.src),
            )));
            let src_bit = RowLayout::null_bit(col.src);
            if src_bit != 0 {
                f.instruction(&Instruction::I32Const(src_bit as i32));
                f.instruction(&Instruction::I32ShrU);
            }
            f.instruction(&Instruction::I32Const(1));
            f.instruction(&Instruction::I32And);
            let dst_bit = RowLayout::null_bit(col.payload_idx);
            if dst_bit != 0 {
                f.instruction(&Instruction::I32Const(dst_bit as i32));
                f.instruction(&Instruction::I32Shl);
            }
            f.instruction(&Instruction::LocalGet(L_RES));
            f.instruction(&Instruction::I32Or);
            f.instruction(&Instruction::LocalSet(L_RES));
        }
        f.instruction(&Instruction::LocalGet(L_OUT));
        f.instruction(&Instruction::LocalGet(L_RES));
        f.instruction(&Instruction::I32Store8(memarg(byte)));
    }
}

/// Copies one payload column from the store row into the result row.
/// Strings store the column's arena address; everything else is a raw
/// width-preserving copy.
fn emit_payload_store(f: &mut Function, layout: &RowLayout, col: &PayloadCol, scan: &ScanInfo) {
    let src_off = scan.layout.offset_of(col.src);
    let dst_off = layout.offset_of(col.payload_idx);
    f.instruction(&Instruction::LocalGet(L_OUT));
    match col.ty {
        DataType::Char(_) => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Const(src_off as i32));
            f.instruction(&Instruction::I32Add);
            f.instruction(&Instruction::I32Store(memarg(dst_off)));
        }
        DataType::Bool | DataType::I8 => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load8U(memarg(src_off)));
            f.instruction(&Instruction::I32Store8(memarg(dst_off)));
        }
        DataType::I16 => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load16U(memarg(src_off)));
            f.instruction(&Instruction::I32Store16(memarg(dst_off)));
        }
        DataType::I32 | DataType::F32 | DataType::Date => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I32Load(memarg(src_off)));
            f.instruction(&Instruction::I32Store(memarg(dst_off)));
        }
        DataType::I64
        | DataType::F64
        | DataType::Decimal { .. }
        | DataType::DateTime => {
            f.instruction(&Instruction::LocalGet(L_BASE));
            f.instruction(&Instruction::I64Load(memarg(src_off)));
            f.instruction(&Instruction::I64Store(memarg(dst_off)));
        }
        DataType::Null => {
            // NULL-typed columns are constants and never reach the payload.
            f.instruction(&Instruction::Drop);
        }
    }
}

fn memarg(offset: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align: 0,
        memory_index: 0,
    }
}

fn i32_cmp(op: CmpOp) -> Instruction<'static> {
    match op {
        CmpOp::Eq => Instruction::I32Eq,
        CmpOp::Ne => Instruction::I32Ne,
        CmpOp::Lt => Instruction::I32LtS,
        CmpOp::Le => Instruction::I32LeS,
        CmpOp::Gt => Instruction::I32GtS,
        CmpOp::Ge => Instruction::I32GeS,
    }
}

fn i64_cmp(op: CmpOp) -> Instruction<'static> {
    match op {
        CmpOp::Eq => Instruction::I64Eq,
        CmpOp::Ne => Instruction::I64Ne,
        CmpOp::Lt => Instruction::I64LtS,
        CmpOp::Le => Instruction::I64LeS,
        CmpOp::Gt => Instruction::I64GtS,
        CmpOp::Ge => Instruction::I64GeS,
    }
}

fn f32_cmp(op: CmpOp) -> Instruction<'static> {
    match op {
        CmpOp::Eq => Instruction::F32Eq,
        CmpOp::Ne => Instruction::F32Ne,
        CmpOp::Lt => Instruction::F32Lt,
        CmpOp::Le => Instruction::F32Le,
        CmpOp::Gt => Instruction::F32Gt,
        CmpOp::Ge => Instruction::F32Ge,
    }
}

fn f64_cmp(op: CmpOp) -> Instruction<'static> {
    match op {
        CmpOp::Eq => Instruction::F64Eq,
        CmpOp::Ne => Instruction::F64Ne,
        CmpOp::Lt => Instruction::F64Lt,
        CmpOp::Le => Instruction::F64Le,
        CmpOp::Gt => Instruction::F64Gt,
        CmpOp::Ge => Instruction::F64Ge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use quern_plan::{SchemaEntry, Table, Tuple};

    use crate::config::{ContextConfig, WASM_PAGE_SIZE};
    use crate::result::ResultSink;

    fn people_catalog() -> Catalog {
        let mut catalog = Catalog::new();
        let schema = Schema::new(vec![
            SchemaEntry::new("id", DataType::I32),
            SchemaEntry::new("name", DataType::Char(8)),
        ]);
        let store = catalog.create_store(Table::new("t", schema));
        for (id, name) in [(1, "a"), (2, "b")] {
            store
                .append(&Tuple::from(vec![
                    Some(Value::I32(id)),
                    Some(Value::Str(name.into())),
                ]))
                .unwrap();
        }
        catalog
    }

    fn scan_plan() -> PhysicalPlan {
        let catalog = people_catalog();
        let scan = Operator::scan("t", catalog.store("t").unwrap().schema().clone());
        PhysicalPlan::new(Operator::print(Operator::projection(
            vec![
                ("id".into(), ProjExpr::Column("id".into())),
                ("name".into(), ProjExpr::Column("name".into())),
            ],
            scan,
        )))
    }

    fn emit(plan: PhysicalPlan) -> Result<(ModuleBuilder, EmitInfo, Vec<u8>)> {
        let catalog = people_catalog();
        let plan = Arc::new(plan);
        let mut builder = ModuleBuilder::new(4 * WASM_PAGE_SIZE);
        let mut ctx = WasmContext::create(
            builder.id(),
            plan.clone(),
            ContextConfig::default(),
            *catalog.data_layout(),
            ResultSink::noop(),
            4 * WASM_PAGE_SIZE,
        )?;
        for table in collect_tables(&plan) {
            let store = catalog.store(&table).unwrap();
            ctx.map_table(&table, store.bytes(), store.num_rows())?;
        }
        let info = emit_query(&mut builder, &mut ctx, &catalog)?;
        let bytes = builder.finish()?;
        Ok((builder, info, bytes))
    }

    #[test]
    fn scan_pipeline_emits_a_valid_module() {
        let (_, info, bytes) = emit(scan_plan()).unwrap();
        assert_eq!(info.capacity, 2);
        assert_ne!(info.result_offset, 0);
        wasmparser::Validator::new().validate_all(&bytes).unwrap();
    }

    #[test]
    fn filtered_pipeline_with_string_literal_validates() {
        let catalog = people_catalog();
        let scan = Operator::scan("t", catalog.store("t").unwrap().schema().clone());
        let filter = Operator::filter(
            vec![Predicate::new("name", CmpOp::Eq, Value::Str("a".into()))],
            scan,
        );
        let plan = PhysicalPlan::new(Operator::print(Operator::projection(
            vec![("id".into(), ProjExpr::Column("id".into()))],
            filter,
        )));
        let (builder, _, bytes) = emit(plan).unwrap();
        assert!(builder.literal_offset("a").is_some());
        wasmparser::Validator::new().validate_all(&bytes).unwrap();
    }

    #[test]
    fn constant_only_pipeline_passes_offset_zero() {
        let catalog = people_catalog();
        let scan = Operator::scan("t", catalog.store("t").unwrap().schema().clone());
        let plan = PhysicalPlan::new(Operator::print(Operator::projection(
            vec![("one".into(), ProjExpr::Constant(Some(Value::I32(1))))],
            scan,
        )));
        let (_, info, bytes) = emit(plan).unwrap();
        assert_eq!(info.result_offset, 0);
        wasmparser::Validator::new().validate_all(&bytes).unwrap();
    }

    #[test]
    fn join_pipelines_are_rejected() {
        let catalog = people_catalog();
        let schema = catalog.store("t").unwrap().schema().clone();
        let join = Operator {
            kind: OperatorKind::Join,
            schema: schema.clone(),
            data: OpData::None,
            children: vec![
                Operator::scan("t", schema.clone()),
                Operator::scan("t", schema),
            ],
        };
        let plan = PhysicalPlan::new(Operator::print(join));
        let err = emit(plan).unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
    }

    #[test]
    fn collects_tables_and_literals() {
        let catalog = people_catalog();
        let scan = Operator::scan("t", catalog.store("t").unwrap().schema().clone());
        let filter = Operator::disjunctive_filter(
            vec![
                vec![Predicate::new("name", CmpOp::Eq, Value::Str("a".into()))],
                vec![Predicate::new("name", CmpOp::Eq, Value::Str("b".into()))],
            ],
            scan,
        );
        let plan = PhysicalPlan::new(Operator::print(Operator::projection(
            vec![("name".into(), ProjExpr::Column("name".into()))],
            filter,
        )));
        assert_eq!(collect_tables(&plan), ["t"]);
        assert_eq!(collect_string_literals(&plan), ["a", "b"]);
    }
}

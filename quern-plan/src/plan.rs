//! Physical operator trees.
//!
//! The taxonomy below is what the execution backend recognizes; the plan
//! enumerator upstream picks the implementations and hands the matched tree
//! over. Most plans the backend sees are single-child chains terminated by a
//! scan, with a sink at the root:
//!
//! ```text
//! Print ── Limit ── Projection ── Filter ── Scan(t)
//! ```
//!
//! [`PhysicalPlan::chain`] iterates exactly that chain (stopping at the
//! first operator with zero or several children), which is how the result
//! reader locates "the" projection for constant columns.

use crate::schema::{Schema, SchemaEntry};
use crate::types::{DataType, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `column <op> constant`: the predicate form the pipeline lowering
/// understands. Conjunctions are lists of these; a disjunctive filter is a
/// list of conjunctions.
#[derive(Clone, Debug)]
pub struct Predicate {
    pub column: String,
    pub op: CmpOp,
    pub rhs: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: CmpOp, rhs: Value) -> Self {
        Self {
            column: column.into(),
            op,
            rhs,
        }
    }
}

/// Projection expression. `Constant(None)` is the untyped NULL literal.
#[derive(Clone, Debug)]
pub enum ProjExpr {
    Column(String),
    Constant(Option<Value>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorKind {
    Scan,
    Callback,
    Print,
    NoOp,
    Filter,
    DisjunctiveFilter,
    Join,
    Projection,
    Limit,
    Grouping,
    Aggregation,
    Sorting,
}

impl OperatorKind {
    /// Sinks terminate a plan at the root and emit no columns of their own.
    pub fn is_sink(&self) -> bool {
        matches!(
            self,
            OperatorKind::Callback | OperatorKind::Print | OperatorKind::NoOp
        )
    }
}

/// Kind-specific operator payload.
#[derive(Clone, Debug)]
pub enum OpData {
    Scan { table: String },
    Filter { conjuncts: Vec<Predicate> },
    DisjunctiveFilter { arms: Vec<Vec<Predicate>> },
    Projection { exprs: Vec<ProjExpr> },
    Limit { limit: u64, offset: u64 },
    None,
}

#[derive(Clone, Debug)]
pub struct Operator {
    pub kind: OperatorKind,
    pub schema: Schema,
    pub data: OpData,
    pub children: Vec<Operator>,
}

impl Operator {
    pub fn scan(table: impl Into<String>, schema: Schema) -> Self {
        Self {
            kind: OperatorKind::Scan,
            schema,
            data: OpData::Scan {
                table: table.into(),
            },
            children: Vec::new(),
        }
    }

    pub fn filter(conjuncts: Vec<Predicate>, child: Operator) -> Self {
        Self {
            kind: OperatorKind::Filter,
            schema: child.schema.clone(),
            data: OpData::Filter { conjuncts },
            children: vec![child],
        }
    }

    pub fn disjunctive_filter(arms: Vec<Vec<Predicate>>, child: Operator) -> Self {
        Self {
            kind: OperatorKind::DisjunctiveFilter,
            schema: child.schema.clone(),
            data: OpData::DisjunctiveFilter { arms },
            children: vec![child],
        }
    }

    /// Builds a projection; the output schema is derived from the
    /// expressions (columns inherit the child's type, constants carry their
    /// literal's type and the constant marker).
    pub fn projection(exprs: Vec<(String, ProjExpr)>, child: Operator) -> Self {
        let mut schema = Schema::default();
        let mut payload = Vec::with_capacity(exprs.len());
        for (ident, expr) in exprs {
            let entry = match &expr {
                ProjExpr::Column(source) => {
                    let ty = child
                        .schema
                        .position(source)
                        .and_then(|i| child.schema.get(i))
                        .map(|e| e.ty)
                        .unwrap_or(DataType::Null);
                    SchemaEntry::new(ident, ty)
                }
                ProjExpr::Constant(Some(v)) => SchemaEntry::constant(ident, v.data_type()),
                ProjExpr::Constant(None) => SchemaEntry::constant(ident, DataType::Null),
            };
            schema.push(entry);
            payload.push(expr);
        }
        Self {
            kind: OperatorKind::Projection,
            schema,
            data: OpData::Projection { exprs: payload },
            children: vec![child],
        }
    }

    pub fn limit(limit: u64, child: Operator) -> Self {
        Self {
            kind: OperatorKind::Limit,
            schema: child.schema.clone(),
            data: OpData::Limit { limit, offset: 0 },
            children: vec![child],
        }
    }

    pub fn print(child: Operator) -> Self {
        Self::sink(OperatorKind::Print, child)
    }

    pub fn callback(child: Operator) -> Self {
        Self::sink(OperatorKind::Callback, child)
    }

    pub fn noop(child: Operator) -> Self {
        Self::sink(OperatorKind::NoOp, child)
    }

    fn sink(kind: OperatorKind, child: Operator) -> Self {
        Self {
            kind,
            schema: child.schema.clone(),
            data: OpData::None,
            children: vec![child],
        }
    }
}

/// A matched physical plan: the operator tree with implementations chosen.
#[derive(Clone, Debug)]
pub struct PhysicalPlan {
    root: Operator,
}

impl PhysicalPlan {
    pub fn new(root: Operator) -> Self {
        Self { root }
    }

    pub fn matched_root(&self) -> &Operator {
        &self.root
    }

    /// Iterates the single-child chain starting at the root, root included.
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            next: Some(&self.root),
        }
    }
}

pub struct Chain<'a> {
    next: Option<&'a Operator>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Operator;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = match current.children.as_slice() {
            [only] => Some(only),
            _ => None,
        };
        Some(current)
    }
}

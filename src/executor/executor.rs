//! Query executor
//!
//! Pull-based (`open`/`next`/`close`) operators over the logical plan.
//! Each `next` returns the next output row or end-of-stream. CTE plans are
//! materialized once into the execution context and scanned by name.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::planner::{AggSpec, Plan};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::sql::ast::{AggArg, AggFunc, BinaryOperator, ColumnRef, Expr, JoinKind, Literal, OrderByItem, SelectItem};
use crate::storage::btree::{BTree, Cursor};
use crate::storage::pager::Pager;
use crate::storage::record::{decode_key, decode_row, encode_key, Row, Value};

/// Query result
#[derive(Debug)]
pub struct QueryResult {
    /// Output column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Rows affected by INSERT/UPDATE/DELETE
    pub affected_rows: usize,
    /// Human-readable message for non-query statements
    pub message: Option<String>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: 0,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty()
        }
    }

    pub fn with_affected_rows(count: usize, message: impl Into<String>) -> Self {
        Self {
            affected_rows: count,
            message: Some(message.into()),
            ..Self::empty()
        }
    }
}

/// An output column: optional table binding plus column name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutCol {
    pub table: Option<String>,
    pub name: String,
}

/// Resolve a column reference against a schema. Qualified references match
/// the binding, or an output column that carries the qualified name itself
/// (projections name explicit `t.col` items that way). Unqualified
/// references take the first bare-name match, falling back to a `.name`
/// suffix match against qualified output names.
fn resolve(schema: &[OutCol], col: &ColumnRef) -> Result<usize> {
    let found = match &col.table {
        Some(qualifier) => schema.iter().position(|c| {
            (c.table.as_deref() == Some(qualifier.as_str()) && c.name == col.column)
                || (c.name.len() == qualifier.len() + 1 + col.column.len()
                    && c.name.starts_with(qualifier.as_str())
                    && c.name.ends_with(col.column.as_str())
                    && c.name.as_bytes()[qualifier.len()] == b'.')
        }),
        None => {
            let suffix = format!(".{}", col.column);
            schema
                .iter()
                .position(|c| c.name == col.column)
                .or_else(|| schema.iter().position(|c| c.name.ends_with(&suffix)))
        }
    };
    found.ok_or_else(|| Error::ColumnNotFound(col.to_string()))
}

/// Mutable state shared by all operators of one statement
pub struct ExecContext<'a> {
    pub pager: &'a mut Pager,
    pub catalog: &'a Catalog,
    /// Materialized CTE results by name
    pub ctes: HashMap<String, (Vec<OutCol>, Vec<Row>)>,
}

impl<'a> ExecContext<'a> {
    pub fn new(pager: &'a mut Pager, catalog: &'a Catalog) -> Self {
        Self {
            pager,
            catalog,
            ctes: HashMap::new(),
        }
    }
}

/// Execute a plan to completion, materializing CTEs along the way.
pub fn execute_plan(ctx: &mut ExecContext, plan: &Plan) -> Result<(Vec<OutCol>, Vec<Row>)> {
    if let Plan::CteMaterialize { name, input, next } = plan {
        let (schema, rows) = execute_plan(ctx, input)?;
        ctx.ctes.insert(name.clone(), (schema, rows));
        return execute_plan(ctx, next);
    }

    let mut op = build_operator(plan)?;
    op.open(ctx)?;
    let schema = op.schema().to_vec();
    let mut rows = Vec::new();
    loop {
        match op.next(ctx) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break,
            Err(e) => {
                op.close(ctx)?;
                return Err(e);
            }
        }
    }
    op.close(ctx)?;
    Ok((schema, rows))
}

/// Execute a SELECT plan into a query result.
pub fn run_select(ctx: &mut ExecContext, plan: &Plan) -> Result<QueryResult> {
    let (schema, rows) = execute_plan(ctx, plan)?;
    Ok(QueryResult {
        columns: schema.into_iter().map(|c| c.name).collect(),
        rows,
        affected_rows: 0,
        message: None,
    })
}

// ---------- expression evaluation ----------

pub fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Integer(n) => Value::Int(*n),
        Literal::String(s) => Value::Str(s.clone()),
    }
}

/// Evaluate an expression to a value. Logical operators evaluate to
/// Int(1)/Int(0) through the predicate path.
pub fn eval_expr(expr: &Expr, row: &[Value], schema: &[OutCol]) -> Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(literal_to_value(lit)),
        Expr::Column(col) => {
            let idx = resolve(schema, col)?;
            Ok(row[idx].clone())
        }
        Expr::BinaryOp { .. } | Expr::Not(_) => {
            Ok(Value::Int(eval_predicate(expr, row, schema)? as i64))
        }
    }
}

/// Evaluate an expression as a predicate. A comparison against NULL is
/// false; comparing incompatible types is a TYPE error.
pub fn eval_predicate(expr: &Expr, row: &[Value], schema: &[OutCol]) -> Result<bool> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => {
                Ok(eval_predicate(left, row, schema)? && eval_predicate(right, row, schema)?)
            }
            BinaryOperator::Or => {
                Ok(eval_predicate(left, row, schema)? || eval_predicate(right, row, schema)?)
            }
            _ => {
                let l = eval_expr(left, row, schema)?;
                let r = eval_expr(right, row, schema)?;
                if l.is_null() || r.is_null() {
                    return Ok(false);
                }
                let ord = l.compare(&r)?;
                Ok(match op {
                    BinaryOperator::Eq => ord == Ordering::Equal,
                    BinaryOperator::Neq => ord != Ordering::Equal,
                    BinaryOperator::Lt => ord == Ordering::Less,
                    BinaryOperator::Gt => ord == Ordering::Greater,
                    BinaryOperator::Lte => ord != Ordering::Greater,
                    BinaryOperator::Gte => ord != Ordering::Less,
                    BinaryOperator::And | BinaryOperator::Or => unreachable!(),
                })
            }
        },
        Expr::Not(inner) => Ok(!eval_predicate(inner, row, schema)?),
        // A bare value is truthy unless NULL or zero.
        other => match eval_expr(other, row, schema)? {
            Value::Null => Ok(false),
            Value::Int(i) => Ok(i != 0),
            Value::Float(f) => Ok(f != 0.0),
            Value::Str(s) => Ok(!s.is_empty()),
        },
    }
}

// ---------- operators ----------

/// A pull-based plan operator
trait Operator {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()>;
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>>;
    fn close(&mut self, ctx: &mut ExecContext) -> Result<()>;
    /// Output schema; valid after `open`.
    fn schema(&self) -> &[OutCol];
}

fn build_operator(plan: &Plan) -> Result<Box<dyn Operator>> {
    Ok(match plan {
        Plan::SeqScan { table, binding } => Box::new(SeqScanOp {
            table: table.clone(),
            binding: binding.clone(),
            schema: Vec::new(),
            cursor: None,
        }),
        Plan::IndexScan {
            table,
            binding,
            index,
            op,
            value,
        } => Box::new(IndexScanOp {
            table: table.clone(),
            binding: binding.clone(),
            index: index.clone(),
            op: *op,
            value: literal_to_value(value),
            schema: Vec::new(),
            table_tree: None,
            cursor: None,
            done: false,
        }),
        Plan::CteScan { name, binding } => Box::new(CteScanOp {
            name: name.clone(),
            binding: binding.clone(),
            schema: Vec::new(),
            rows: Vec::new(),
            pos: 0,
        }),
        Plan::Filter { input, predicate } => Box::new(FilterOp {
            input: build_operator(input)?,
            predicate: predicate.clone(),
        }),
        Plan::NestedLoopJoin {
            left,
            right,
            kind,
            condition,
        } => Box::new(NestedLoopJoinOp {
            left: build_operator(left)?,
            right: build_operator(right)?,
            kind: *kind,
            condition: condition.clone(),
            schema: Vec::new(),
            right_rows: Vec::new(),
            current_left: None,
            right_pos: 0,
            matched: false,
        }),
        Plan::HashAggregate {
            input,
            group_by,
            aggregates,
        } => Box::new(HashAggregateOp {
            input: build_operator(input)?,
            group_by: group_by.clone(),
            aggregates: aggregates.clone(),
            schema: Vec::new(),
            output: Vec::new(),
            pos: 0,
        }),
        Plan::Sort { input, keys } => Box::new(SortOp {
            input: build_operator(input)?,
            keys: keys.clone(),
            rows: Vec::new(),
            pos: 0,
        }),
        Plan::Project { input, items } => Box::new(ProjectOp {
            input: build_operator(input)?,
            items: items.clone(),
            schema: Vec::new(),
        }),
        Plan::CteMaterialize { .. } => {
            return Err(Error::Internal(
                "CteMaterialize must be handled by execute_plan".to_string(),
            ));
        }
    })
}

/// Full table scan in primary-key order
struct SeqScanOp {
    table: String,
    binding: String,
    schema: Vec<OutCol>,
    cursor: Option<Cursor>,
}

impl Operator for SeqScanOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        let def = ctx.catalog.get_table(&self.table)?;
        self.schema = def
            .columns
            .iter()
            .map(|c| OutCol {
                table: Some(self.binding.clone()),
                name: c.name.clone(),
            })
            .collect();
        let tree = BTree::table(def.root_page);
        self.cursor = Some(tree.cursor_first(ctx.pager)?);
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| Error::Internal("scan not open".to_string()))?;
        match cursor.next(ctx.pager)? {
            Some((_, payload)) => Ok(Some(decode_row(&payload)?)),
            None => Ok(None),
        }
    }

    fn close(&mut self, _ctx: &mut ExecContext) -> Result<()> {
        self.cursor = None;
        Ok(())
    }

    fn schema(&self) -> &[OutCol] {
        &self.schema
    }
}

/// Index scan: walks `(value, pk)` index entries satisfying one comparison
/// and fetches each row from the table tree by primary key.
struct IndexScanOp {
    table: String,
    binding: String,
    index: String,
    op: BinaryOperator,
    value: Value,
    schema: Vec<OutCol>,
    table_tree: Option<BTree>,
    cursor: Option<Cursor>,
    done: bool,
}

impl Operator for IndexScanOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        let def = ctx.catalog.get_table(&self.table)?;
        self.schema = def
            .columns
            .iter()
            .map(|c| OutCol {
                table: Some(self.binding.clone()),
                name: c.name.clone(),
            })
            .collect();
        self.table_tree = Some(BTree::table(def.root_page));

        let index = ctx.catalog.get_index(&self.index)?;
        let index_tree = BTree::index(index.root_page);
        // Equality and lower-bounded scans start at the first entry whose
        // value component is >= the literal; upper-bounded scans start at
        // the beginning.
        let cursor = match self.op {
            BinaryOperator::Eq | BinaryOperator::Gt | BinaryOperator::Gte => {
                let prefix = encode_key(std::slice::from_ref(&self.value))?;
                index_tree.cursor_seek(ctx.pager, &prefix)?
            }
            _ => index_tree.cursor_first(ctx.pager)?,
        };
        self.cursor = Some(cursor);
        self.done = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| Error::Internal("index scan not open".to_string()))?;
        loop {
            let (key, _) = match cursor.next(ctx.pager)? {
                Some(entry) => entry,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            let components = decode_key(&key)?;
            if components.len() != 2 {
                return Err(Error::Corrupt(format!(
                    "index '{}' entry with {} components",
                    self.index,
                    components.len()
                )));
            }
            let entry_value = &components[0];
            let ord = entry_value.compare(&self.value)?;

            // Keys arrive in ascending value order, so a passed upper
            // bound ends the scan.
            let verdict = match self.op {
                BinaryOperator::Eq => match ord {
                    Ordering::Equal => Some(true),
                    Ordering::Greater => None,
                    Ordering::Less => Some(false),
                },
                BinaryOperator::Gt => Some(ord == Ordering::Greater),
                BinaryOperator::Gte => Some(ord != Ordering::Less),
                BinaryOperator::Lt => match ord {
                    Ordering::Less => Some(true),
                    _ => None,
                },
                BinaryOperator::Lte => match ord {
                    Ordering::Greater => None,
                    _ => Some(true),
                },
                other => {
                    return Err(Error::Internal(format!(
                        "operator {} in index scan",
                        other
                    )))
                }
            };

            match verdict {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some(false) => continue,
                Some(true) => {}
            }

            let pk = &components[1];
            let pk_key = encode_key(std::slice::from_ref(pk))?;
            let table_tree = self.table_tree.as_ref().unwrap();
            match table_tree.search(ctx.pager, &pk_key)? {
                Some(payload) => return Ok(Some(decode_row(&payload)?)),
                None => {
                    return Err(Error::Corrupt(format!(
                        "index '{}' references missing row",
                        self.index
                    )));
                }
            }
        }
    }

    fn close(&mut self, _ctx: &mut ExecContext) -> Result<()> {
        self.cursor = None;
        Ok(())
    }

    fn schema(&self) -> &[OutCol] {
        &self.schema
    }
}

/// Scan over a previously materialized CTE
struct CteScanOp {
    name: String,
    binding: String,
    schema: Vec<OutCol>,
    rows: Vec<Row>,
    pos: usize,
}

impl Operator for CteScanOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        let (schema, rows) = ctx
            .ctes
            .get(&self.name)
            .ok_or_else(|| Error::Internal(format!("CTE '{}' not materialized", self.name)))?;
        // Requalify columns under the scan's binding.
        self.schema = schema
            .iter()
            .map(|c| OutCol {
                table: Some(self.binding.clone()),
                name: c.name.clone(),
            })
            .collect();
        self.rows = rows.clone();
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.pos < self.rows.len() {
            self.pos += 1;
            Ok(Some(self.rows[self.pos - 1].clone()))
        } else {
            Ok(None)
        }
    }

    fn close(&mut self, _ctx: &mut ExecContext) -> Result<()> {
        self.rows.clear();
        Ok(())
    }

    fn schema(&self) -> &[OutCol] {
        &self.schema
    }
}

/// Row filter
struct FilterOp {
    input: Box<dyn Operator>,
    predicate: Expr,
}

impl Operator for FilterOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.input.open(ctx)
    }

    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        while let Some(row) = self.input.next(ctx)? {
            if eval_predicate(&self.predicate, &row, self.input.schema())? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[OutCol] {
        self.input.schema()
    }
}

/// Nested-loop join; buffers the right side at open
struct NestedLoopJoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    kind: JoinKind,
    condition: Expr,
    schema: Vec<OutCol>,
    right_rows: Vec<Row>,
    current_left: Option<Row>,
    right_pos: usize,
    matched: bool,
}

impl Operator for NestedLoopJoinOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;
        self.schema = self.left.schema().to_vec();
        self.schema.extend(self.right.schema().to_vec());

        self.right_rows.clear();
        while let Some(row) = self.right.next(ctx)? {
            self.right_rows.push(row);
        }
        self.right.close(ctx)?;
        self.current_left = None;
        self.right_pos = 0;
        self.matched = false;
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let right_width = self.schema.len() - self.left.schema().len();
        loop {
            if self.current_left.is_none() {
                self.current_left = self.left.next(ctx)?;
                self.right_pos = 0;
                self.matched = false;
                if self.current_left.is_none() {
                    return Ok(None);
                }
            }
            let left_row = self.current_left.as_ref().unwrap();

            while self.right_pos < self.right_rows.len() {
                let right_row = &self.right_rows[self.right_pos];
                self.right_pos += 1;
                let mut combined = left_row.clone();
                combined.extend(right_row.iter().cloned());
                if eval_predicate(&self.condition, &combined, &self.schema)? {
                    self.matched = true;
                    return Ok(Some(combined));
                }
            }

            // Right side exhausted for this left row.
            if self.kind == JoinKind::Left && !self.matched {
                let mut padded = left_row.clone();
                padded.extend(std::iter::repeat(Value::Null).take(right_width));
                self.current_left = None;
                return Ok(Some(padded));
            }
            self.current_left = None;
        }
    }

    fn close(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.left.close(ctx)?;
        self.right_rows.clear();
        Ok(())
    }

    fn schema(&self) -> &[OutCol] {
        &self.schema
    }
}

/// Per-group accumulator
#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    Sum { int: i64, float: f64, any: bool, all_int: bool },
    Avg { sum: f64, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AggState {
    fn new(func: AggFunc) -> AggState {
        match func {
            AggFunc::Count => AggState::Count(0),
            AggFunc::Sum => AggState::Sum {
                int: 0,
                float: 0.0,
                any: false,
                all_int: true,
            },
            AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggFunc::Min => AggState::Min(None),
            AggFunc::Max => AggState::Max(None),
        }
    }

    /// Fold one input value. COUNT(*) passes `None`; other aggregates skip
    /// NULLs.
    fn update(&mut self, value: Option<&Value>, label: &str) -> Result<()> {
        match self {
            AggState::Count(n) => {
                match value {
                    None => *n += 1,                     // COUNT(*)
                    Some(v) if !v.is_null() => *n += 1,  // COUNT(expr)
                    Some(_) => {}
                }
            }
            AggState::Sum {
                int,
                float,
                any,
                all_int,
            } => {
                if let Some(v) = value {
                    match v {
                        Value::Null => {}
                        Value::Int(i) => {
                            *int += i;
                            *float += *i as f64;
                            *any = true;
                        }
                        Value::Float(f) => {
                            *float += f;
                            *any = true;
                            *all_int = false;
                        }
                        Value::Str(_) => {
                            return Err(Error::Type(format!(
                                "{} requires numeric values",
                                label
                            )));
                        }
                    }
                }
            }
            AggState::Avg { sum, count } => {
                if let Some(v) = value {
                    match v {
                        Value::Null => {}
                        Value::Int(i) => {
                            *sum += *i as f64;
                            *count += 1;
                        }
                        Value::Float(f) => {
                            *sum += f;
                            *count += 1;
                        }
                        Value::Str(_) => {
                            return Err(Error::Type(format!(
                                "{} requires numeric values",
                                label
                            )));
                        }
                    }
                }
            }
            AggState::Min(best) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let replace = match best {
                            None => true,
                            Some(b) => v.compare(b)? == Ordering::Less,
                        };
                        if replace {
                            *best = Some(v.clone());
                        }
                    }
                }
            }
            AggState::Max(best) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let replace = match best {
                            None => true,
                            Some(b) => v.compare(b)? == Ordering::Greater,
                        };
                        if replace {
                            *best = Some(v.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            AggState::Count(n) => Value::Int(n),
            AggState::Sum {
                int,
                float,
                any,
                all_int,
            } => {
                if !any {
                    Value::Null
                } else if all_int {
                    Value::Int(int)
                } else {
                    Value::Float(float)
                }
            }
            AggState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / count as f64)
                }
            }
            AggState::Min(best) | AggState::Max(best) => best.unwrap_or(Value::Null),
        }
    }
}

/// Hash aggregation keyed by the encoded group values
struct HashAggregateOp {
    input: Box<dyn Operator>,
    group_by: Vec<ColumnRef>,
    aggregates: Vec<AggSpec>,
    schema: Vec<OutCol>,
    output: Vec<Row>,
    pos: usize,
}

impl Operator for HashAggregateOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.input.open(ctx)?;
        let in_schema = self.input.schema().to_vec();

        self.schema = self
            .group_by
            .iter()
            .map(|g| OutCol {
                table: g.table.clone(),
                name: g.column.clone(),
            })
            .chain(self.aggregates.iter().map(|a| OutCol {
                table: None,
                name: a.label.clone(),
            }))
            .collect();

        // Group in first-seen order.
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Value>, Vec<AggState>)> = Vec::new();

        while let Some(row) = self.input.next(ctx)? {
            let mut key_values = Vec::with_capacity(self.group_by.len());
            for col in &self.group_by {
                let idx = resolve(&in_schema, col)?;
                key_values.push(row[idx].clone());
            }
            let key = encode_key(&key_values)?;
            let slot = match index.get(&key) {
                Some(&slot) => slot,
                None => {
                    let states = self
                        .aggregates
                        .iter()
                        .map(|a| AggState::new(a.func))
                        .collect();
                    groups.push((key_values, states));
                    index.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };

            for (spec, state) in self.aggregates.iter().zip(groups[slot].1.iter_mut()) {
                match &spec.arg {
                    AggArg::Star => state.update(None, &spec.label)?,
                    AggArg::Expr(expr) => {
                        let value = eval_expr(expr, &row, &in_schema)?;
                        state.update(Some(&value), &spec.label)?;
                    }
                }
            }
        }
        self.input.close(ctx)?;

        // Aggregates without GROUP BY produce exactly one row.
        if groups.is_empty() && self.group_by.is_empty() {
            let states: Vec<AggState> = self
                .aggregates
                .iter()
                .map(|a| AggState::new(a.func))
                .collect();
            groups.push((Vec::new(), states));
        }

        self.output = groups
            .into_iter()
            .map(|(mut values, states)| {
                values.extend(states.into_iter().map(AggState::finish));
                values
            })
            .collect();
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.pos < self.output.len() {
            self.pos += 1;
            Ok(Some(self.output[self.pos - 1].clone()))
        } else {
            Ok(None)
        }
    }

    fn close(&mut self, _ctx: &mut ExecContext) -> Result<()> {
        self.output.clear();
        Ok(())
    }

    fn schema(&self) -> &[OutCol] {
        &self.schema
    }
}

/// Full sort; stable, so ties keep input order. NULLs sort first.
struct SortOp {
    input: Box<dyn Operator>,
    keys: Vec<OrderByItem>,
    rows: Vec<Row>,
    pos: usize,
}

impl Operator for SortOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.input.open(ctx)?;
        let schema = self.input.schema().to_vec();

        let mut keyed: Vec<(Vec<Value>, Row)> = Vec::new();
        while let Some(row) = self.input.next(ctx)? {
            let mut key = Vec::with_capacity(self.keys.len());
            for item in &self.keys {
                key.push(eval_expr(&item.expr, &row, &schema)?);
            }
            keyed.push((key, row));
        }
        self.input.close(ctx)?;

        let directions: Vec<bool> = self.keys.iter().map(|k| k.ascending).collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, ascending) in directions.iter().enumerate() {
                let ord = a[i].compare(&b[i]).unwrap_or(Ordering::Equal);
                if ord != Ordering::Equal {
                    return if *ascending { ord } else { ord.reverse() };
                }
            }
            Ordering::Equal
        });

        self.rows = keyed.into_iter().map(|(_, row)| row).collect();
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.pos < self.rows.len() {
            self.pos += 1;
            Ok(Some(self.rows[self.pos - 1].clone()))
        } else {
            Ok(None)
        }
    }

    fn close(&mut self, _ctx: &mut ExecContext) -> Result<()> {
        self.rows.clear();
        Ok(())
    }

    fn schema(&self) -> &[OutCol] {
        self.input.schema()
    }
}

/// Projection of select-list items
struct ProjectOp {
    input: Box<dyn Operator>,
    items: Vec<SelectItem>,
    schema: Vec<OutCol>,
}

impl Operator for ProjectOp {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.input.open(ctx)?;
        self.schema = Vec::new();
        for item in &self.items {
            match item {
                SelectItem::Wildcard => {
                    self.schema.extend(self.input.schema().to_vec());
                }
                SelectItem::Expr { expr, alias } => {
                    self.schema.push(OutCol {
                        table: None,
                        name: alias.clone().unwrap_or_else(|| expr.display_name()),
                    });
                }
                SelectItem::Aggregate { alias, label, .. } => {
                    self.schema.push(OutCol {
                        table: None,
                        name: alias.clone().unwrap_or_else(|| label.clone()),
                    });
                }
            }
        }
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let row = match self.input.next(ctx)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let in_schema = self.input.schema();
        let mut out = Vec::with_capacity(self.items.len());
        for item in &self.items {
            match item {
                SelectItem::Wildcard => out.extend(row.iter().cloned()),
                SelectItem::Expr { expr, .. } => out.push(eval_expr(expr, &row, in_schema)?),
                SelectItem::Aggregate { label, .. } => {
                    // Aggregate values arrive from HashAggregate under their
                    // label.
                    let col = ColumnRef {
                        table: None,
                        column: label.clone(),
                    };
                    let idx = resolve(in_schema, &col)?;
                    out.push(row[idx].clone());
                }
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &[OutCol] {
        &self.schema
    }
}

//! SQL abstract syntax tree

use crate::catalog::DataType;

/// A SQL statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable(CreateTableStatement),
    CreateIndex(CreateIndexStatement),
    Insert(InsertStatement),
    Select(SelectStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Begin,
    Commit,
    Rollback,
}

/// SELECT statement, including its WITH-clause CTEs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    /// Common table expressions, in declaration order
    pub ctes: Vec<Cte>,
    /// Select list
    pub projection: Vec<SelectItem>,
    /// Base table of the FROM clause
    pub from: TableRef,
    /// JOIN clauses
    pub joins: Vec<Join>,
    /// WHERE clause
    pub where_clause: Option<Expr>,
    /// GROUP BY columns
    pub group_by: Vec<ColumnRef>,
    /// ORDER BY items
    pub order_by: Vec<OrderByItem>,
}

/// A named subquery materialized once per statement
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: SelectStatement,
}

/// A single item in the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// All columns (*)
    Wildcard,
    /// An expression with optional alias
    Expr { expr: Expr, alias: Option<String> },
    /// An aggregate call; `label` is the original SQL text, used as the
    /// output column name when no alias is given
    Aggregate {
        func: AggFunc,
        arg: AggArg,
        alias: Option<String>,
        label: String,
    },
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl std::fmt::Display for AggFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggFunc::Count => write!(f, "COUNT"),
            AggFunc::Sum => write!(f, "SUM"),
            AggFunc::Avg => write!(f, "AVG"),
            AggFunc::Min => write!(f, "MIN"),
            AggFunc::Max => write!(f, "MAX"),
        }
    }
}

/// Argument of an aggregate call
#[derive(Debug, Clone, PartialEq)]
pub enum AggArg {
    /// COUNT(*)
    Star,
    Expr(Expr),
}

/// Table reference with optional alias
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// The name this table is referred to by in expressions.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// JOIN clause
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub condition: Expr,
}

/// Supported join kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// ORDER BY item
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: Expr,
    pub ascending: bool,
}

/// INSERT statement
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table_name: String,
    /// Optional explicit column list
    pub columns: Option<Vec<String>>,
    /// One or more value rows
    pub values: Vec<Vec<Expr>>,
}

/// UPDATE statement
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table_name: String,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<Expr>,
}

/// Column assignment for UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

/// DELETE statement
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table_name: String,
    /// Executor rejects DELETE without a WHERE clause
    pub where_clause: Option<Expr>,
}

/// CREATE TABLE statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub not_null: bool,
    pub primary_key: bool,
}

/// CREATE INDEX statement (single column)
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStatement {
    pub index_name: String,
    pub table_name: String,
    pub column: String,
}

/// SQL expression: disjunctions of conjunctions of comparisons
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Literal),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
}

impl Expr {
    /// Render roughly as source text; used for output column names.
    pub fn display_name(&self) -> String {
        match self {
            Expr::Column(c) => c.to_string(),
            Expr::Literal(l) => l.to_string(),
            Expr::BinaryOp { left, op, right } => {
                format!("{} {} {}", left.display_name(), op, right.display_name())
            }
            Expr::Not(inner) => format!("NOT {}", inner.display_name()),
        }
    }
}

/// Column reference, optionally qualified by table name or alias
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{}.{}", t, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

/// Literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Integer(i64),
    String(String),
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::String(s) => write!(f, "'{}'", s),
        }
    }
}

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        !matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

impl std::fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOperator::Eq => write!(f, "="),
            BinaryOperator::Neq => write!(f, "!="),
            BinaryOperator::Lt => write!(f, "<"),
            BinaryOperator::Gt => write!(f, ">"),
            BinaryOperator::Lte => write!(f, "<="),
            BinaryOperator::Gte => write!(f, ">="),
            BinaryOperator::And => write!(f, "AND"),
            BinaryOperator::Or => write!(f, "OR"),
        }
    }
}

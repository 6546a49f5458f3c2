//! Query planner
//!
//! Converts a parsed SELECT into a tree of logical operators. Index
//! selection is syntactic: a top-level `column <op> literal` conjunct on an
//! indexed column turns the base scan into an index scan, with the remaining
//! conjuncts left in a filter.

use std::collections::HashSet;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::sql::ast::*;

/// Logical plan operator
#[derive(Debug, Clone)]
pub enum Plan {
    /// Full scan of a table in primary-key order
    SeqScan { table: String, binding: String },
    /// Scan of a secondary index restricted by one comparison
    IndexScan {
        table: String,
        binding: String,
        index: String,
        op: BinaryOperator,
        value: Literal,
    },
    /// Scan of a materialized CTE
    CteScan { name: String, binding: String },
    /// Row filter
    Filter { input: Box<Plan>, predicate: Expr },
    /// Nested-loop join; LEFT pads unmatched left rows with NULLs
    NestedLoopJoin {
        left: Box<Plan>,
        right: Box<Plan>,
        kind: JoinKind,
        condition: Expr,
    },
    /// Grouping and aggregation, keyed by the encoded group values
    HashAggregate {
        input: Box<Plan>,
        group_by: Vec<ColumnRef>,
        aggregates: Vec<AggSpec>,
    },
    /// Full sort of the input
    Sort {
        input: Box<Plan>,
        keys: Vec<OrderByItem>,
    },
    /// Projection of output expressions
    Project {
        input: Box<Plan>,
        items: Vec<SelectItem>,
    },
    /// Materialize a CTE once, then run the rest of the plan
    CteMaterialize {
        name: String,
        input: Box<Plan>,
        next: Box<Plan>,
    },
}

/// One aggregate computed by HashAggregate
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub func: AggFunc,
    pub arg: AggArg,
    /// Output column name (`COUNT(*)`, `AVG(salary)`, ...)
    pub label: String,
}

/// Query planner
pub struct Planner<'a> {
    catalog: &'a Catalog,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Plan a SELECT statement, including its CTE chain.
    pub fn plan_select(&self, stmt: &SelectStatement) -> Result<Plan> {
        let mut visible_ctes = HashSet::new();
        self.plan_select_inner(stmt, &mut visible_ctes)
    }

    fn plan_select_inner(
        &self,
        stmt: &SelectStatement,
        visible_ctes: &mut HashSet<String>,
    ) -> Result<Plan> {
        // Plan CTE bodies first; each sees the ones declared before it.
        let mut cte_plans = Vec::new();
        for cte in &stmt.ctes {
            let plan = self.plan_select_inner(&cte.query, visible_ctes)?;
            visible_ctes.insert(cte.name.clone());
            cte_plans.push((cte.name.clone(), plan));
        }

        let mut plan = self.plan_source(&stmt.from, visible_ctes)?;

        for join in &stmt.joins {
            let right = self.plan_source(&join.table, visible_ctes)?;
            plan = Plan::NestedLoopJoin {
                left: Box::new(plan),
                right: Box::new(right),
                kind: join.kind,
                condition: join.condition.clone(),
            };
        }

        if let Some(predicate) = &stmt.where_clause {
            plan = self.plan_filter(plan, predicate, stmt.joins.is_empty())?;
        }

        let aggregates = collect_aggregates(&stmt.projection);
        if !stmt.group_by.is_empty() || !aggregates.is_empty() {
            validate_grouped_projection(&stmt.projection, &stmt.group_by)?;
            plan = Plan::HashAggregate {
                input: Box::new(plan),
                group_by: stmt.group_by.clone(),
                aggregates,
            };
        }

        plan = Plan::Project {
            input: Box::new(plan),
            items: stmt.projection.clone(),
        };

        if !stmt.order_by.is_empty() {
            plan = Plan::Sort {
                input: Box::new(plan),
                keys: stmt.order_by.clone(),
            };
        }

        // Chain CTE materializations in declaration order, innermost last.
        for (name, cte_plan) in cte_plans.into_iter().rev() {
            plan = Plan::CteMaterialize {
                name,
                input: Box::new(cte_plan),
                next: Box::new(plan),
            };
        }
        Ok(plan)
    }

    fn plan_source(&self, table: &TableRef, visible_ctes: &HashSet<String>) -> Result<Plan> {
        let binding = table.binding().to_string();
        if visible_ctes.contains(&table.name) {
            return Ok(Plan::CteScan {
                name: table.name.clone(),
                binding,
            });
        }
        // Fail at plan time for unknown tables.
        self.catalog.get_table(&table.name)?;
        Ok(Plan::SeqScan {
            table: table.name.clone(),
            binding,
        })
    }

    /// Wrap `input` in a filter, converting one indexable conjunct into an
    /// index scan when the input is a plain table scan.
    fn plan_filter(&self, input: Plan, predicate: &Expr, single_table: bool) -> Result<Plan> {
        if let (true, Plan::SeqScan { table, binding }) = (single_table, &input) {
            let conjuncts = split_conjuncts(predicate);
            for (i, conjunct) in conjuncts.iter().enumerate() {
                if let Some((column, op, value)) = indexable_comparison(conjunct, binding) {
                    let index = self
                        .catalog
                        .indexes_for_table(table)
                        .into_iter()
                        .find(|idx| idx.column == column);
                    if let Some(index) = index {
                        let mut plan = Plan::IndexScan {
                            table: table.clone(),
                            binding: binding.clone(),
                            index: index.name.clone(),
                            op,
                            value,
                        };
                        let residual: Vec<&Expr> = conjuncts
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, e)| *e)
                            .collect();
                        if let Some(residual) = join_conjuncts(&residual) {
                            plan = Plan::Filter {
                                input: Box::new(plan),
                                predicate: residual,
                            };
                        }
                        return Ok(plan);
                    }
                }
            }
        }
        Ok(Plan::Filter {
            input: Box::new(input),
            predicate: predicate.clone(),
        })
    }
}

/// Split top-level AND conjuncts.
fn split_conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut parts = split_conjuncts(left);
            parts.extend(split_conjuncts(right));
            parts
        }
        other => vec![other],
    }
}

fn join_conjuncts(parts: &[&Expr]) -> Option<Expr> {
    let mut iter = parts.iter();
    let first = (*iter.next()?).clone();
    Some(iter.fold(first, |acc, next| Expr::BinaryOp {
        left: Box::new(acc),
        op: BinaryOperator::And,
        right: Box::new((*next).clone()),
    }))
}

/// Match `column <op> literal` (either orientation) against the given table
/// binding; NULL literals and != never use an index.
fn indexable_comparison(expr: &Expr, binding: &str) -> Option<(String, BinaryOperator, Literal)> {
    let (col, op, lit) = match expr {
        Expr::BinaryOp { left, op, right } if op.is_comparison() => match (&**left, &**right) {
            (Expr::Column(c), Expr::Literal(l)) => (c, *op, l),
            (Expr::Literal(l), Expr::Column(c)) => (c, flip(*op)?, l),
            _ => return None,
        },
        _ => return None,
    };
    if matches!(op, BinaryOperator::Neq) || matches!(lit, Literal::Null) {
        return None;
    }
    if let Some(qualifier) = &col.table {
        if qualifier != binding {
            return None;
        }
    }
    Some((col.column.clone(), op, lit.clone()))
}

fn flip(op: BinaryOperator) -> Option<BinaryOperator> {
    match op {
        BinaryOperator::Eq => Some(BinaryOperator::Eq),
        BinaryOperator::Neq => Some(BinaryOperator::Neq),
        BinaryOperator::Lt => Some(BinaryOperator::Gt),
        BinaryOperator::Gt => Some(BinaryOperator::Lt),
        BinaryOperator::Lte => Some(BinaryOperator::Gte),
        BinaryOperator::Gte => Some(BinaryOperator::Lte),
        _ => None,
    }
}

fn collect_aggregates(projection: &[SelectItem]) -> Vec<AggSpec> {
    projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::Aggregate {
                func, arg, label, ..
            } => Some(AggSpec {
                func: *func,
                arg: arg.clone(),
                label: label.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// With grouping, every plain projected column must be a group key.
fn validate_grouped_projection(
    projection: &[SelectItem],
    group_by: &[ColumnRef],
) -> Result<()> {
    for item in projection {
        match item {
            SelectItem::Wildcard => {
                return Err(Error::Schema(
                    "SELECT * cannot be combined with aggregation".to_string(),
                ));
            }
            SelectItem::Expr { expr, .. } => match expr {
                Expr::Column(c) => {
                    if !group_by.iter().any(|g| g.column == c.column) {
                        return Err(Error::Schema(format!(
                            "column '{}' must appear in GROUP BY or an aggregate",
                            c
                        )));
                    }
                }
                Expr::Literal(_) => {}
                other => {
                    return Err(Error::Schema(format!(
                        "expression '{}' is not valid with GROUP BY",
                        other.display_name()
                    )));
                }
            },
            SelectItem::Aggregate { .. } => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType};
    use crate::sql::Parser as SqlParser;
    use crate::storage::pager::Pager;
    use tempfile::TempDir;

    fn catalog_with_employees() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db")).unwrap();
        pager.begin_write().unwrap();
        let mut catalog = Catalog::load(&mut pager).unwrap();
        catalog
            .create_table(
                &mut pager,
                "employees",
                vec![
                    Column::new("id", DataType::Int).primary_key(),
                    Column::new("role", DataType::Str),
                    Column::new("salary", DataType::Int),
                ],
            )
            .unwrap();
        catalog
            .create_index(&mut pager, "idx_role", "employees", "role")
            .unwrap();
        pager.commit().unwrap();
        (dir, catalog)
    }

    fn plan(catalog: &Catalog, sql: &str) -> Plan {
        let stmt = SqlParser::new(sql).unwrap().parse().unwrap();
        match stmt {
            Statement::Select(s) => Planner::new(catalog).plan_select(&s).unwrap(),
            _ => panic!("expected SELECT"),
        }
    }

    #[test]
    fn test_indexed_equality_uses_index_scan() {
        let (_dir, catalog) = catalog_with_employees();
        let p = plan(&catalog, "SELECT * FROM employees WHERE role = 'Engineer'");
        match p {
            Plan::Project { input, .. } => match *input {
                Plan::IndexScan { index, op, .. } => {
                    assert_eq!(index, "idx_role");
                    assert_eq!(op, BinaryOperator::Eq);
                }
                other => panic!("expected IndexScan, got {:?}", other),
            },
            other => panic!("expected Project, got {:?}", other),
        }
    }

    #[test]
    fn test_unindexed_predicate_uses_seq_scan() {
        let (_dir, catalog) = catalog_with_employees();
        let p = plan(&catalog, "SELECT * FROM employees WHERE salary > 100000");
        match p {
            Plan::Project { input, .. } => match *input {
                Plan::Filter { input, .. } => {
                    assert!(matches!(*input, Plan::SeqScan { .. }));
                }
                other => panic!("expected Filter over SeqScan, got {:?}", other),
            },
            other => panic!("expected Project, got {:?}", other),
        }
    }

    #[test]
    fn test_residual_filter_kept() {
        let (_dir, catalog) = catalog_with_employees();
        let p = plan(
            &catalog,
            "SELECT * FROM employees WHERE role = 'Engineer' AND salary > 10",
        );
        match p {
            Plan::Project { input, .. } => match *input {
                Plan::Filter { input, .. } => {
                    assert!(matches!(*input, Plan::IndexScan { .. }));
                }
                other => panic!("expected residual Filter, got {:?}", other),
            },
            other => panic!("expected Project, got {:?}", other),
        }
    }

    #[test]
    fn test_cte_plans_to_materialize_and_scan() {
        let (_dir, catalog) = catalog_with_employees();
        let p = plan(
            &catalog,
            "WITH hi AS (SELECT role FROM employees) SELECT role FROM hi",
        );
        match p {
            Plan::CteMaterialize { name, next, .. } => {
                assert_eq!(name, "hi");
                match *next {
                    Plan::Project { input, .. } => {
                        assert!(matches!(*input, Plan::CteScan { .. }));
                    }
                    other => panic!("expected Project over CteScan, got {:?}", other),
                }
            }
            other => panic!("expected CteMaterialize, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_table_rejected_at_plan_time() {
        let (_dir, catalog) = catalog_with_employees();
        let stmt = SqlParser::new("SELECT * FROM missing").unwrap().parse().unwrap();
        match stmt {
            Statement::Select(s) => {
                assert!(matches!(
                    Planner::new(&catalog).plan_select(&s),
                    Err(Error::TableNotFound(_))
                ));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_grouped_projection_validation() {
        let (_dir, catalog) = catalog_with_employees();
        let stmt = SqlParser::new("SELECT salary, COUNT(*) FROM employees GROUP BY role")
            .unwrap()
            .parse()
            .unwrap();
        match stmt {
            Statement::Select(s) => {
                assert!(matches!(
                    Planner::new(&catalog).plan_select(&s),
                    Err(Error::Schema(_))
                ));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_aggregation_without_group_by() {
        let (_dir, catalog) = catalog_with_employees();
        let p = plan(&catalog, "SELECT COUNT(*) FROM employees");
        match p {
            Plan::Project { input, .. } => {
                assert!(matches!(*input, Plan::HashAggregate { .. }));
            }
            other => panic!("expected Project over HashAggregate, got {:?}", other),
        }
    }
}

//! Database connection
//!
//! A connection owns its pager, lock manager, and catalog cache; there is no
//! module-level state, so multiple connections in one process are as
//! independent as connections in different processes.
//!
//! Every statement outside an explicit transaction is wrapped in an implicit
//! one: begin, execute, commit on success, rollback on error. Inside a
//! `BEGIN TRANSACTION`, statements accumulate until COMMIT or ROLLBACK; a
//! statement error (other than BUSY, which is retryable) moves the
//! connection to ABORTED, where only ROLLBACK is accepted. Locks follow the
//! SHARED → RESERVED → EXCLUSIVE ladder: SHARED for the first read, RESERVED
//! at the first mutation, EXCLUSIVE only while commit writes the main file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{Catalog, Column, TableDef};
use crate::error::{Error, Result};
use crate::executor::executor::{
    eval_expr, eval_predicate, run_select, ExecContext, OutCol, QueryResult,
};
use crate::executor::Planner;
use crate::locking::{LockManager, LockState};
use crate::sql::ast::*;
use crate::sql::Parser;
use crate::storage::btree::BTree;
use crate::storage::pager::Pager;
use crate::storage::record::{encode_key, encode_row, Row, Value};

/// Connection transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Idle,
    InTxn,
    Aborted,
}

/// A connection to one database file
pub struct Connection {
    pager: Pager,
    locks: LockManager,
    catalog: Catalog,
    state: TxnState,
    path: PathBuf,
}

impl Connection {
    /// Open a database file, creating it if absent. Initialization of a
    /// fresh file and recovery of a hot journal happen under an exclusive
    /// lock; an ordinary open of a healthy database only needs SHARED and
    /// coexists with other connections.
    pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
        let path = path.as_ref().to_path_buf();
        let mut locks = LockManager::open(&path)?;

        let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let open_result: Result<(Pager, Catalog)> = (|| {
            let mut pager = if fresh {
                locks.acquire_exclusive_raw()?;
                Pager::open(&path)?
            } else {
                acquire_shared_recovering(&mut locks, &path)?;
                Pager::open_no_recovery(&path)?
            };
            let catalog = Catalog::load(&mut pager)?;
            Ok((pager, catalog))
        })();
        locks.unlock();

        let (pager, catalog) = open_result?;
        Ok(Connection {
            pager,
            locks,
            catalog,
            state: TxnState::Idle,
            path,
        })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How long lock acquisition retries before failing with BUSY.
    pub fn set_busy_timeout(&mut self, timeout: Duration) {
        self.locks.set_busy_timeout(timeout);
    }

    /// Parse and execute one SQL statement.
    pub fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        let stmt = Parser::new(sql)?.parse()?;

        match (self.state, &stmt) {
            // ABORTED accepts only ROLLBACK.
            (TxnState::Aborted, Statement::Rollback) => {
                self.rollback_txn()?;
                Ok(QueryResult::with_message("Transaction rolled back"))
            }
            (TxnState::Aborted, _) => Err(Error::Syntax(
                "transaction is aborted; only ROLLBACK is accepted".to_string(),
            )),

            (TxnState::Idle, Statement::Begin) => {
                self.state = TxnState::InTxn;
                Ok(QueryResult::with_message("Transaction started"))
            }
            (TxnState::InTxn, Statement::Begin) => Err(Error::Syntax(
                "cannot BEGIN inside a transaction".to_string(),
            )),

            (TxnState::Idle, Statement::Commit) | (TxnState::Idle, Statement::Rollback) => {
                Err(Error::Syntax("no active transaction".to_string()))
            }
            (TxnState::InTxn, Statement::Commit) => {
                self.commit_txn()?;
                Ok(QueryResult::with_message("Transaction committed"))
            }
            (TxnState::InTxn, Statement::Rollback) => {
                self.rollback_txn()?;
                Ok(QueryResult::with_message("Transaction rolled back"))
            }

            (TxnState::InTxn, _) => match self.run_statement(&stmt) {
                Ok(result) => Ok(result),
                Err(e) => {
                    // BUSY is retryable and leaves the transaction usable.
                    if !e.is_busy() {
                        self.state = TxnState::Aborted;
                    }
                    Err(e)
                }
            },

            (TxnState::Idle, _) => {
                // Auto-commit: implicit begin + commit around the statement.
                match self.run_statement(&stmt) {
                    Ok(result) => {
                        self.finish_auto()?;
                        Ok(result)
                    }
                    Err(e) => {
                        self.abort_auto();
                        Err(e)
                    }
                }
            }
        }
    }

    /// List user tables, refreshing the catalog when outside a transaction.
    pub fn tables(&mut self) -> Result<Vec<String>> {
        if self.state == TxnState::Idle {
            self.ensure_read_locked()?;
            let names = self.catalog.table_names();
            self.locks.unlock();
            Ok(names)
        } else {
            Ok(self.catalog.table_names())
        }
    }

    // ---------- locking and transaction plumbing ----------

    /// Acquire SHARED for this statement if not yet held, dropping caches
    /// that another connection's commit may have invalidated.
    fn ensure_read_locked(&mut self) -> Result<()> {
        if self.locks.state() == LockState::Unlocked {
            acquire_shared_recovering(&mut self.locks, &self.path)?;
            self.pager.invalidate_cache()?;
            if self.pager.meta().schema_counter != self.catalog.loaded_counter {
                log::debug!("schema counter changed, reloading catalog");
                self.catalog = Catalog::load(&mut self.pager)?;
            }
        }
        Ok(())
    }

    /// Upgrade to RESERVED and open the journal before the first mutation.
    fn ensure_write(&mut self) -> Result<()> {
        self.ensure_read_locked()?;
        self.locks.acquire_reserved()?;
        if !self.pager.in_transaction() {
            self.pager.begin_write()?;
        }
        Ok(())
    }

    /// Commit an explicit transaction. On BUSY the transaction stays open so
    /// the caller can retry COMMIT.
    fn commit_txn(&mut self) -> Result<()> {
        if self.pager.in_transaction() {
            self.locks.acquire_exclusive()?;
            if let Err(e) = self.pager.commit() {
                self.state = TxnState::Aborted;
                return Err(e);
            }
        }
        self.locks.unlock();
        self.state = TxnState::Idle;
        Ok(())
    }

    fn rollback_txn(&mut self) -> Result<()> {
        let result = self.pager.rollback();
        self.locks.unlock();
        self.state = TxnState::Idle;
        // DDL may have been rolled back; rebuild the in-memory catalog.
        self.catalog = Catalog::load(&mut self.pager)?;
        result
    }

    /// Commit half of the implicit transaction wrap.
    fn finish_auto(&mut self) -> Result<()> {
        if self.pager.in_transaction() {
            if let Err(e) = self.locks.acquire_exclusive().and_then(|_| self.pager.commit()) {
                self.abort_auto();
                return Err(e);
            }
        }
        self.locks.unlock();
        Ok(())
    }

    /// Rollback half of the implicit transaction wrap.
    fn abort_auto(&mut self) {
        if self.pager.in_transaction() {
            if let Err(e) = self.pager.rollback() {
                log::warn!("rollback of implicit transaction failed: {}", e);
            }
            if let Ok(catalog) = Catalog::load(&mut self.pager) {
                self.catalog = catalog;
            }
        }
        self.locks.unlock();
    }

    // ---------- statement dispatch ----------

    fn run_statement(&mut self, stmt: &Statement) -> Result<QueryResult> {
        match stmt {
            Statement::Select(select) => {
                self.ensure_read_locked()?;
                let plan = Planner::new(&self.catalog).plan_select(select)?;
                let mut ctx = ExecContext::new(&mut self.pager, &self.catalog);
                run_select(&mut ctx, &plan)
            }
            Statement::Insert(insert) => {
                self.ensure_write()?;
                self.execute_insert(insert)
            }
            Statement::Update(update) => {
                self.ensure_write()?;
                self.execute_update(update)
            }
            Statement::Delete(delete) => {
                self.ensure_write()?;
                self.execute_delete(delete)
            }
            Statement::CreateTable(create) => {
                self.ensure_write()?;
                self.execute_create_table(create)
            }
            Statement::CreateIndex(create) => {
                self.ensure_write()?;
                self.execute_create_index(create)
            }
            Statement::Begin | Statement::Commit | Statement::Rollback => {
                Err(Error::Internal("transaction statement in dispatch".to_string()))
            }
        }
    }

    // ---------- DML ----------

    fn execute_insert(&mut self, stmt: &InsertStatement) -> Result<QueryResult> {
        let table = self.catalog.get_table(&stmt.table_name)?.clone();
        let indexes: Vec<_> = self
            .catalog
            .indexes_for_table(&table.name)
            .into_iter()
            .cloned()
            .collect();

        let mut inserted = 0;
        for value_exprs in &stmt.values {
            let row = build_insert_row(&table, stmt.columns.as_deref(), value_exprs)?;
            validate_row(&table, &row)?;

            let pk = row[table.pk_index()].clone();
            let key = encode_key(std::slice::from_ref(&pk))?;
            let tree = BTree::table(table.root_page);
            tree.insert(&mut self.pager, &key, &encode_row(&row)?)
                .map_err(|e| match e {
                    Error::Constraint(_) => Error::DuplicateKey(table.name.clone()),
                    other => other,
                })?;

            for index in &indexes {
                add_index_entry(&mut self.pager, &table, index, &row)?;
            }
            inserted += 1;
        }

        Ok(QueryResult::with_affected_rows(
            inserted,
            format!("{} row(s) inserted", inserted),
        ))
    }

    fn execute_update(&mut self, stmt: &UpdateStatement) -> Result<QueryResult> {
        let table = self.catalog.get_table(&stmt.table_name)?.clone();
        let indexes: Vec<_> = self
            .catalog
            .indexes_for_table(&table.name)
            .into_iter()
            .cloned()
            .collect();
        let schema = table_schema(&table);

        // Resolve assignment targets once.
        let mut targets = Vec::with_capacity(stmt.assignments.len());
        for assignment in &stmt.assignments {
            let idx = table
                .column_index(&assignment.column)
                .ok_or_else(|| Error::ColumnNotFound(assignment.column.clone()))?;
            targets.push((idx, &assignment.value));
        }

        let matching = self.collect_matching(&table, &schema, stmt.where_clause.as_ref())?;

        let tree = BTree::table(table.root_page);
        let mut updated = 0;
        for row in matching {
            let mut new_row = row.clone();
            for (idx, expr) in &targets {
                new_row[*idx] = eval_expr(expr, &row, &schema)?;
            }
            validate_row(&table, &new_row)?;

            // Delete-then-reinsert keeps the PK tree and every index
            // consistent even when the primary key itself changes.
            let old_pk = &row[table.pk_index()];
            let old_key = encode_key(std::slice::from_ref(old_pk))?;
            for index in &indexes {
                remove_index_entry(&mut self.pager, &table, index, &row)?;
            }
            tree.delete(&mut self.pager, &old_key)?;

            let new_pk = new_row[table.pk_index()].clone();
            let new_key = encode_key(std::slice::from_ref(&new_pk))?;
            tree.insert(&mut self.pager, &new_key, &encode_row(&new_row)?)
                .map_err(|e| match e {
                    Error::Constraint(_) => Error::DuplicateKey(table.name.clone()),
                    other => other,
                })?;
            for index in &indexes {
                add_index_entry(&mut self.pager, &table, index, &new_row)?;
            }
            updated += 1;
        }

        Ok(QueryResult::with_affected_rows(
            updated,
            format!("{} row(s) updated", updated),
        ))
    }

    fn execute_delete(&mut self, stmt: &DeleteStatement) -> Result<QueryResult> {
        let predicate = stmt.where_clause.as_ref().ok_or_else(|| {
            Error::Syntax("DELETE requires a WHERE clause".to_string())
        })?;

        let table = self.catalog.get_table(&stmt.table_name)?.clone();
        let indexes: Vec<_> = self
            .catalog
            .indexes_for_table(&table.name)
            .into_iter()
            .cloned()
            .collect();
        let schema = table_schema(&table);

        let matching = self.collect_matching(&table, &schema, Some(predicate))?;

        let tree = BTree::table(table.root_page);
        let mut deleted = 0;
        for row in matching {
            for index in &indexes {
                remove_index_entry(&mut self.pager, &table, index, &row)?;
            }
            let pk = &row[table.pk_index()];
            let key = encode_key(std::slice::from_ref(pk))?;
            tree.delete(&mut self.pager, &key)?;
            deleted += 1;
        }

        Ok(QueryResult::with_affected_rows(
            deleted,
            format!("{} row(s) deleted", deleted),
        ))
    }

    /// Scan a table and return the rows matching the optional predicate.
    fn collect_matching(
        &mut self,
        table: &TableDef,
        schema: &[OutCol],
        predicate: Option<&Expr>,
    ) -> Result<Vec<Row>> {
        let tree = BTree::table(table.root_page);
        let mut matching = Vec::new();
        for (_, payload) in tree.scan_all(&mut self.pager)? {
            let row = crate::storage::record::decode_row(&payload)?;
            let keep = match predicate {
                Some(p) => eval_predicate(p, &row, schema)?,
                None => true,
            };
            if keep {
                matching.push(row);
            }
        }
        Ok(matching)
    }

    // ---------- DDL ----------

    fn execute_create_table(&mut self, stmt: &CreateTableStatement) -> Result<QueryResult> {
        let columns: Vec<Column> = stmt
            .columns
            .iter()
            .map(|def| Column {
                name: def.name.clone(),
                data_type: def.data_type,
                nullable: !def.not_null,
                primary_key: def.primary_key,
            })
            .collect();

        self.catalog
            .create_table(&mut self.pager, &stmt.table_name, columns)?;
        Ok(QueryResult::with_message(format!(
            "Table '{}' created",
            stmt.table_name
        )))
    }

    fn execute_create_index(&mut self, stmt: &CreateIndexStatement) -> Result<QueryResult> {
        let index = self
            .catalog
            .create_index(
                &mut self.pager,
                &stmt.index_name,
                &stmt.table_name,
                &stmt.column,
            )?
            .clone();

        // Backfill from existing rows.
        let table = self.catalog.get_table(&stmt.table_name)?.clone();
        let tree = BTree::table(table.root_page);
        let rows: Vec<Row> = tree
            .scan_all(&mut self.pager)?
            .into_iter()
            .map(|(_, payload)| crate::storage::record::decode_row(&payload))
            .collect::<Result<_>>()?;
        for row in &rows {
            add_index_entry(&mut self.pager, &table, &index, row)?;
        }

        Ok(QueryResult::with_message(format!(
            "Index '{}' created on '{}'",
            stmt.index_name, stmt.table_name
        )))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // An open transaction dies with its connection.
        if self.state != TxnState::Idle {
            let _ = self.pager.rollback();
        }
        self.locks.unlock();
    }
}

// ---------- helpers ----------

/// Acquire SHARED, first replaying any hot journal. A journal is hot when
/// its writer is gone (the reserved lock is free); a journal whose writer is
/// alive is left strictly alone.
fn acquire_shared_recovering(locks: &mut LockManager, path: &Path) -> Result<()> {
    for _ in 0..3 {
        locks.acquire_shared()?;
        let journal = crate::storage::journal::journal_path(path);
        if journal.exists() && locks.reserved_lock_is_free() {
            log::info!("hot journal detected, escalating to recover");
            locks.acquire_reserved()?;
            locks.acquire_exclusive()?;
            crate::storage::pager::recover_if_needed(path)?;
            locks.unlock();
            continue;
        }
        return Ok(());
    }
    Ok(())
}

fn table_schema(table: &TableDef) -> Vec<OutCol> {
    table
        .columns
        .iter()
        .map(|c| OutCol {
            table: Some(table.name.clone()),
            name: c.name.clone(),
        })
        .collect()
}

/// Assemble the row for an INSERT, honoring an optional column list.
fn build_insert_row(
    table: &TableDef,
    columns: Option<&[String]>,
    value_exprs: &[Expr],
) -> Result<Row> {
    match columns {
        None => {
            if value_exprs.len() != table.columns.len() {
                return Err(Error::Schema(format!(
                    "table '{}' has {} columns but {} values were supplied",
                    table.name,
                    table.columns.len(),
                    value_exprs.len()
                )));
            }
            value_exprs
                .iter()
                .map(|e| eval_expr(e, &[], &[]))
                .collect()
        }
        Some(cols) => {
            if value_exprs.len() != cols.len() {
                return Err(Error::Schema(format!(
                    "{} columns named but {} values supplied",
                    cols.len(),
                    value_exprs.len()
                )));
            }
            let mut row = vec![Value::Null; table.columns.len()];
            for (name, expr) in cols.iter().zip(value_exprs) {
                let idx = table
                    .column_index(name)
                    .ok_or_else(|| Error::ColumnNotFound(name.clone()))?;
                row[idx] = eval_expr(expr, &[], &[])?;
            }
            Ok(row)
        }
    }
}

/// Type and nullability checks against the table schema.
fn validate_row(table: &TableDef, row: &Row) -> Result<()> {
    for (column, value) in table.columns.iter().zip(row.iter()) {
        if value.is_null() {
            if !column.nullable {
                return Err(Error::NullViolation(column.name.clone()));
            }
            continue;
        }
        if !column.data_type.accepts(value) {
            return Err(Error::Type(format!(
                "column '{}' is {} but value is {}",
                column.name,
                column.data_type,
                value.type_name()
            )));
        }
    }
    Ok(())
}

/// Index entries are `(value, pk)` composite keys with empty payloads; rows
/// with a NULL indexed value are not indexed.
fn add_index_entry(
    pager: &mut Pager,
    table: &TableDef,
    index: &crate::catalog::IndexDef,
    row: &Row,
) -> Result<()> {
    let col_idx = table
        .column_index(&index.column)
        .ok_or_else(|| Error::ColumnNotFound(index.column.clone()))?;
    let value = &row[col_idx];
    if value.is_null() {
        return Ok(());
    }
    let pk = &row[table.pk_index()];
    let key = encode_key(&[value.clone(), pk.clone()])?;
    BTree::index(index.root_page).replace(pager, &key, &[])
}

fn remove_index_entry(
    pager: &mut Pager,
    table: &TableDef,
    index: &crate::catalog::IndexDef,
    row: &Row,
) -> Result<()> {
    let col_idx = table
        .column_index(&index.column)
        .ok_or_else(|| Error::ColumnNotFound(index.column.clone()))?;
    let value = &row[col_idx];
    if value.is_null() {
        return Ok(());
    }
    let pk = &row[table.pk_index()];
    let key = encode_key(&[value.clone(), pk.clone()])?;
    BTree::index(index.root_page).delete(pager, &key)?;
    Ok(())
}

//! Crash recovery: a database reopened after an interrupted transaction must
//! come back as some prefix of the committed transactions, with no journal
//! left behind.
//!
//! Crashes are simulated by copying the database file and its journal to a
//! fresh location while a transaction is still open, then opening the copy:
//! exactly the on-disk state a killed process would leave.

use std::path::{Path, PathBuf};

use pysqlite::{Connection, Value};
use tempfile::TempDir;

fn journal_of(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

/// Copy the db file and journal (if present) into `dir`, returning the new
/// db path.
fn snapshot_crash_image(db: &Path, dir: &Path) -> PathBuf {
    let target = dir.join("crashed.db");
    std::fs::copy(db, &target).unwrap();
    let journal = journal_of(db);
    if journal.exists() {
        std::fs::copy(&journal, journal_of(&target)).unwrap();
    }
    target
}

#[test]
fn uncommitted_transaction_is_invisible_after_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");

    let mut conn = Connection::open(&db).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();

    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (1, 'a')").unwrap();
    conn.execute("INSERT INTO t VALUES (2, 'b')").unwrap();

    // The journal must be on disk while the transaction is open.
    assert!(journal_of(&db).exists());

    // "Kill the process" before COMMIT.
    let crash_dir = TempDir::new().unwrap();
    let crashed = snapshot_crash_image(&db, crash_dir.path());
    drop(conn);

    let mut reopened = Connection::open(&crashed).unwrap();
    let result = reopened.execute("SELECT * FROM t").unwrap();
    assert_eq!(result.rows.len(), 0);
    assert!(
        !journal_of(&crashed).exists(),
        "journal must be gone after recovery"
    );
}

#[test]
fn committed_transactions_survive_a_crash() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");

    let mut conn = Connection::open(&db).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();
    conn.execute("INSERT INTO t VALUES (1, 'one')").unwrap();
    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (2, 'two')").unwrap();
    conn.execute("COMMIT").unwrap();

    // Open a third transaction and crash inside it: the two committed
    // transactions form the surviving prefix.
    conn.execute("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (3, 'three')").unwrap();

    let crash_dir = TempDir::new().unwrap();
    let crashed = snapshot_crash_image(&db, crash_dir.path());
    drop(conn);

    let mut reopened = Connection::open(&crashed).unwrap();
    let result = reopened.execute("SELECT id FROM t ORDER BY id").unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Int(1)], vec![Value::Int(2)]]
    );
}

#[test]
fn uncommitted_ddl_is_rolled_back_on_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");

    let mut conn = Connection::open(&db).unwrap();
    conn.execute("CREATE TABLE keep (id INT PRIMARY KEY)").unwrap();

    conn.execute("BEGIN").unwrap();
    conn.execute("CREATE TABLE doomed (id INT PRIMARY KEY)").unwrap();
    conn.execute("INSERT INTO doomed VALUES (1)").unwrap();

    let crash_dir = TempDir::new().unwrap();
    let crashed = snapshot_crash_image(&db, crash_dir.path());
    drop(conn);

    let mut reopened = Connection::open(&crashed).unwrap();
    assert_eq!(reopened.tables().unwrap(), vec!["keep".to_string()]);
    assert!(reopened.execute("SELECT * FROM doomed").is_err());
}

#[test]
fn crash_during_a_big_mutation_restores_the_old_state() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");

    let mut conn = Connection::open(&db).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();
    // Enough rows to split the tree across several pages.
    for i in 0..200 {
        conn.execute(&format!("INSERT INTO t VALUES ({}, 'row-{:04}')", i, i))
            .unwrap();
    }

    conn.execute("BEGIN").unwrap();
    conn.execute("UPDATE t SET v = 'rewritten' WHERE id >= 0").unwrap();
    conn.execute("DELETE FROM t WHERE id < 100").unwrap();

    let crash_dir = TempDir::new().unwrap();
    let crashed = snapshot_crash_image(&db, crash_dir.path());
    drop(conn);

    let mut reopened = Connection::open(&crashed).unwrap();
    let result = reopened.execute("SELECT * FROM t").unwrap();
    assert_eq!(result.rows.len(), 200);
    let result = reopened
        .execute("SELECT v FROM t WHERE id = 7")
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Str("row-0007".to_string())]]);
}

#[test]
fn connection_drop_rolls_back_open_transaction() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");

    {
        let mut conn = Connection::open(&db).unwrap();
        conn.execute("CREATE TABLE t (id INT PRIMARY KEY)").unwrap();
        conn.execute("BEGIN").unwrap();
        conn.execute("INSERT INTO t VALUES (1)").unwrap();
        // Dropped without COMMIT.
    }

    assert!(!journal_of(&db).exists());
    let mut conn = Connection::open(&db).unwrap();
    let result = conn.execute("SELECT * FROM t").unwrap();
    assert_eq!(result.rows.len(), 0);
}

//! Concurrency through the locking protocol: readers share, a single writer
//! stages behind RESERVED, and EXCLUSIVE waits for readers to drain.
//! Connections here live in one process but hold independent file
//! descriptions, so their locks interact exactly as separate processes do.

use std::time::Duration;

use pysqlite::{Connection, Error, Value};
use tempfile::TempDir;

fn setup() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("test.db");
    let mut conn = Connection::open(&db).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();
    conn.execute("INSERT INTO t VALUES (1, 'seed')").unwrap();
    (dir, db)
}

#[test]
fn writer_blocks_behind_reader_until_it_finishes() {
    let (_dir, db) = setup();
    let mut reader = Connection::open(&db).unwrap();
    let mut writer = Connection::open(&db).unwrap();
    writer.set_busy_timeout(Duration::from_millis(100));

    // Reader holds SHARED for the whole explicit transaction.
    reader.execute("BEGIN").unwrap();
    let result = reader.execute("SELECT * FROM t").unwrap();
    assert_eq!(result.rows.len(), 1);

    // Writer can stage its change (RESERVED) but cannot reach EXCLUSIVE.
    writer.execute("BEGIN").unwrap();
    writer.execute("INSERT INTO t VALUES (2, 'blocked')").unwrap();
    let err = writer.execute("COMMIT").unwrap_err();
    assert!(err.is_busy());

    // The reader still sees the old state.
    let result = reader.execute("SELECT * FROM t").unwrap();
    assert_eq!(result.rows.len(), 1);

    // Reader finishes; the writer's COMMIT now goes through.
    reader.execute("COMMIT").unwrap();
    writer.execute("COMMIT").unwrap();

    // The reader's next statement observes the new row.
    let result = reader.execute("SELECT id FROM t WHERE v = 'blocked'").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(2)]]);
}

#[test]
fn only_one_writer_can_reserve() {
    let (_dir, db) = setup();
    let mut first = Connection::open(&db).unwrap();
    let mut second = Connection::open(&db).unwrap();
    second.set_busy_timeout(Duration::from_millis(100));

    first.execute("BEGIN").unwrap();
    first.execute("INSERT INTO t VALUES (2, 'first')").unwrap();

    second.execute("BEGIN").unwrap();
    let err = second
        .execute("INSERT INTO t VALUES (3, 'second')")
        .unwrap_err();
    assert!(err.is_busy());

    // BUSY did not abort second's transaction, but second still holds
    // SHARED, which would block first's COMMIT; second gives way.
    second.execute("ROLLBACK").unwrap();
    first.execute("COMMIT").unwrap();

    second.execute("BEGIN").unwrap();
    second.execute("INSERT INTO t VALUES (3, 'second')").unwrap();
    second.execute("COMMIT").unwrap();

    let mut check = Connection::open(&db).unwrap();
    let result = check.execute("SELECT COUNT(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(3)]]);
}

#[test]
fn readers_do_not_block_each_other() {
    let (_dir, db) = setup();
    let mut a = Connection::open(&db).unwrap();
    let mut b = Connection::open(&db).unwrap();

    a.execute("BEGIN").unwrap();
    b.execute("BEGIN").unwrap();
    assert_eq!(a.execute("SELECT * FROM t").unwrap().rows.len(), 1);
    assert_eq!(b.execute("SELECT * FROM t").unwrap().rows.len(), 1);
    a.execute("COMMIT").unwrap();
    b.execute("COMMIT").unwrap();
}

#[test]
fn auto_commit_writer_retries_after_reader_leaves() {
    let (_dir, db) = setup();
    let mut reader = Connection::open(&db).unwrap();
    let mut writer = Connection::open(&db).unwrap();
    writer.set_busy_timeout(Duration::from_millis(100));

    reader.execute("BEGIN").unwrap();
    reader.execute("SELECT * FROM t").unwrap();

    // Auto-commit write cannot complete while the reader holds SHARED, and
    // must leave no trace behind.
    let err = writer.execute("INSERT INTO t VALUES (2, 'x')").unwrap_err();
    assert!(err.is_busy());

    reader.execute("COMMIT").unwrap();
    writer.execute("INSERT INTO t VALUES (2, 'x')").unwrap();

    let result = writer.execute("SELECT COUNT(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(2)]]);
}

#[test]
fn schema_changes_propagate_to_other_connections() {
    let (_dir, db) = setup();
    let mut a = Connection::open(&db).unwrap();
    let mut b = Connection::open(&db).unwrap();

    // b has loaded the catalog; a then creates a new table.
    assert_eq!(b.tables().unwrap(), vec!["t".to_string()]);
    a.execute("CREATE TABLE extra (id INT PRIMARY KEY)").unwrap();

    // b picks up the schema change on its next lock acquisition.
    assert_eq!(
        b.tables().unwrap(),
        vec!["extra".to_string(), "t".to_string()]
    );
    b.execute("INSERT INTO extra VALUES (1)").unwrap();
}

#[test]
fn open_coexists_with_a_staging_writer() {
    // Opening a healthy database only needs SHARED, so it succeeds while a
    // writer is staging changes; a second write attempt reports BUSY.
    let (_dir, db) = setup();

    let mut writer = Connection::open(&db).unwrap();
    writer.execute("BEGIN").unwrap();
    writer.execute("INSERT INTO t VALUES (2, 'x')").unwrap();

    let mut other = Connection::open(&db).unwrap();
    other.set_busy_timeout(Duration::from_millis(50));
    let err = other.execute("DELETE FROM t WHERE id = 1").unwrap_err();
    assert!(matches!(err, Error::Busy));

    // And the staging writer's uncommitted row is invisible to others.
    let result = other.execute("SELECT COUNT(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Int(1)]]);
    drop(writer);
}

//! End-to-end SQL behavior through the public connection API: joins,
//! aggregation, CTEs, index-backed lookups, and auto-commit atomicity.

use pysqlite::{Connection, Value};
use tempfile::TempDir;

fn conn_with_employees() -> (TempDir, Connection) {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute(
        "CREATE TABLE employees (
            id INT PRIMARY KEY,
            name STR,
            role STR,
            salary INT,
            dept_id INT
        )",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO employees VALUES
            (1, 'a', 'E', 100, 10),
            (2, 'b', 'E', 200, 10),
            (3, 'c', 'M', 300, 20)",
    )
    .unwrap();
    (dir, conn)
}

fn int(i: i64) -> Value {
    Value::Int(i)
}

fn s(v: &str) -> Value {
    Value::Str(v.to_string())
}

#[test]
fn filter_and_order_by() {
    let (_dir, mut conn) = conn_with_employees();
    let result = conn
        .execute("SELECT name, salary FROM employees WHERE salary >= 200 ORDER BY salary DESC")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![s("c"), int(300)], vec![s("b"), int(200)]]
    );
}

#[test]
fn index_backed_equality_lookup() {
    let (_dir, mut conn) = conn_with_employees();
    conn.execute("CREATE INDEX idx_role ON employees (role)").unwrap();

    let result = conn
        .execute("SELECT name FROM employees WHERE role = 'E' ORDER BY name")
        .unwrap();
    assert_eq!(result.rows, vec![vec![s("a")], vec![s("b")]]);

    // Range comparison through the same index.
    let result = conn
        .execute("SELECT name FROM employees WHERE role > 'E'")
        .unwrap();
    assert_eq!(result.rows, vec![vec![s("c")]]);

    // Index stays correct across updates and deletes.
    conn.execute("UPDATE employees SET role = 'M' WHERE id = 1").unwrap();
    conn.execute("DELETE FROM employees WHERE id = 2").unwrap();
    let result = conn
        .execute("SELECT name FROM employees WHERE role = 'M' ORDER BY name")
        .unwrap();
    assert_eq!(result.rows, vec![vec![s("a")], vec![s("c")]]);
    let result = conn
        .execute("SELECT name FROM employees WHERE role = 'E'")
        .unwrap();
    assert!(result.rows.is_empty());
}

#[test]
fn left_join_pads_missing_rows_with_nulls() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE employees (id INT PRIMARY KEY, name STR, dept_id INT)")
        .unwrap();
    conn.execute("CREATE TABLE departments (dept_id INT PRIMARY KEY, name STR)")
        .unwrap();
    conn.execute("INSERT INTO employees VALUES (1, 'Alice', 10), (2, 'Bob', NULL)")
        .unwrap();
    conn.execute("INSERT INTO departments VALUES (10, 'Eng')").unwrap();

    // Rows come back in the left table's primary-key order.
    let result = conn
        .execute(
            "SELECT e.name, d.name FROM employees e \
             LEFT JOIN departments d ON e.dept_id = d.dept_id",
        )
        .unwrap();
    assert_eq!(result.columns, vec!["e.name", "d.name"]);
    assert_eq!(
        result.rows,
        vec![vec![s("Alice"), s("Eng")], vec![s("Bob"), Value::Null]]
    );
}

#[test]
fn inner_join_drops_unmatched_rows() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE a (id INT PRIMARY KEY, v INT)").unwrap();
    conn.execute("CREATE TABLE b (id INT PRIMARY KEY, v INT)").unwrap();
    conn.execute("INSERT INTO a VALUES (1, 10), (2, 20)").unwrap();
    conn.execute("INSERT INTO b VALUES (7, 10), (8, 10), (9, 30)").unwrap();

    let result = conn
        .execute("SELECT a.id, b.id FROM a INNER JOIN b ON a.v = b.v ORDER BY b.id")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![int(1), int(7)], vec![int(1), int(8)]]
    );
}

#[test]
fn group_by_with_count_and_avg() {
    let (_dir, mut conn) = conn_with_employees();
    let result = conn
        .execute(
            "SELECT dept_id, COUNT(*), AVG(salary) FROM employees \
             GROUP BY dept_id ORDER BY dept_id",
        )
        .unwrap();
    assert_eq!(result.columns, vec!["dept_id", "COUNT(*)", "AVG(salary)"]);
    assert_eq!(
        result.rows,
        vec![
            vec![int(10), int(2), Value::Float(150.0)],
            vec![int(20), int(1), Value::Float(300.0)],
        ]
    );
}

#[test]
fn aggregates_skip_nulls_and_count_star_does_not() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
    conn.execute("INSERT INTO t VALUES (1, 10), (2, NULL), (3, 20)").unwrap();

    let result = conn
        .execute("SELECT COUNT(*), COUNT(v), SUM(v), MIN(v), MAX(v) FROM t")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![int(3), int(2), int(30), int(10), int(20)]]
    );
}

#[test]
fn avg_of_empty_group_is_null() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();

    let result = conn.execute("SELECT AVG(v), COUNT(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Null, int(0)]]);
}

#[test]
fn cte_is_materialized_and_queryable() {
    let (_dir, mut conn) = conn_with_employees();
    let result = conn
        .execute(
            "WITH hi AS (SELECT name, salary FROM employees WHERE salary > 150) \
             SELECT name FROM hi ORDER BY name",
        )
        .unwrap();
    assert_eq!(result.rows, vec![vec![s("b")], vec![s("c")]]);
}

#[test]
fn chained_ctes_see_earlier_ones() {
    let (_dir, mut conn) = conn_with_employees();
    let result = conn
        .execute(
            "WITH hi AS (SELECT name, salary FROM employees WHERE salary > 100), \
                  top AS (SELECT name FROM hi WHERE salary > 200) \
             SELECT name FROM top",
        )
        .unwrap();
    assert_eq!(result.rows, vec![vec![s("c")]]);
}

#[test]
fn aggregate_over_cte() {
    let (_dir, mut conn) = conn_with_employees();
    let result = conn
        .execute(
            "WITH hi AS (SELECT salary FROM employees WHERE salary > 100) \
             SELECT COUNT(*), SUM(salary) FROM hi",
        )
        .unwrap();
    assert_eq!(result.rows, vec![vec![int(2), int(500)]]);
}

#[test]
fn projection_aliases_name_output_columns() {
    let (_dir, mut conn) = conn_with_employees();
    let result = conn
        .execute("SELECT name AS who, salary AS pay FROM employees WHERE id = 1")
        .unwrap();
    assert_eq!(result.columns, vec!["who", "pay"]);
    assert_eq!(result.rows, vec![vec![s("a"), int(100)]]);
}

#[test]
fn comparison_of_int_and_str_is_a_type_error() {
    let (_dir, mut conn) = conn_with_employees();
    let err = conn
        .execute("SELECT * FROM employees WHERE salary < 'abc'")
        .unwrap_err();
    assert!(matches!(err, pysqlite::Error::TypeMismatch(_, _)));
}

#[test]
fn null_comparisons_never_match() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
    conn.execute("INSERT INTO t VALUES (1, NULL), (2, 5)").unwrap();

    let result = conn.execute("SELECT id FROM t WHERE v = 5").unwrap();
    assert_eq!(result.rows, vec![vec![int(2)]]);
    let result = conn.execute("SELECT id FROM t WHERE v != 5").unwrap();
    assert!(result.rows.is_empty());
}

#[test]
fn auto_commit_statement_is_atomic() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();
    conn.execute("INSERT INTO t VALUES (5, 'existing')").unwrap();

    // Multi-row insert fails on its third row; nothing may stick.
    let err = conn
        .execute("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (5, 'dup')")
        .unwrap_err();
    assert!(matches!(err, pysqlite::Error::DuplicateKey(_)));

    let result = conn.execute("SELECT id FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![int(5)]]);
}

#[test]
fn many_rows_roundtrip_through_splits() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();

    conn.execute("BEGIN").unwrap();
    for i in 0..500 {
        conn.execute(&format!("INSERT INTO t VALUES ({}, 'value-{:05}')", i, i))
            .unwrap();
    }
    conn.execute("COMMIT").unwrap();

    let result = conn.execute("SELECT COUNT(*) FROM t").unwrap();
    assert_eq!(result.rows, vec![vec![int(500)]]);

    // Rows come back in primary-key order from the table tree.
    let result = conn
        .execute("SELECT id FROM t WHERE id >= 495")
        .unwrap();
    let ids: Vec<Value> = result.rows.into_iter().map(|mut r| r.remove(0)).collect();
    assert_eq!(ids, vec![int(495), int(496), int(497), int(498), int(499)]);
}

#[test]
fn string_escapes_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut conn = Connection::open(dir.path().join("test.db")).unwrap();
    conn.execute("CREATE TABLE t (id INT PRIMARY KEY, v STR)").unwrap();
    conn.execute("INSERT INTO t VALUES (1, 'it''s here')").unwrap();
    let result = conn.execute("SELECT v FROM t WHERE id = 1").unwrap();
    assert_eq!(result.rows, vec![vec![s("it's here")]]);
}

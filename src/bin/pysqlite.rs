//! pysqlite - interactive REPL
//!
//! `pysqlite <dbfile>` opens a line-oriented shell over one database file.
//! Statements end at `;`; meta-commands begin with `.`. Exit codes:
//! 0 normal, 1 unrecoverable engine error, 2 usage error.

use std::path::PathBuf;
use std::process::ExitCode;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use pysqlite::{Connection, Error, QueryResult, Value};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let db_path = match (args.next(), args.next()) {
        (Some(path), None) => PathBuf::from(path),
        _ => {
            eprintln!("usage: pysqlite <dbfile>");
            return ExitCode::from(2);
        }
    };

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Error: cannot open '{}': {}", db_path.display(), e);
            return ExitCode::from(1);
        }
    };

    match run_repl(conn) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}

fn run_repl(mut conn: Connection) -> Result<(), Error> {
    let mut editor = DefaultEditor::new()
        .map_err(|e| Error::Internal(format!("cannot initialize line editor: {}", e)))?;

    let history_file = conn
        .path()
        .parent()
        .map(|dir| dir.join(".pysqlite_history"));
    if let Some(path) = &history_file {
        let _ = editor.load_history(path);
    }

    println!("pysqlite version {}", VERSION);
    println!(
        "Connected to database at '{}'.",
        conn.path()
            .canonicalize()
            .unwrap_or_else(|_| conn.path().to_path_buf())
            .display()
    );
    println!("Enter '.exit' to quit or '.tables' to list tables.");

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() {
            "pysqlite> "
        } else {
            "     ...> "
        };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Meta-commands only at the start of a statement.
        if buffer.is_empty() && trimmed.starts_with('.') {
            let _ = editor.add_history_entry(trimmed);
            match trimmed {
                ".exit" => break,
                ".tables" => match conn.tables() {
                    Ok(tables) => {
                        if tables.is_empty() {
                            println!("(no tables found)");
                        } else {
                            for name in tables {
                                println!("{}", name);
                            }
                        }
                    }
                    Err(e) => eprintln!("Error: {}", e),
                },
                other => {
                    eprintln!("Unknown command: {}", other);
                    eprintln!("Available commands: .exit, .tables");
                }
            }
            continue;
        }

        buffer.push_str(&line);
        buffer.push('\n');

        // A statement ends at ';'.
        if !trimmed.ends_with(';') {
            continue;
        }
        let sql = std::mem::take(&mut buffer);
        let _ = editor.add_history_entry(sql.trim());

        match conn.execute(&sql) {
            Ok(result) => print_result(&result),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    if let Some(path) = &history_file {
        let _ = editor.save_history(path);
    }
    println!("Exiting pysqlite. Goodbye!");
    Ok(())
}

fn print_result(result: &QueryResult) {
    if let Some(message) = &result.message {
        println!("{}", message);
        return;
    }
    if result.columns.is_empty() {
        return;
    }
    print!("{}", format_table(&result.columns, &result.rows));
}

/// Render rows as a bordered table.
fn format_table(columns: &[String], rows: &[Vec<Value>]) -> String {
    if rows.is_empty() {
        return "(no rows)\n".to_string();
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }
    }

    let separator: String = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut output = String::new();
    output.push_str(&separator);
    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<_>>()
        .join("|");
    output.push_str(&format!("|{}|\n", header));
    output.push_str(&separator);

    for row in rows {
        let line: String = row
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v.to_string(), width = *w))
            .collect::<Vec<_>>()
            .join("|");
        output.push_str(&format!("|{}|\n", line));
    }
    output.push_str(&separator);
    output.push_str(&format!("{} row(s) returned\n", rows.len()));
    output
}

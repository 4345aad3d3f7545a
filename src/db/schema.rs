//! Idempotent schema bootstrap.
//!
//! Existence is checked per required table rather than through a marker row, so a
//! partial schema left by a crashed initializer is detected and completed. All DDL
//! must be guarded (`IF NOT EXISTS`) so applying it twice changes nothing.
//!
//! # Architecture
//!
//! Existence queries are organized in the `queries` submodule per database type,
//! adapted to each backend's system catalog.

use crate::db::pool::InitConnection;
use crate::dispatch;
use crate::error::{DbError, DbResult};
use sqlx::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

mod queries {
    /// `to_regclass` parses its argument as an identifier, so unquoted names fold
    /// to lowercase and schema qualifiers resolve exactly as in CREATE TABLE.
    pub const POSTGRES_TABLE_EXISTS: &str = "SELECT to_regclass($1) IS NOT NULL";

    pub const MYSQL_TABLE_EXISTS: &str = r#"
        SELECT COUNT(*) FROM information_schema.tables
        WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?
        "#;

    pub const SQLITE_TABLE_EXISTS: &str =
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE";
}

/// A required table and the guarded statement that creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub create_sql: String,
}

impl TableDef {
    /// The identifier the CREATE statement uses, falling back to `name`.
    fn ident(&self) -> TableIdent {
        guarded_table_ident(&self.create_sql).unwrap_or_else(|| TableIdent {
            parts: vec![IdentPart {
                text: self.name.clone(),
                quoted: false,
            }],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IdentPart {
    text: String,
    quoted: bool,
}

/// A possibly schema-qualified table identifier, quoting preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableIdent {
    parts: Vec<IdentPart>,
}

impl TableIdent {
    fn bare(&self) -> &str {
        self.parts.last().map(|p| p.text.as_str()).unwrap_or_default()
    }

    fn qualifier(&self) -> Option<&str> {
        let n = self.parts.len();
        (n >= 2).then(|| self.parts[n - 2].text.as_str())
    }

    /// Identifier text for `to_regclass`. Quoted parts stay quoted so their case
    /// is kept; unquoted parts are left for Postgres to fold.
    fn postgres_regclass(&self) -> String {
        self.parts
            .iter()
            .map(|p| {
                if p.quoted {
                    format!("\"{}\"", p.text.replace('"', "\"\""))
                } else {
                    p.text.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// The tables (and indexes) a service needs before it can serve traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDefinition {
    tables: Vec<TableDef>,
    indexes: Vec<String>,
}

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required table. `create_sql` must be a guarded CREATE TABLE.
    pub fn table(mut self, name: impl Into<String>, create_sql: impl Into<String>) -> Self {
        self.tables.push(TableDef {
            name: name.into(),
            create_sql: create_sql.into(),
        });
        self
    }

    /// Add a guarded index statement, applied after all tables.
    pub fn index(mut self, create_sql: impl Into<String>) -> Self {
        self.indexes.push(create_sql.into());
        self
    }

    /// Parse a SQL script of `;`-separated guarded statements.
    ///
    /// Each `CREATE TABLE IF NOT EXISTS <name>` declares a required table. Other
    /// guarded statements (indexes) are kept in order. `--` and `/* */` comments
    /// are stripped; quoted text is kept verbatim.
    pub fn from_sql(script: &str) -> DbResult<Self> {
        let mut definition = Self::new();
        for statement in split_statements(script)? {
            match guarded_table_name(&statement) {
                Some(name) => definition = definition.table(name, statement),
                None => definition = definition.index(statement),
            }
        }
        definition.validate()?;
        Ok(definition)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let script = std::fs::read_to_string(path).map_err(|e| {
            DbError::invalid_config(format!("cannot read schema {}: {}", path.display(), e))
        })?;
        Self::from_sql(&script)
    }

    /// Reject unguarded DDL and empty table names.
    pub fn validate(&self) -> DbResult<()> {
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(DbError::invalid_config("table name must not be empty"));
            }
            if guarded_table_name(&table.create_sql).is_none() {
                return Err(DbError::invalid_config(format!(
                    "table '{}' must be created with CREATE TABLE IF NOT EXISTS",
                    table.name
                )));
            }
        }
        for statement in &self.indexes {
            let normalized = normalize(statement);
            if !normalized.starts_with("CREATE") || !normalized.contains(" IF NOT EXISTS ") {
                return Err(DbError::invalid_config(format!(
                    "statement must be a guarded CREATE ... IF NOT EXISTS: {}",
                    statement
                )));
            }
        }
        Ok(())
    }

    pub fn required_tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// All statements in application order: tables first, then indexes.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .map(|t| t.create_sql.as_str())
            .chain(self.indexes.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.indexes.is_empty()
    }
}

/// Uppercased, whitespace-collapsed copy used for keyword matching.
fn normalize(statement: &str) -> String {
    let mut normalized = statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    normalized.push(' ');
    normalized
}

/// Split a script into trimmed statements on `;` outside quotes and comments.
fn split_statements(script: &str) -> DbResult<Vec<String>> {
    fn flush(current: &mut String, statements: &mut Vec<String>) {
        let statement = current.trim();
        if !statement.is_empty() {
            statements.push(statement.to_string());
        }
        current.clear();
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            current.push(c);
            // A doubled quote closes and immediately reopens, which keeps it literal.
            if c == open {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        closed = true;
                        break;
                    }
                    prev = skipped;
                }
                if !closed {
                    return Err(DbError::invalid_config(
                        "unterminated /* comment in schema script",
                    ));
                }
                current.push(' ');
            }
            ';' => flush(&mut current, &mut statements),
            _ => current.push(c),
        }
    }

    if let Some(open) = quote {
        return Err(DbError::invalid_config(format!(
            "unterminated {open} quote in schema script"
        )));
    }
    flush(&mut current, &mut statements);
    Ok(statements)
}

/// Identifier from `CREATE TABLE IF NOT EXISTS <ident>`. None if the statement is
/// not a guarded CREATE TABLE.
fn guarded_table_ident(statement: &str) -> Option<TableIdent> {
    const PREFIX: [&str; 5] = ["CREATE", "TABLE", "IF", "NOT", "EXISTS"];

    let mut rest = statement;
    for keyword in PREFIX {
        rest = rest.trim_start();
        let end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        if !rest[..end].eq_ignore_ascii_case(keyword) {
            return None;
        }
        rest = &rest[end..];
    }

    let mut rest = rest.trim_start();
    let mut parts = Vec::new();
    loop {
        let part = match rest.chars().next()? {
            open @ ('"' | '`' | '[') => {
                let close = if open == '[' { ']' } else { open };
                let body = &rest[open.len_utf8()..];
                let end = body.find(close)?;
                rest = &body[end + close.len_utf8()..];
                IdentPart {
                    text: body[..end].to_string(),
                    quoted: true,
                }
            }
            _ => {
                let end = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                    .unwrap_or(rest.len());
                let text = rest[..end].to_string();
                rest = &rest[end..];
                IdentPart {
                    text,
                    quoted: false,
                }
            }
        };
        if part.text.is_empty() {
            return None;
        }
        parts.push(part);
        match rest.strip_prefix('.') {
            Some(next) => rest = next,
            None => break,
        }
    }
    Some(TableIdent { parts })
}

/// Bare table name (no quotes, no schema qualifier) of a guarded CREATE TABLE.
fn guarded_table_name(statement: &str) -> Option<String> {
    guarded_table_ident(statement).map(|ident| ident.bare().to_string())
}

/// Applies and verifies a [`SchemaDefinition`].
#[derive(Debug)]
pub struct SchemaBootstrapper {
    definition: SchemaDefinition,
    runs: AtomicUsize,
}

impl SchemaBootstrapper {
    pub fn new(definition: SchemaDefinition) -> Self {
        Self {
            definition,
            runs: AtomicUsize::new(0),
        }
    }

    /// Number of successful `bootstrap()` executions by this instance.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    /// True when every required table exists.
    pub async fn schema_exists(&self, conn: &mut InitConnection) -> DbResult<bool> {
        Ok(self.missing_tables(conn).await?.is_empty())
    }

    /// Required tables that do not exist yet, in definition order.
    pub async fn missing_tables(&self, conn: &mut InitConnection) -> DbResult<Vec<String>> {
        let mut missing = Vec::new();
        for table in &self.definition.tables {
            if !table_exists(conn, &table.ident()).await? {
                missing.push(table.name.clone());
            }
        }
        Ok(missing)
    }

    /// Apply every statement in one transaction.
    ///
    /// Any failure rolls the transaction back. MySQL commits DDL implicitly, so
    /// there a failure can leave earlier tables behind; the guarded statements
    /// make the next attempt complete them.
    pub async fn bootstrap(&self, conn: &mut InitConnection) -> DbResult<()> {
        info!(
            tables = self.definition.tables.len(),
            indexes = self.definition.indexes.len(),
            "Applying schema"
        );
        dispatch!(InitConnection, conn, c => {
            let mut tx = c.begin().await?;
            for statement in self.definition.statements() {
                if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                    rollback_quietly(tx.rollback().await);
                    return Err(ddl_error(e, statement));
                }
            }
            tx.commit().await?;
        });

        let runs = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        info!(runs, "Schema applied");
        Ok(())
    }

    /// Re-check every required table. Returns the missing ones.
    pub async fn validate(&self, conn: &mut InitConnection) -> DbResult<Vec<String>> {
        let missing = self.missing_tables(conn).await?;
        if missing.is_empty() {
            debug!("Schema validated");
        } else {
            warn!(missing = ?missing, "Schema validation found missing tables");
        }
        Ok(missing)
    }
}

async fn table_exists(conn: &mut InitConnection, table: &TableIdent) -> DbResult<bool> {
    let exists = match conn {
        InitConnection::Postgres(c) => {
            sqlx::query_scalar::<_, bool>(queries::POSTGRES_TABLE_EXISTS)
                .bind(table.postgres_regclass())
                .fetch_one(&mut *c)
                .await?
        }
        InitConnection::MySql(c) => {
            sqlx::query_scalar::<_, i64>(queries::MYSQL_TABLE_EXISTS)
                .bind(table.qualifier())
                .bind(table.bare())
                .fetch_one(&mut *c)
                .await?
                > 0
        }
        InitConnection::SQLite(c) => {
            sqlx::query_scalar::<_, i64>(queries::SQLITE_TABLE_EXISTS)
                .bind(table.bare())
                .fetch_one(&mut *c)
                .await?
                > 0
        }
    };
    Ok(exists)
}

fn ddl_error(err: sqlx::Error, statement: &str) -> DbError {
    DbError::schema_bootstrap(err.to_string(), Some(statement))
}

fn rollback_quietly(result: Result<(), sqlx::Error>) {
    if let Err(e) = result {
        warn!(error = %e, "Rollback after failed DDL also failed");
    }
}

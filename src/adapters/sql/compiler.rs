//! Statement to SQL compilation and native-query shape detection.

use super::macros::DatabaseType;
use crate::driver::CompiledStatement;
use crate::error::{DatastoreError, DsResult};
use crate::models::{ColumnSpec, Comparison, Predicate, QueryType, Record, StatementAst, TableSpec};
use serde_json::Value;
use sqlparser::ast::Statement as SqlStatement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Alias of the `count` result column.
pub const COUNT_ALIAS: &str = "numRecords";

fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySql => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Whether running `sql` produces a row set rather than an affected count.
/// Multi-statement text is judged by its last statement.
pub fn returns_rows(sql: &str, db_type: DatabaseType) -> bool {
    let dialect = get_dialect(db_type);
    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => statements
            .last()
            .is_some_and(|stmt| statement_returns_rows(stmt, sql)),
        Err(_) => keyword_returns_rows(sql),
    }
}

fn statement_returns_rows(stmt: &SqlStatement, sql: &str) -> bool {
    match stmt {
        SqlStatement::Query(_)
        | SqlStatement::ShowTables { .. }
        | SqlStatement::ShowColumns { .. }
        | SqlStatement::ShowDatabases { .. }
        | SqlStatement::ShowCreate { .. }
        | SqlStatement::ShowVariables { .. }
        | SqlStatement::ShowStatus { .. }
        | SqlStatement::ExplainTable { .. }
        | SqlStatement::Explain { .. }
        | SqlStatement::Pragma { .. } => true,
        SqlStatement::Insert(_) | SqlStatement::Update { .. } | SqlStatement::Delete(_) => {
            has_returning(sql)
        }
        _ => false,
    }
}

fn has_returning(sql: &str) -> bool {
    sql.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| word.eq_ignore_ascii_case("returning"))
}

/// Fallback for text the parser does not understand.
fn keyword_returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "VALUES" | "DESCRIBE" | "DESC"
    ) || has_returning(sql)
}

/// Accumulates SQL text and the values it binds.
struct SqlBuilder {
    db: DatabaseType,
    sql: String,
    values: Vec<Value>,
}

impl SqlBuilder {
    fn new(db: DatabaseType) -> Self {
        Self {
            db,
            sql: String::new(),
            values: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    fn push_ident(&mut self, ident: &str) -> &mut Self {
        let quoted = quote_ident(ident, self.db);
        self.sql.push_str(&quoted);
        self
    }

    /// Bind a scalar and return its placeholder.
    fn placeholder(&mut self, value: &Value, column: &str) -> DsResult<String> {
        if value.is_object() || value.is_array() {
            return Err(DatastoreError::unsupported_construct(format!(
                "cannot compare `{}` against a nested object or array",
                column
            )));
        }
        Ok(self.bind(value.clone()))
    }

    fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        match self.db {
            DatabaseType::Postgres => format!("${}", self.values.len()),
            DatabaseType::MySql | DatabaseType::SQLite => "?".to_string(),
        }
    }

    fn push_where(&mut self, predicate: Option<&Predicate>) -> DsResult<()> {
        if let Some(predicate) = predicate {
            let clause = self.predicate(predicate)?;
            self.push(" WHERE ").push(&clause);
        }
        Ok(())
    }

    fn predicate(&mut self, predicate: &Predicate) -> DsResult<String> {
        match predicate {
            Predicate::And(parts) if parts.is_empty() => Ok("1 = 1".to_string()),
            Predicate::Or(parts) if parts.is_empty() => Ok("1 = 0".to_string()),
            Predicate::And(parts) => self.join(parts, " AND "),
            Predicate::Or(parts) => self.join(parts, " OR "),
            Predicate::Compare { column, op, value } => self.compare(column, *op, value),
        }
    }

    fn join(&mut self, parts: &[Predicate], separator: &str) -> DsResult<String> {
        let clauses = parts
            .iter()
            .map(|p| self.predicate(p))
            .collect::<DsResult<Vec<_>>>()?;
        Ok(format!("({})", clauses.join(separator)))
    }

    /// Null never equals anything in SQL; `!=` and `nin` also keep null rows
    /// so results agree with the in-memory evaluator.
    fn compare(&mut self, column: &str, op: Comparison, value: &Value) -> DsResult<String> {
        let col = quote_ident(column, self.db);
        let sql = match op {
            Comparison::Eq if value.is_null() => format!("{} IS NULL", col),
            Comparison::Ne if value.is_null() => format!("{} IS NOT NULL", col),
            Comparison::Eq => format!("{} = {}", col, self.placeholder(value, column)?),
            Comparison::Ne => format!(
                "({} <> {} OR {} IS NULL)",
                col,
                self.placeholder(value, column)?,
                col
            ),
            Comparison::Lt => format!("{} < {}", col, self.placeholder(value, column)?),
            Comparison::Lte => format!("{} <= {}", col, self.placeholder(value, column)?),
            Comparison::Gt => format!("{} > {}", col, self.placeholder(value, column)?),
            Comparison::Gte => format!("{} >= {}", col, self.placeholder(value, column)?),
            Comparison::In | Comparison::Nin => {
                let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
                if items.is_empty() {
                    return Ok(if op == Comparison::In { "1 = 0" } else { "1 = 1" }.to_string());
                }
                let placeholders = items
                    .iter()
                    .map(|item| self.placeholder(item, column))
                    .collect::<DsResult<Vec<_>>>()?
                    .join(", ");
                if op == Comparison::In {
                    format!("{} IN ({})", col, placeholders)
                } else {
                    format!("({} NOT IN ({}) OR {} IS NULL)", col, placeholders, col)
                }
            }
            Comparison::Like => {
                let keyword = match self.db {
                    DatabaseType::Postgres => "ILIKE",
                    DatabaseType::MySql | DatabaseType::SQLite => "LIKE",
                };
                format!("{} {} {}", col, keyword, self.placeholder(value, column)?)
            }
        };
        Ok(sql)
    }

    fn push_order_and_page(&mut self, ast: &StatementAst) {
        if !ast.sort.is_empty() {
            let terms: Vec<String> = ast
                .sort
                .iter()
                .map(|t| {
                    format!(
                        "{} {}",
                        quote_ident(&t.column, self.db),
                        if t.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            self.push(" ORDER BY ").push(&terms.join(", "));
        }

        match (ast.limit, ast.skip) {
            (Some(limit), skip) => {
                self.push(&format!(" LIMIT {}", limit));
                if let Some(skip) = skip {
                    self.push(&format!(" OFFSET {}", skip));
                }
            }
            // OFFSET alone is not valid everywhere.
            (None, Some(skip)) => {
                let text = match self.db {
                    DatabaseType::SQLite => format!(" LIMIT -1 OFFSET {}", skip),
                    DatabaseType::MySql => format!(" LIMIT {} OFFSET {}", u64::MAX, skip),
                    DatabaseType::Postgres => format!(" OFFSET {}", skip),
                };
                self.push(&text);
            }
            (None, None) => {}
        }
    }

    fn finish(self) -> CompiledStatement {
        CompiledStatement::new(self.sql, self.values)
    }
}

/// Quote an identifier for `db`, doubling any embedded quote character.
pub fn quote_ident(ident: &str, db: DatabaseType) -> String {
    match db {
        DatabaseType::MySql => format!("`{}`", ident.replace('`', "``")),
        DatabaseType::Postgres | DatabaseType::SQLite => {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }
    }
}

/// Compile a parsed statement into parameterized SQL.
pub fn compile(ast: &StatementAst, db: DatabaseType) -> DsResult<CompiledStatement> {
    let mut b = SqlBuilder::new(db);

    match ast.query_type {
        QueryType::Select => {
            b.push("SELECT ");
            match &ast.columns {
                None => {
                    b.push("*");
                }
                Some(columns) => {
                    let list: Vec<String> = columns.iter().map(|c| quote_ident(c, db)).collect();
                    b.push(&list.join(", "));
                }
            }
            b.push(" FROM ").push_ident(&ast.table);
            b.push_where(ast.predicate.as_ref())?;
            b.push_order_and_page(ast);
        }
        QueryType::Insert => return insert(db, &ast.table, &ast.records, None),
        QueryType::Update => {
            b.push("UPDATE ").push_ident(&ast.table).push(" SET ");
            let mut assignments = Vec::with_capacity(ast.values.len());
            for (column, value) in &ast.values {
                let placeholder = b.bind(value.clone());
                assignments.push(format!("{} = {}", quote_ident(column, db), placeholder));
            }
            b.push(&assignments.join(", "));
            b.push_where(ast.predicate.as_ref())?;
        }
        QueryType::Delete => {
            b.push("DELETE FROM ").push_ident(&ast.table);
            b.push_where(ast.predicate.as_ref())?;
        }
        QueryType::Count => {
            b.push("SELECT COUNT(*) AS ")
                .push_ident(COUNT_ALIAS)
                .push(" FROM ")
                .push_ident(&ast.table);
            b.push_where(ast.predicate.as_ref())?;
        }
        QueryType::Sum | QueryType::Avg => {
            let column = ast.aggregate.as_deref().ok_or_else(|| {
                DatastoreError::malformed_statement("aggregate column is missing")
            })?;
            let function = if ast.query_type == QueryType::Sum { "SUM" } else { "AVG" };
            b.push(&format!("SELECT {}(", function))
                .push_ident(column)
                .push(") AS ")
                .push_ident(ast.query_type.as_str())
                .push(" FROM ")
                .push_ident(&ast.table);
            b.push_where(ast.predicate.as_ref())?;
        }
    }

    Ok(b.finish())
}

/// Multi-row insert over the union of the records' columns, or of `columns`
/// when given. Columns a record lacks take the column default.
pub fn insert(
    db: DatabaseType,
    table: &str,
    records: &[Record],
    columns: Option<&[String]>,
) -> DsResult<CompiledStatement> {
    if records.is_empty() {
        return Err(DatastoreError::malformed_statement("nothing to insert"));
    }

    let columns: Vec<String> = match columns {
        Some(columns) => columns.to_vec(),
        None => {
            let mut union: Vec<String> = Vec::new();
            for key in records.iter().flat_map(|r| r.keys()) {
                if !union.contains(key) {
                    union.push(key.clone());
                }
            }
            union
        }
    };

    let mut b = SqlBuilder::new(db);
    b.push("INSERT INTO ").push_ident(table);

    if columns.is_empty() {
        if records.len() > 1 {
            return Err(DatastoreError::unsupported_construct(
                "cannot insert several records that have no columns",
            ));
        }
        match db {
            DatabaseType::MySql => b.push(" () VALUES ()"),
            DatabaseType::Postgres | DatabaseType::SQLite => b.push(" DEFAULT VALUES"),
        };
        return Ok(b.finish());
    }

    let list: Vec<String> = columns.iter().map(|c| quote_ident(c, db)).collect();
    b.push(" (").push(&list.join(", ")).push(") VALUES ");

    // SQLite has no DEFAULT inside VALUES; NULL still fills integer primary keys.
    let missing = match db {
        DatabaseType::SQLite => "NULL",
        DatabaseType::MySql | DatabaseType::Postgres => "DEFAULT",
    };

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let mut cells = Vec::with_capacity(columns.len());
        for column in &columns {
            match record.get(column) {
                Some(value) => cells.push(b.bind(value.clone())),
                None => cells.push(missing.to_string()),
            }
        }
        rows.push(format!("({})", cells.join(", ")));
    }
    b.push(&rows.join(", "));

    Ok(b.finish())
}

/// SQL type for a column's `columnType`. Types without a leading underscore
/// are taken verbatim.
pub fn column_type_sql(column: &ColumnSpec, db: DatabaseType) -> String {
    use DatabaseType::*;

    let ty = match column.column_type.as_str() {
        "_numberkey" if column.auto_increment => {
            return match db {
                SQLite => "INTEGER PRIMARY KEY AUTOINCREMENT",
                Postgres => "SERIAL PRIMARY KEY",
                MySql => "BIGINT AUTO_INCREMENT PRIMARY KEY",
            }
            .to_string();
        }
        "_numberkey" => match db {
            SQLite => "INTEGER",
            Postgres | MySql => "BIGINT",
        },
        "_stringkey" => "VARCHAR(255)",
        "_number" => match db {
            SQLite => "REAL",
            Postgres => "DOUBLE PRECISION",
            MySql => "DOUBLE",
        },
        "_numbertimestamp" => "BIGINT",
        "_stringtimestamp" => "VARCHAR(64)",
        // MySQL cannot index unbounded TEXT.
        "_string" if column.unique && db == MySql => "VARCHAR(255)",
        "_string" | "_ref" => "TEXT",
        "_boolean" => "BOOLEAN",
        "_json" => match db {
            SQLite => "TEXT",
            Postgres => "JSONB",
            MySql => "JSON",
        },
        other if !other.starts_with('_') => other,
        _ => "TEXT",
    };

    let mut sql = ty.to_string();
    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if column.unique {
        sql.push_str(" UNIQUE");
    }
    sql
}

pub fn create_table(spec: &TableSpec, db: DatabaseType) -> String {
    let columns: Vec<String> = spec
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name, db), column_type_sql(c, db)))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&spec.name, db),
        columns.join(", ")
    )
}

pub fn drop_table(table: &str, db: DatabaseType) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table, db))
}

/// Lookup taking the table name as its only bound value.
pub fn has_table(db: DatabaseType) -> &'static str {
    match db {
        DatabaseType::SQLite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        DatabaseType::Postgres => {
            "SELECT table_name FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1"
        }
        DatabaseType::MySql => {
            "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Statement;
    use serde_json::json;

    fn compile_json(value: Value, db: DatabaseType) -> DsResult<CompiledStatement> {
        let ast = Statement::from_value(value)?.parse()?;
        compile(&ast, db)
    }

    #[test]
    fn test_select_with_where_sort_and_page() {
        let compiled = compile_json(
            json!({
                "select": ["id", "name"],
                "from": "user",
                "where": {"age": {">": 21}, "name": {"like": "a%"}},
                "orderBy": [{"name": "DESC"}],
                "limit": 10,
                "skip": 5
            }),
            DatabaseType::Postgres,
        )
        .unwrap();
        assert_eq!(
            compiled.native_query,
            r#"SELECT "id", "name" FROM "user" WHERE ("age" > $1 AND "name" ILIKE $2) ORDER BY "name" DESC LIMIT 10 OFFSET 5"#
        );
        assert_eq!(compiled.values_to_escape, vec![json!(21), json!("a%")]);
    }

    #[test]
    fn test_null_and_empty_list_comparisons() {
        let compiled = compile_json(
            json!({"select": "*", "from": "t", "where": {"or": [{"a": null}, {"b": {"in": []}}]}}),
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(
            compiled.native_query,
            r#"SELECT * FROM "t" WHERE ("a" IS NULL OR 1 = 0)"#
        );
        assert!(compiled.values_to_escape.is_empty());
    }

    #[test]
    fn test_not_equal_keeps_nulls() {
        let compiled = compile_json(
            json!({"count": true, "from": "t", "where": {"a": {"!=": 3}}}),
            DatabaseType::MySql,
        )
        .unwrap();
        assert_eq!(
            compiled.native_query,
            "SELECT COUNT(*) AS `numRecords` FROM `t` WHERE (`a` <> ? OR `a` IS NULL)"
        );
    }

    #[test]
    fn test_skip_without_limit() {
        let sql = |db| {
            compile_json(json!({"select": "*", "from": "t", "skip": 2}), db)
                .unwrap()
                .native_query
        };
        assert_eq!(sql(DatabaseType::SQLite), r#"SELECT * FROM "t" LIMIT -1 OFFSET 2"#);
        assert_eq!(sql(DatabaseType::Postgres), r#"SELECT * FROM "t" OFFSET 2"#);
    }

    #[test]
    fn test_insert_fills_missing_columns() {
        let compiled = compile_json(
            json!({"insert": [{"a": 1, "b": "x"}, {"a": 2}], "into": "t"}),
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(
            compiled.native_query,
            r#"INSERT INTO "t" ("a", "b") VALUES (?, ?), (?, NULL)"#
        );
        assert_eq!(compiled.values_to_escape, vec![json!(1), json!("x"), json!(2)]);

        let compiled = compile_json(
            json!({"insert": [{"a": 1, "b": "x"}, {"a": 2}], "into": "t"}),
            DatabaseType::Postgres,
        )
        .unwrap();
        assert!(compiled.native_query.ends_with("($1, $2), ($3, DEFAULT)"));
    }

    #[test]
    fn test_update_and_aggregates() {
        let compiled = compile_json(
            json!({"update": {"name": "b"}, "using": "t", "where": {"id": 1}}),
            DatabaseType::Postgres,
        )
        .unwrap();
        assert_eq!(
            compiled.native_query,
            r#"UPDATE "t" SET "name" = $1 WHERE "id" = $2"#
        );

        let compiled =
            compile_json(json!({"avg": "age", "from": "t"}), DatabaseType::SQLite).unwrap();
        assert_eq!(compiled.native_query, r#"SELECT AVG("age") AS "avg" FROM "t""#);
    }

    #[test]
    fn test_nested_operand_is_unsupported() {
        let err = compile_json(
            json!({"select": "*", "from": "t", "where": {"a": {">": {"b": 1}}}}),
            DatabaseType::SQLite,
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_INVALID_STATEMENT");
    }

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(quote_ident("we\"ird", DatabaseType::SQLite), "\"we\"\"ird\"");
        assert_eq!(quote_ident("we`ird", DatabaseType::MySql), "`we``ird`");
    }

    #[test]
    fn test_returns_rows() {
        let db = DatabaseType::SQLite;
        assert!(returns_rows("SELECT 1", db));
        assert!(returns_rows("WITH x AS (SELECT 1) SELECT * FROM x", db));
        assert!(returns_rows("PRAGMA table_info(user)", db));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING id", db));
        assert!(!returns_rows("INSERT INTO t (a) VALUES (1)", db));
        assert!(!returns_rows("CREATE TABLE t (a INTEGER)", db));
        assert!(!returns_rows("DELETE FROM t", db));
    }

    #[test]
    fn test_create_table_per_backend() {
        let spec = TableSpec {
            name: "user".into(),
            columns: vec![
                ColumnSpec {
                    name: "id".into(),
                    column_type: "_numberkey".into(),
                    primary_key: true,
                    unique: true,
                    auto_increment: true,
                },
                ColumnSpec {
                    name: "email".into(),
                    column_type: "_string".into(),
                    primary_key: false,
                    unique: true,
                    auto_increment: false,
                },
            ],
        };
        assert_eq!(
            create_table(&spec, DatabaseType::SQLite),
            r#"CREATE TABLE IF NOT EXISTS "user" ("id" INTEGER PRIMARY KEY AUTOINCREMENT, "email" TEXT UNIQUE)"#
        );
        assert_eq!(
            create_table(&spec, DatabaseType::MySql),
            "CREATE TABLE IF NOT EXISTS `user` (`id` BIGINT AUTO_INCREMENT PRIMARY KEY, `email` VARCHAR(255) UNIQUE)"
        );
    }
}

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::ast::{
    visit_expressions, AssignmentTarget, Delete, Expr, FromTable, Insert, ObjectName, Query,
    SetExpr, Statement, TableFactor, TableObject, TableWithJoins, Value as SqlValue,
};
use sqlparser::dialect::{Dialect as ParserDialect, GenericDialect, MySqlDialect};
use sqlparser::parser::Parser;

use sagaflow_store::StatementKind;

use crate::error::{AgentError, Result};

/// Closed set of supported participant dialects. Handlers are selected by a
/// static match on this tag; there is no lazy per-dialect singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    MySql,
    Postgres,
}

impl SqlDialect {
    /// Agent statements use `?` placeholders in both dialects, so Postgres
    /// parses with the generic dialect; the pg executor rewrites `?` to `$n`
    /// at bind time.
    pub(crate) fn parser(&self) -> Box<dyn ParserDialect> {
        match self {
            SqlDialect::MySql => Box::new(MySqlDialect {}),
            SqlDialect::Postgres => Box::new(GenericDialect {}),
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            SqlDialect::MySql => format!("`{ident}`"),
            SqlDialect::Postgres => format!("\"{ident}\""),
        }
    }
}

/// The forward statement's own row filter, carried verbatim (placeholders
/// included) together with the parameters bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<Value>,
    /// Columns the filter references, used to detect predicates over
    /// mutated columns.
    pub columns: Vec<String>,
}

/// Classification of one mutating statement about to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzedStatement {
    Insert {
        table: String,
        columns: Vec<String>,
        /// One entry per inserted row; `None` marks a value expression that
        /// cannot be resolved at analysis time (function call, subquery).
        rows: Vec<Vec<Option<Value>>>,
    },
    Update {
        table: String,
        assigned_columns: Vec<String>,
        predicate: Option<Predicate>,
    },
    Delete {
        table: String,
        predicate: Option<Predicate>,
    },
}

impl AnalyzedStatement {
    pub fn kind(&self) -> StatementKind {
        match self {
            AnalyzedStatement::Insert { .. } => StatementKind::Insert,
            AnalyzedStatement::Update { .. } => StatementKind::Update,
            AnalyzedStatement::Delete { .. } => StatementKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            AnalyzedStatement::Insert { table, .. }
            | AnalyzedStatement::Update { table, .. }
            | AnalyzedStatement::Delete { table, .. } => table,
        }
    }
}

/// Classifies one forward statement and extracts its target table, predicate
/// and column set. Anything it cannot classify (multi-table statements,
/// procedure calls, upserts) fails with `UnsupportedStatement` so the caller
/// can flag the statement and run it uncovered.
pub fn analyze(dialect: SqlDialect, sql: &str, params: &[Value]) -> Result<AnalyzedStatement> {
    let parser = dialect.parser();
    let statements = Parser::parse_sql(&*parser, sql)?;

    let [statement] = statements.as_slice() else {
        return Err(AgentError::UnsupportedStatement(
            "expected exactly one statement".to_owned(),
        ));
    };

    match statement {
        Statement::Insert(insert) => analyze_insert(insert, params),
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            if from.is_some() {
                return Err(AgentError::UnsupportedStatement(
                    "multi-table update".to_owned(),
                ));
            }

            let table = single_table(table)?;
            let mut assigned_columns = Vec::with_capacity(assignments.len());
            let mut assignment_placeholders = 0;

            for assignment in assignments {
                let AssignmentTarget::ColumnName(column) = &assignment.target else {
                    return Err(AgentError::UnsupportedStatement(
                        "tuple assignment".to_owned(),
                    ));
                };

                assigned_columns.push(object_name_leaf(column)?);
                assignment_placeholders += count_placeholders(&assignment.value);
            }

            let predicate = selection
                .as_ref()
                .map(|expr| build_predicate(expr, params, assignment_placeholders))
                .transpose()?;

            Ok(AnalyzedStatement::Update {
                table,
                assigned_columns,
                predicate,
            })
        }
        Statement::Delete(delete) => analyze_delete(delete, params),
        other => Err(AgentError::UnsupportedStatement(
            statement_label(other).to_owned(),
        )),
    }
}

fn analyze_insert(insert: &Insert, params: &[Value]) -> Result<AnalyzedStatement> {
    if insert.on.is_some() {
        return Err(AgentError::UnsupportedStatement(
            "insert with conflict clause".to_owned(),
        ));
    }

    let table = match &insert.table {
        TableObject::TableName(name) => object_name_leaf(name)?,
        TableObject::TableFunction(_) => {
            return Err(AgentError::UnsupportedStatement(
                "insert into table function".to_owned(),
            ))
        }
    };

    let columns = insert
        .columns
        .iter()
        .map(|ident| ident.value.to_owned())
        .collect::<Vec<_>>();

    let Some(source) = &insert.source else {
        return Err(AgentError::UnsupportedStatement(
            "insert without values".to_owned(),
        ));
    };

    let rows = insert_rows(source, params)?;

    Ok(AnalyzedStatement::Insert {
        table,
        columns,
        rows,
    })
}

fn analyze_delete(delete: &Delete, params: &[Value]) -> Result<AnalyzedStatement> {
    if !delete.tables.is_empty() || delete.using.is_some() {
        return Err(AgentError::UnsupportedStatement(
            "multi-table delete".to_owned(),
        ));
    }

    let tables = match &delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };

    let [table] = tables.as_slice() else {
        return Err(AgentError::UnsupportedStatement(
            "multi-table delete".to_owned(),
        ));
    };

    let table = single_table(table)?;

    let predicate = delete
        .selection
        .as_ref()
        .map(|expr| build_predicate(expr, params, 0))
        .transpose()?;

    Ok(AnalyzedStatement::Delete { table, predicate })
}

fn insert_rows(source: &Query, params: &[Value]) -> Result<Vec<Vec<Option<Value>>>> {
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(AgentError::UnsupportedStatement(
            "insert from select".to_owned(),
        ));
    };

    let mut next_param = 0;
    let mut rows = Vec::with_capacity(values.rows.len());

    for row in &values.rows {
        let mut resolved = Vec::with_capacity(row.len());

        for expr in row {
            resolved.push(resolve_literal(expr, params, &mut next_param));
        }

        rows.push(resolved);
    }

    Ok(rows)
}

/// Resolves a value expression to a concrete parameter: a literal, or a `?`
/// placeholder bound from the caller's parameter slice. Anything else
/// (function calls, subqueries) yields `None`.
fn resolve_literal(expr: &Expr, params: &[Value], next_param: &mut usize) -> Option<Value> {
    match expr {
        Expr::Value(value) => match &value.value {
            SqlValue::Placeholder(_) => {
                let param = params.get(*next_param).cloned();
                *next_param += 1;
                param
            }
            other => sql_value_to_json(other),
        },
        Expr::UnaryOp {
            op: sqlparser::ast::UnaryOperator::Minus,
            expr,
        } => match resolve_literal(expr, params, next_param) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::from(-i))
                } else {
                    n.as_f64().map(|f| Value::from(-f))
                }
            }
            _ => None,
        },
        Expr::Nested(inner) => resolve_literal(inner, params, next_param),
        _ => {
            *next_param += count_placeholders(expr);
            None
        }
    }
}

fn sql_value_to_json(value: &SqlValue) -> Option<Value> {
    match value {
        SqlValue::Number(raw, _) => {
            if let Ok(i) = raw.parse::<i64>() {
                Some(Value::from(i))
            } else {
                raw.parse::<f64>().ok().map(Value::from)
            }
        }
        SqlValue::SingleQuotedString(s)
        | SqlValue::DoubleQuotedString(s)
        | SqlValue::NationalStringLiteral(s) => Some(Value::String(s.to_owned())),
        SqlValue::Boolean(b) => Some(Value::Bool(*b)),
        SqlValue::Null => Some(Value::Null),
        _ => None,
    }
}

fn build_predicate(expr: &Expr, params: &[Value], placeholder_offset: usize) -> Result<Predicate> {
    let count = count_placeholders(expr);
    let start = placeholder_offset.min(params.len());
    let end = (placeholder_offset + count).min(params.len());

    if end - start < count {
        return Err(AgentError::UnsupportedStatement(format!(
            "predicate expects {count} parameters, {} remain",
            end - start
        )));
    }

    let mut columns = Vec::new();
    collect_columns(expr, &mut columns);

    Ok(Predicate {
        sql: expr.to_string(),
        params: params[start..end].to_vec(),
        columns,
    })
}

/// Counts `?` placeholders anywhere under an expression, function arguments,
/// CASE branches and subqueries included. Placeholders bind in textual order,
/// so a missed one would shift every later binding.
fn count_placeholders(expr: &Expr) -> usize {
    let mut count = 0;

    let _: ControlFlow<()> = visit_expressions(expr, |e| {
        if let Expr::Value(value) = e {
            if matches!(&value.value, SqlValue::Placeholder(_)) {
                count += 1;
            }
        }

        ControlFlow::Continue(())
    });

    count
}

fn collect_columns(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Identifier(ident) => push_column(out, ident.value.to_owned()),
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last() {
                push_column(out, last.value.to_owned());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_columns(left, out);
            collect_columns(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            collect_columns(expr, out)
        }
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => collect_columns(expr, out),
        Expr::InList { expr, .. } => collect_columns(expr, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_columns(expr, out);
            collect_columns(low, out);
            collect_columns(high, out);
        }
        _ => {}
    }
}

fn push_column(out: &mut Vec<String>, column: String) {
    if !out.contains(&column) {
        out.push(column);
    }
}

fn single_table(table: &TableWithJoins) -> Result<String> {
    if !table.joins.is_empty() {
        return Err(AgentError::UnsupportedStatement("joined tables".to_owned()));
    }

    match &table.relation {
        TableFactor::Table { name, .. } => object_name_leaf(name),
        _ => Err(AgentError::UnsupportedStatement(
            "derived or nested table".to_owned(),
        )),
    }
}

fn object_name_leaf(name: &ObjectName) -> Result<String> {
    name.0
        .last()
        .and_then(|part| part.as_ident().map(|ident| ident.value.to_owned()))
        .ok_or_else(|| AgentError::UnsupportedStatement("invalid object name".to_owned()))
}

fn statement_label(statement: &Statement) -> &'static str {
    match statement {
        Statement::Query(_) => "query",
        Statement::Call(_) => "procedure call",
        Statement::CreateTable(_) | Statement::AlterTable { .. } | Statement::Drop { .. } => "ddl",
        _ => "unclassified statement",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_insert_with_placeholders() {
        let stmt = analyze(
            SqlDialect::MySql,
            "INSERT INTO account (id, balance) VALUES (?, ?)",
            &[json!(7), json!(100)],
        )
        .unwrap();

        assert_eq!(
            stmt,
            AnalyzedStatement::Insert {
                table: "account".to_owned(),
                columns: vec!["id".to_owned(), "balance".to_owned()],
                rows: vec![vec![Some(json!(7)), Some(json!(100))]],
            }
        );
    }

    #[test]
    fn classifies_multi_row_insert_with_literals() {
        let stmt = analyze(
            SqlDialect::MySql,
            "INSERT INTO account (id, balance) VALUES (1, 10), (2, ?)",
            &[json!(20)],
        )
        .unwrap();

        let AnalyzedStatement::Insert { rows, .. } = stmt else {
            panic!("expected insert");
        };

        assert_eq!(
            rows,
            vec![
                vec![Some(json!(1)), Some(json!(10))],
                vec![Some(json!(2)), Some(json!(20))],
            ]
        );
    }

    #[test]
    fn classifies_update_predicate_params_after_assignments() {
        let stmt = analyze(
            SqlDialect::MySql,
            "UPDATE account SET balance = ? WHERE id = ? AND region = 'eu'",
            &[json!(50), json!(7)],
        )
        .unwrap();

        let AnalyzedStatement::Update {
            table,
            assigned_columns,
            predicate,
        } = stmt
        else {
            panic!("expected update");
        };

        assert_eq!(table, "account");
        assert_eq!(assigned_columns, vec!["balance".to_owned()]);

        let predicate = predicate.unwrap();
        assert_eq!(predicate.params, vec![json!(7)]);
        assert!(predicate.columns.contains(&"id".to_owned()));
        assert!(predicate.columns.contains(&"region".to_owned()));
    }

    #[test]
    fn counts_placeholders_inside_function_assignments() {
        let stmt = analyze(
            SqlDialect::MySql,
            "UPDATE account SET balance = COALESCE(?, 0), \
             tier = CASE WHEN ? > 10 THEN 'gold' ELSE 'base' END \
             WHERE id = ?",
            &[json!(50), json!(11), json!(7)],
        )
        .unwrap();

        let AnalyzedStatement::Update {
            assigned_columns,
            predicate,
            ..
        } = stmt
        else {
            panic!("expected update");
        };

        assert_eq!(
            assigned_columns,
            vec!["balance".to_owned(), "tier".to_owned()]
        );
        // The predicate binds the last parameter, not one swallowed by the
        // function-valued assignments.
        assert_eq!(predicate.unwrap().params, vec![json!(7)]);
    }

    #[test]
    fn classifies_delete() {
        let stmt = analyze(
            SqlDialect::Postgres,
            "DELETE FROM account WHERE id = ?",
            &[json!(7)],
        )
        .unwrap();

        let AnalyzedStatement::Delete { table, predicate } = stmt else {
            panic!("expected delete");
        };

        assert_eq!(table, "account");
        assert_eq!(predicate.unwrap().params, vec![json!(7)]);
    }

    #[test]
    fn rejects_joined_update() {
        let err = analyze(
            SqlDialect::MySql,
            "UPDATE a JOIN b ON a.id = b.id SET a.x = 1",
            &[],
        )
        .unwrap_err();

        assert!(matches!(err, AgentError::UnsupportedStatement(_)));
    }

    #[test]
    fn rejects_select() {
        let err = analyze(SqlDialect::MySql, "SELECT * FROM account", &[]).unwrap_err();

        assert!(matches!(err, AgentError::UnsupportedStatement(_)));
    }
}

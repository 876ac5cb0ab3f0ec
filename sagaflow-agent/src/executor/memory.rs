use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, SelectItem, SetExpr, Statement, TableFactor, TableObject,
    Value as SqlValue,
};
use sqlparser::parser::Parser;
use std::{collections::HashMap, sync::Arc};

use sagaflow_store::Row;

use crate::{
    analyzer::SqlDialect,
    error::{AgentError, Result},
    executor::SqlExecutor,
};

#[derive(Debug, Clone, Default)]
struct Table {
    primary_key: Option<String>,
    auto_increment: i64,
    last_insert: Option<Value>,
    rows: Vec<Row>,
}

/// In-process participant data store. Evaluates the same statement subset the
/// analyzer covers (single-table DML plus plain selects with conjunctions of
/// equality filters), which is all the synthesizer ever generates.
#[derive(Debug, Clone)]
pub struct MemoryExecutor {
    dialect: SqlDialect,
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

impl MemoryExecutor {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            tables: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn create_table(&self, name: impl Into<String>, primary_key: Option<&str>) {
        self.tables.write().insert(
            name.into(),
            Table {
                primary_key: primary_key.map(ToOwned::to_owned),
                ..Table::default()
            },
        );
    }

    /// Seeds one row, bypassing statement evaluation.
    pub fn seed(&self, table: &str, row: Row) {
        let mut tables = self.tables.write();
        let table = tables.entry(table.to_owned()).or_default();

        if let Some(pk) = table.primary_key.clone() {
            if let Some(id) = row.get(&pk).and_then(Value::as_i64) {
                table.auto_increment = table.auto_increment.max(id);
            }
        }

        table.rows.push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn parse(&self, sql: &str) -> Result<Statement> {
        let parser = self.dialect.parser();
        let statements = Parser::parse_sql(&*parser, sql)?;

        match statements.into_iter().next() {
            Some(statement) => Ok(statement),
            None => Err(AgentError::Executor("empty statement".to_owned())),
        }
    }
}

#[async_trait]
impl SqlExecutor for MemoryExecutor {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let Statement::Query(query) = self.parse(sql)? else {
            return Err(AgentError::Executor("expected a select".to_owned()));
        };

        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(AgentError::Executor("expected a plain select".to_owned()));
        };

        let [from] = select.from.as_slice() else {
            return Err(AgentError::Executor("expected one table".to_owned()));
        };

        if !from.joins.is_empty() {
            return Err(AgentError::Executor("joins are not supported".to_owned()));
        }

        let TableFactor::Table { name, .. } = &from.relation else {
            return Err(AgentError::Executor("expected a named table".to_owned()));
        };

        let table_name = object_leaf(name)?;
        let tables = self.tables.read();

        let Some(table) = tables.get(&table_name) else {
            return Err(AgentError::Executor(format!(
                "unknown table `{table_name}`"
            )));
        };

        let mut next_param = 0;
        let conditions = match &select.selection {
            Some(expr) => conditions(expr, params, &mut next_param)?,
            None => Vec::new(),
        };

        let mut projection: Option<Vec<String>> = None;

        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {
                    projection = None;
                    break;
                }
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                    projection
                        .get_or_insert_with(Vec::new)
                        .push(ident.value.to_owned());
                }
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                    if let Some(last) = parts.last() {
                        projection
                            .get_or_insert_with(Vec::new)
                            .push(last.value.to_owned());
                    }
                }
                _ => {
                    return Err(AgentError::Executor(
                        "unsupported select projection".to_owned(),
                    ))
                }
            }
        }

        let mut out = Vec::new();

        for row in table.rows.iter().filter(|row| matches(row, &conditions)) {
            match &projection {
                None => out.push(row.clone()),
                Some(columns) => {
                    let mut projected = Row::new();

                    for column in columns {
                        projected.insert(
                            column.to_owned(),
                            row.get(column).cloned().unwrap_or(Value::Null),
                        );
                    }

                    out.push(projected);
                }
            }
        }

        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        match self.parse(sql)? {
            Statement::Insert(insert) => {
                let table_name = match &insert.table {
                    TableObject::TableName(name) => object_leaf(name)?,
                    TableObject::TableFunction(_) => {
                        return Err(AgentError::Executor(
                            "insert into table function".to_owned(),
                        ))
                    }
                };

                if insert.columns.is_empty() {
                    return Err(AgentError::Executor(
                        "insert requires an explicit column list".to_owned(),
                    ));
                }

                let source = insert
                    .source
                    .as_ref()
                    .ok_or_else(|| AgentError::Executor("insert without values".to_owned()))?;

                let SetExpr::Values(values) = source.body.as_ref() else {
                    return Err(AgentError::Executor("insert from select".to_owned()));
                };

                let mut tables = self.tables.write();
                let table = tables
                    .get_mut(&table_name)
                    .ok_or_else(|| AgentError::Executor(format!("unknown table `{table_name}`")))?;

                let mut next_param = 0;
                let mut inserted = 0;

                for value_row in &values.rows {
                    if value_row.len() != insert.columns.len() {
                        return Err(AgentError::Executor(
                            "insert arity does not match column list".to_owned(),
                        ));
                    }

                    let mut row = Row::new();

                    for (column, expr) in insert.columns.iter().zip(value_row) {
                        row.insert(
                            column.value.to_owned(),
                            resolve_value(expr, params, &mut next_param)?,
                        );
                    }

                    if let Some(pk) = table.primary_key.clone() {
                        match row.get(&pk) {
                            Some(value) if !value.is_null() => {
                                if let Some(id) = value.as_i64() {
                                    table.auto_increment = table.auto_increment.max(id);
                                }
                                table.last_insert = Some(value.clone());
                            }
                            _ => {
                                table.auto_increment += 1;
                                let generated = Value::from(table.auto_increment);
                                row.insert(pk, generated.clone());
                                table.last_insert = Some(generated);
                            }
                        }
                    }

                    table.rows.push(row);
                    inserted += 1;
                }

                Ok(inserted)
            }
            Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                if !table.joins.is_empty() {
                    return Err(AgentError::Executor("joins are not supported".to_owned()));
                }

                let TableFactor::Table { name, .. } = &table.relation else {
                    return Err(AgentError::Executor("expected a named table".to_owned()));
                };

                let table_name = object_leaf(name)?;
                let mut next_param = 0;
                let mut changes = Vec::with_capacity(assignments.len());

                for assignment in &assignments {
                    let sqlparser::ast::AssignmentTarget::ColumnName(column) = &assignment.target
                    else {
                        return Err(AgentError::Executor("tuple assignment".to_owned()));
                    };

                    changes.push((
                        object_leaf(column)?,
                        resolve_value(&assignment.value, params, &mut next_param)?,
                    ));
                }

                let conditions = match &selection {
                    Some(expr) => conditions(expr, params, &mut next_param)?,
                    None => Vec::new(),
                };

                let mut tables = self.tables.write();
                let table = tables
                    .get_mut(&table_name)
                    .ok_or_else(|| AgentError::Executor(format!("unknown table `{table_name}`")))?;

                let mut updated = 0;

                for row in table.rows.iter_mut().filter(|row| matches(row, &conditions)) {
                    for (column, value) in &changes {
                        row.insert(column.to_owned(), value.clone());
                    }
                    updated += 1;
                }

                Ok(updated)
            }
            Statement::Delete(delete) => {
                let tables_list = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables
                    }
                };

                let [from] = tables_list.as_slice() else {
                    return Err(AgentError::Executor("multi-table delete".to_owned()));
                };

                let TableFactor::Table { name, .. } = &from.relation else {
                    return Err(AgentError::Executor("expected a named table".to_owned()));
                };

                let table_name = object_leaf(name)?;
                let mut next_param = 0;
                let conditions = match &delete.selection {
                    Some(expr) => conditions(expr, params, &mut next_param)?,
                    None => Vec::new(),
                };

                let mut tables = self.tables.write();
                let table = tables
                    .get_mut(&table_name)
                    .ok_or_else(|| AgentError::Executor(format!("unknown table `{table_name}`")))?;

                let before = table.rows.len();
                table.rows.retain(|row| !matches(row, &conditions));

                Ok((before - table.rows.len()) as u64)
            }
            _ => Err(AgentError::Executor(
                "only single-table dml is supported".to_owned(),
            )),
        }
    }

    async fn last_insert_id(&self, table: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.last_insert.clone()))
    }

    async fn primary_key(&self, table: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.primary_key.clone()))
    }
}

fn object_leaf(name: &sqlparser::ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .and_then(|part| part.as_ident().map(|ident| ident.value.to_owned()))
        .ok_or_else(|| AgentError::Executor("invalid object name".to_owned()))
}

fn resolve_value(expr: &Expr, params: &[Value], next_param: &mut usize) -> Result<Value> {
    match expr {
        Expr::Value(value) => match &value.value {
            SqlValue::Placeholder(_) => {
                let param = params
                    .get(*next_param)
                    .cloned()
                    .ok_or_else(|| AgentError::Executor("missing bound parameter".to_owned()))?;
                *next_param += 1;
                Ok(param)
            }
            SqlValue::Number(raw, _) => {
                if let Ok(i) = raw.parse::<i64>() {
                    Ok(Value::from(i))
                } else {
                    raw.parse::<f64>()
                        .map(Value::from)
                        .map_err(|_| AgentError::Executor(format!("bad number `{raw}`")))
                }
            }
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
                Ok(Value::String(s.to_owned()))
            }
            SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
            SqlValue::Null => Ok(Value::Null),
            other => Err(AgentError::Executor(format!("unsupported value {other}"))),
        },
        Expr::UnaryOp {
            op: sqlparser::ast::UnaryOperator::Minus,
            expr,
        } => match resolve_value(expr, params, next_param)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(-i))
                } else {
                    n.as_f64()
                        .map(|f| Value::from(-f))
                        .ok_or_else(|| AgentError::Executor("bad number".to_owned()))
                }
            }
            _ => Err(AgentError::Executor("cannot negate non-number".to_owned())),
        },
        Expr::Nested(inner) => resolve_value(inner, params, next_param),
        other => Err(AgentError::Executor(format!(
            "unsupported value expression {other}"
        ))),
    }
}

#[derive(Debug)]
struct Condition {
    column: String,
    value: Value,
}

fn conditions(expr: &Expr, params: &[Value], next_param: &mut usize) -> Result<Vec<Condition>> {
    let mut out = Vec::new();
    collect_conditions(expr, params, next_param, &mut out)?;

    Ok(out)
}

fn collect_conditions(
    expr: &Expr,
    params: &[Value],
    next_param: &mut usize,
    out: &mut Vec<Condition>,
) -> Result<()> {
    match expr {
        Expr::BinaryOp { left, op, right } if *op == BinaryOperator::And => {
            collect_conditions(left, params, next_param, out)?;
            collect_conditions(right, params, next_param, out)?;

            Ok(())
        }
        Expr::BinaryOp { left, op, right } if *op == BinaryOperator::Eq => {
            let (column, value_expr) = match (column_name(left), column_name(right)) {
                (Some(column), None) => (column, right.as_ref()),
                (None, Some(column)) => (column, left.as_ref()),
                _ => {
                    return Err(AgentError::Executor(
                        "equality must compare a column to a value".to_owned(),
                    ))
                }
            };

            out.push(Condition {
                column,
                value: resolve_value(value_expr, params, next_param)?,
            });

            Ok(())
        }
        Expr::Nested(inner) => collect_conditions(inner, params, next_param, out),
        other => Err(AgentError::Executor(format!(
            "unsupported predicate {other}; only conjunctions of equality are evaluated"
        ))),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_owned()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|ident| ident.value.to_owned()),
        _ => None,
    }
}

fn matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|condition| {
        row.get(&condition.column)
            .map_or(false, |value| values_eq(value, &condition.value))
    })
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

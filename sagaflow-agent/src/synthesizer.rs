use serde_json::Value;

use sagaflow_store::{CompensationDescriptor, Row, StatementKind};

use crate::{
    analyzer::{AnalyzedStatement, Predicate, SqlDialect},
    error::{AgentError, Result},
    executor::SqlExecutor,
};

/// Derives the statement that exactly reverses a forward statement's effect.
///
/// Update and delete synthesis must run *before* the forward statement so the
/// before-image is read inside the same local transaction; insert synthesis
/// runs right after it, once a generated key can be resolved.
#[derive(Debug, Clone, Copy)]
pub struct Synthesizer {
    dialect: SqlDialect,
}

impl Synthesizer {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub async fn before_forward(
        &self,
        statement: &AnalyzedStatement,
        executor: &dyn SqlExecutor,
    ) -> Result<Vec<CompensationDescriptor>> {
        match statement {
            AnalyzedStatement::Insert { .. } => Ok(Vec::new()),
            AnalyzedStatement::Update {
                table,
                assigned_columns,
                predicate,
            } => {
                self.synthesize_update(table, assigned_columns, predicate.as_ref(), executor)
                    .await
            }
            AnalyzedStatement::Delete { table, predicate } => {
                self.synthesize_delete(table, predicate.as_ref(), executor).await
            }
        }
    }

    pub async fn after_insert(
        &self,
        statement: &AnalyzedStatement,
        executor: &dyn SqlExecutor,
    ) -> Result<Vec<CompensationDescriptor>> {
        let AnalyzedStatement::Insert {
            table,
            columns,
            rows,
        } = statement
        else {
            return Ok(Vec::new());
        };

        let Some(pk) = executor.primary_key(table).await? else {
            return Err(AgentError::KeyResolution(format!(
                "table `{table}` has no known primary key"
            )));
        };

        let keys = match columns.iter().position(|c| c == &pk) {
            // Explicit key column: one delete per inserted row.
            Some(index) => rows
                .iter()
                .map(|row| {
                    row.get(index).cloned().flatten().ok_or_else(|| {
                        AgentError::KeyResolution(format!(
                            "value of key column `{pk}` is not resolvable at insert time"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            // Generated key: only a single-row insert reports one.
            None => {
                if rows.len() != 1 {
                    return Err(AgentError::KeyResolution(
                        "multi-row insert without explicit key values".to_owned(),
                    ));
                }

                let key = executor.last_insert_id(table).await?.ok_or_else(|| {
                    AgentError::KeyResolution(format!(
                        "no generated key reported for table `{table}`"
                    ))
                })?;

                vec![key]
            }
        };

        let template = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.dialect.quote(table),
            self.dialect.quote(&pk)
        );

        Ok(keys
            .into_iter()
            .map(|key| {
                let mut key_predicate = Row::new();
                key_predicate.insert(pk.to_owned(), key.clone());

                CompensationDescriptor {
                    kind: StatementKind::Insert,
                    table: table.to_owned(),
                    key_predicate,
                    before_image: Vec::new(),
                    template: template.clone(),
                    params: vec![key],
                }
            })
            .collect())
    }

    async fn synthesize_update(
        &self,
        table: &str,
        assigned_columns: &[String],
        predicate: Option<&Predicate>,
        executor: &dyn SqlExecutor,
    ) -> Result<Vec<CompensationDescriptor>> {
        let pk = executor.primary_key(table).await?;

        let mut select_columns = assigned_columns.to_vec();
        if let Some(pk) = &pk {
            if !select_columns.contains(pk) {
                select_columns.push(pk.to_owned());
            }
        }

        let rows = self
            .read_before_image(table, Some(&select_columns), predicate, executor)
            .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(pk) = pk {
            // One key-predicated undo per affected row: correct for
            // multi-row updates and immune to the forward statement
            // rewriting its own predicate columns.
            let set_clause = assigned_columns
                .iter()
                .map(|c| format!("{} = ?", self.dialect.quote(c)))
                .collect::<Vec<_>>()
                .join(", ");

            let template = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                self.dialect.quote(table),
                set_clause,
                self.dialect.quote(&pk)
            );

            return rows
                .into_iter()
                .map(|row| {
                    let key = row.get(&pk).cloned().ok_or_else(|| {
                        AgentError::KeyResolution(format!(
                            "before image misses key column `{pk}`"
                        ))
                    })?;

                    let mut params = assigned_columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                        .collect::<Vec<_>>();
                    params.push(key.clone());

                    let mut key_predicate = Row::new();
                    key_predicate.insert(pk.to_owned(), key);

                    Ok(CompensationDescriptor {
                        kind: StatementKind::Update,
                        table: table.to_owned(),
                        key_predicate,
                        before_image: vec![row],
                        template: template.clone(),
                        params,
                    })
                })
                .collect();
        }

        // No key column known: reusing the forward predicate is only safe
        // when it matched one row and references no assigned column (the
        // forward update would otherwise rewrite its own filter).
        let Some(predicate) = predicate else {
            return Err(AgentError::KeyResolution(format!(
                "unfiltered update on keyless table `{table}`"
            )));
        };

        if rows.len() > 1 {
            return Err(AgentError::KeyResolution(format!(
                "update matches {} rows on keyless table `{table}`",
                rows.len()
            )));
        }

        if predicate.columns.iter().any(|c| assigned_columns.contains(c)) {
            return Err(AgentError::KeyResolution(format!(
                "predicate over mutated columns on keyless table `{table}`"
            )));
        }

        let Some(row) = rows.into_iter().next() else {
            return Ok(Vec::new());
        };

        let set_clause = assigned_columns
            .iter()
            .map(|c| format!("{} = ?", self.dialect.quote(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut params = assigned_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect::<Vec<_>>();
        params.extend(predicate.params.iter().cloned());

        let mut key_predicate = Row::new();
        for column in &predicate.columns {
            if let Some(value) = row.get(column) {
                key_predicate.insert(column.to_owned(), value.clone());
            }
        }

        Ok(vec![CompensationDescriptor {
            kind: StatementKind::Update,
            table: table.to_owned(),
            key_predicate,
            before_image: vec![row],
            template: format!(
                "UPDATE {} SET {} WHERE {}",
                self.dialect.quote(table),
                set_clause,
                predicate.sql
            ),
            params,
        }])
    }

    async fn synthesize_delete(
        &self,
        table: &str,
        predicate: Option<&Predicate>,
        executor: &dyn SqlExecutor,
    ) -> Result<Vec<CompensationDescriptor>> {
        let rows = self.read_before_image(table, None, predicate, executor).await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let columns = rows[0].keys().cloned().collect::<Vec<_>>();

        let row_group = format!("({})", vec!["?"; columns.len()].join(", "));
        let groups = vec![row_group; rows.len()].join(", ");

        let template = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.dialect.quote(table),
            columns
                .iter()
                .map(|c| self.dialect.quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            groups
        );

        let params = rows
            .iter()
            .flat_map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            })
            .collect::<Vec<_>>();

        let mut key_predicate = Row::new();
        if let Some(predicate) = predicate {
            for column in &predicate.columns {
                if let Some(value) = rows[0].get(column) {
                    key_predicate.insert(column.to_owned(), value.clone());
                }
            }
        }

        Ok(vec![CompensationDescriptor {
            kind: StatementKind::Delete,
            table: table.to_owned(),
            key_predicate,
            before_image: rows,
            template,
            params,
        }])
    }

    async fn read_before_image(
        &self,
        table: &str,
        columns: Option<&[String]>,
        predicate: Option<&Predicate>,
        executor: &dyn SqlExecutor,
    ) -> Result<Vec<Row>> {
        let select_list = match columns {
            Some(columns) => columns
                .iter()
                .map(|c| self.dialect.quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            None => "*".to_owned(),
        };

        let (where_clause, params) = match predicate {
            Some(predicate) => (format!(" WHERE {}", predicate.sql), predicate.params.as_slice()),
            None => (String::new(), [].as_slice()),
        };

        let sql = format!(
            "SELECT {} FROM {}{}",
            select_list,
            self.dialect.quote(table),
            where_clause
        );

        executor
            .query(&sql, params)
            .await
            .map_err(|e| AgentError::BeforeImageRead(e.to_string()))
    }
}

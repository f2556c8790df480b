//! Postgres-backed policy adapter.
//!
//! Rules live in a single table (default `casbin_rule`) with one row per
//! rule: `ptype` is `p` or `g`, `v0..v2` carry the rule fields and `v3..v5`
//! are kept empty for compatibility with the common six-column layout.
//!
//! ## Error Mapping
//!
//! | SQLx Error | AdapterError | Scenario |
//! |------------|--------------|----------|
//! | Database (any code) | `Rejected` | Constraint or schema violation |
//! | PoolClosed, Io, Tls, PoolTimedOut | `Unavailable` | Store unreachable |
//! | Other | `Unavailable` | Decoding and protocol failures |
//!
//! ## Save semantics
//!
//! `save_policy` replaces the table contents inside one transaction, so a
//! concurrent reader sees either the previous or the new generation. With
//! auto-save on, single-rule writes go straight to the table.

use async_trait::async_trait;
use casbin::{Adapter, Filter, Model};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{Span, instrument};

use crm_auth::{AdapterError, PolicySet, RuleRow};

use crate::config::is_sql_identifier;

/// Rows per multi-value INSERT; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1000;

/// Rule columns after `ptype`.
const RULE_COLUMNS: usize = 6;

pub struct PostgresPolicyAdapter {
    pool: PgPool,
    table: String,
}

impl PostgresPolicyAdapter {
    /// `table` is interpolated into SQL and must be a plain identifier.
    pub fn new(pool: PgPool, table: &str) -> Result<Self, AdapterError> {
        if !is_sql_identifier(table) {
            return Err(AdapterError::Rejected(format!("invalid policy table name `{table}`")));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the rule table if it does not exist.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn ensure_table(&self) -> Result<(), AdapterError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id BIGSERIAL PRIMARY KEY,
                ptype VARCHAR(12) NOT NULL DEFAULT '',
                v0 VARCHAR(256) NOT NULL DEFAULT '',
                v1 VARCHAR(256) NOT NULL DEFAULT '',
                v2 VARCHAR(256) NOT NULL DEFAULT '',
                v3 VARCHAR(256) NOT NULL DEFAULT '',
                v4 VARCHAR(256) NOT NULL DEFAULT '',
                v5 VARCHAR(256) NOT NULL DEFAULT '',
                CONSTRAINT {t}_unique_rule UNIQUE (ptype, v0, v1, v2, v3, v4, v5)
            )",
            t = self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_table", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(rows), err)]
    async fn fetch_rows(&self) -> Result<Vec<RuleRow>, AdapterError> {
        let sql = format!("SELECT ptype, v0, v1, v2 FROM {} ORDER BY id", self.table);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_policy", e))?;

        Span::current().record("rows", rows.len());

        rows.iter()
            .map(|row| {
                Ok(RuleRow {
                    ptype: row.try_get("ptype")?,
                    v0: row.try_get("v0")?,
                    v1: row.try_get("v1")?,
                    v2: row.try_get("v2")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("load_policy", e))
    }

    #[instrument(skip(self, policy), fields(rows), err)]
    async fn replace_rows(&self, policy: &PolicySet) -> Result<(), AdapterError> {
        let rows = policy.to_rows();
        Span::current().record("rows", rows.len());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("save_policy.begin", e))?;

        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save_policy.delete", e))?;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut insert: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (ptype, v0, v1, v2) ", self.table));
            insert.push_values(chunk, |mut b, row| {
                b.push_bind(row.ptype.clone())
                    .push_bind(row.v0.clone())
                    .push_bind(row.v1.clone())
                    .push_bind(row.v2.clone());
            });
            insert
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save_policy.insert", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("save_policy.commit", e))?;
        Ok(())
    }

    async fn insert_rules(&self, ptype: &str, rules: &[Vec<String>]) -> Result<(), AdapterError> {
        if rules.is_empty() {
            return Ok(());
        }
        let mut insert: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (ptype, v0, v1, v2) ", self.table));
        insert.push_values(rules, |mut b, rule| {
            b.push_bind(ptype.to_string());
            for i in 0..3 {
                b.push_bind(rule.get(i).cloned().unwrap_or_default());
            }
        });
        insert.push(" ON CONFLICT DO NOTHING");
        insert
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_policy", e))?;
        Ok(())
    }

    /// Delete rows of `ptype` whose columns from `field_index` on equal
    /// `values`; an empty value matches any column content.
    async fn delete_matching(&self, ptype: &str, field_index: usize, values: &[String]) -> Result<u64, AdapterError> {
        let mut delete: QueryBuilder<Postgres> = QueryBuilder::new(format!("DELETE FROM {} WHERE ptype = ", self.table));
        delete.push_bind(ptype.to_string());
        for (offset, value) in values.iter().enumerate() {
            let column = field_index + offset;
            if value.is_empty() || column >= RULE_COLUMNS {
                continue;
            }
            delete.push(format!(" AND v{column} = "));
            delete.push_bind(value.clone());
        }
        let result = delete
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_policy", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Adapter for PostgresPolicyAdapter {
    async fn load_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        let rows = self.fetch_rows().await?;
        PolicySet::from_rows(rows).load_into(m);
        Ok(())
    }

    async fn load_filtered_policy<'a>(&mut self, m: &mut dyn Model, _f: Filter<'a>) -> casbin::Result<()> {
        self.load_policy(m).await
    }

    async fn save_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        self.replace_rows(&PolicySet::from_model(m)).await?;
        Ok(())
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        self.replace_rows(&PolicySet::new()).await?;
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        false
    }

    async fn add_policy(&mut self, _sec: &str, ptype: &str, rule: Vec<String>) -> casbin::Result<bool> {
        self.insert_rules(ptype, &[rule]).await?;
        Ok(true)
    }

    async fn add_policies(&mut self, _sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> casbin::Result<bool> {
        for chunk in rules.chunks(INSERT_CHUNK) {
            self.insert_rules(ptype, chunk).await?;
        }
        Ok(true)
    }

    async fn remove_policy(&mut self, _sec: &str, ptype: &str, rule: Vec<String>) -> casbin::Result<bool> {
        self.delete_matching(ptype, 0, &rule).await?;
        Ok(true)
    }

    async fn remove_policies(&mut self, _sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> casbin::Result<bool> {
        for rule in rules {
            self.delete_matching(ptype, 0, &rule).await?;
        }
        Ok(true)
    }

    async fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        self.delete_matching(ptype, field_index, &field_values).await?;
        Ok(true)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AdapterError {
    match err {
        sqlx::Error::Database(db_err) => {
            AdapterError::Rejected(format!("database error in {operation}: {}", db_err.message()))
        }
        other => AdapterError::Unavailable(format!("{operation}: {other}")),
    }
}

// ABOUTME: tokio-postgres implementation of the Session trait
// ABOUTME: Checks parameter counts against the prepared statement before binding

use super::params::{row_to_json, JsonParam};
use crate::error::{Error, Result};
use crate::session::{savepoint_name, Session};
use crate::types::JsonObject;
use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Statement};

pub struct PostgresSession {
    client: Client,
    depth: usize,
}

impl PostgresSession {
    pub fn new(client: Client) -> Self {
        Self { client, depth: 0 }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn prepare(&self, sql: &str, supplied: usize) -> Result<Statement> {
        let statement = self.client.prepare(sql).await?;
        let required = statement.params().len();
        if supplied < required {
            return Err(Error::TooFewParameters { required, supplied });
        }
        Ok(statement)
    }
}

fn bind<'a>(statement: &Statement, params: &'a [Value]) -> Vec<JsonParam<'a>> {
    params[..statement.params().len()]
        .iter()
        .map(JsonParam)
        .collect()
}

fn as_refs<'a>(params: &'a [JsonParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Session for PostgresSession {
    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<JsonObject>> {
        let statement = self.prepare(sql, params.len()).await?;
        let bound = bind(&statement, params);
        let rows = self.client.query(&statement, &as_refs(&bound)).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let statement = self.prepare(sql, params.len()).await?;
        let bound = bind(&statement, params);
        Ok(self.client.execute(&statement, &as_refs(&bound)).await?)
    }

    async fn begin(&mut self) -> Result<()> {
        let sql = if self.depth == 0 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {}", savepoint_name(self.depth + 1))
        };
        self.client.batch_execute(&sql).await?;
        self.depth += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let sql = match self.depth {
            0 => return Err(Error::usage("commit called outside of a transaction")),
            1 => "COMMIT".to_string(),
            depth => format!("RELEASE SAVEPOINT {}", savepoint_name(depth)),
        };
        self.depth -= 1;
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let sql = match self.depth {
            0 => return Err(Error::usage("rollback called outside of a transaction")),
            1 => "ROLLBACK".to_string(),
            depth => format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(depth)),
        };
        self.depth -= 1;
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    fn transaction_depth(&self) -> usize {
        self.depth
    }
}

// Query sandbox on top of the container runtime.
//
// Starts a throwaway PostgreSQL container, runs the queries in order on one
// session and stops at the first failing query. Each query reports its last
// statement as text, a scalar or a dataset.

use crate::dataset::{Dataset, DatasetColumn};
use crate::error::{ContainerStage, RuntimeError, SandboxError};
use crate::lifecycle::ContainerHandle;
use crate::orchestrator::Sandbox;
use crate::runtime::ContainerSpec;
use sandbox_common::config::QueryConfig;
use sandbox_common::types::FailureKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("Database did not accept connections within {}ms: {last_error}", .after.as_millis())]
    NotReady { after: Duration, last_error: String },
    #[error("Query execution timed out")]
    TimedOut { after: Duration },
}

impl QueryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            QueryError::Sandbox(e) => e.kind(),
            QueryError::NotReady { .. } => FailureKind::Operational,
            QueryError::TimedOut { .. } => FailureKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryOutputType {
    Text,
    Scalar,
    Tabular,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Text(String),
    Dataset(Dataset),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    /// 1-based position of the query
    pub order: usize,
    pub status: QueryStatus,
    pub feedback: String,
    #[serde(rename = "type")]
    pub output_type: QueryOutputType,
    pub result: QueryResult,
}

/// Last statement of one query, as returned by the server
#[derive(Debug, Default, PartialEq)]
struct StatementResult {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    row_count: u64,
}

/// Run `queries` in order against a fresh database.
///
/// A failing query ends the sequence and is reported as data. `Err` means
/// the database itself could not be brought up or the batch hit its deadline.
#[instrument(skip(sandbox, queries), fields(queries = queries.len()))]
pub async fn run_queries(
    sandbox: &Sandbox,
    queries: &[String],
) -> Result<Vec<QueryOutput>, QueryError> {
    let config = sandbox.config();
    let (handle, port) = start_database(sandbox).await?;

    let deadline = config.execution_timeout();
    let outcome = async {
        let client = connect(&config.query, port).await?;
        tokio::time::timeout(deadline, execute_all(&client, queries))
            .await
            .map_err(|_| QueryError::TimedOut { after: deadline })
    }
    .await;

    handle.kill().await;

    match &outcome {
        Ok(outputs) => info!(
            executed = outputs.len(),
            failed = outputs.iter().any(|o| o.status == QueryStatus::Error),
            "Queries finished"
        ),
        Err(e) => warn!(error = %e, "Query sandbox failed"),
    }

    outcome
}

/// Create and start the database container, pulling its image when the
/// first create reports it missing
pub(crate) async fn start_database(
    sandbox: &Sandbox,
) -> Result<(ContainerHandle, u16), SandboxError> {
    let runtime = sandbox.runtime();
    let config = sandbox.config();

    let spec = ContainerSpec {
        name: format!("sandbox-db-{}", Uuid::new_v4().simple()),
        image: config.query.image.clone(),
        cmd: Vec::new(),
        working_dir: "/".to_string(),
        env: config.query.container_env(),
        memory_bytes: config.memory_limit_bytes(),
        // initdb is CPU bound, only memory is capped
        nano_cpus: 0,
        network_disabled: false,
        published_port: Some(QueryConfig::PORT),
        auto_remove: true,
    };

    let created = match runtime.create_container(&spec).await {
        Err(RuntimeError::NotFound(_)) => {
            info!(image = %spec.image, "Database image missing, pulling");
            runtime
                .ensure_image(&spec.image)
                .await
                .map_err(|source| SandboxError::Image {
                    image: spec.image.clone(),
                    source,
                })?;
            runtime.create_container(&spec).await
        }
        other => other,
    };
    let id = created.map_err(|source| SandboxError::Container {
        stage: ContainerStage::Create,
        source,
    })?;

    let handle = ContainerHandle::new(Arc::clone(runtime), sandbox.reaper().clone(), id, config);

    let published = async {
        runtime
            .start_container(handle.id())
            .await
            .map_err(|source| SandboxError::Container {
                stage: ContainerStage::Start,
                source,
            })?;
        runtime
            .host_port(handle.id(), QueryConfig::PORT)
            .await
            .map_err(|source| SandboxError::Container {
                stage: ContainerStage::Publish,
                source,
            })
    }
    .await;

    match published {
        Ok(port) => {
            debug!(container_id = %handle.id(), port, "Database container started");
            Ok((handle, port))
        }
        Err(e) => {
            handle.kill().await;
            Err(e)
        }
    }
}

/// Connect once the server accepts connections, retrying until the ready timeout
async fn connect(config: &QueryConfig, port: u16) -> Result<Client, QueryError> {
    let ready_timeout = config.ready_timeout();
    let started = Instant::now();

    loop {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(port)
            .user(&config.user)
            .password(&config.password)
            .dbname(&config.database)
            .connect_timeout(Duration::from_secs(2));

        match pg.connect(NoTls).await {
            Ok((client, connection)) => {
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(error = %e, "Database connection closed");
                    }
                });
                debug!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Database accepts connections"
                );
                return Ok(client);
            }
            Err(e) if started.elapsed() >= ready_timeout => {
                return Err(QueryError::NotReady {
                    after: ready_timeout,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                debug!(error = %e, "Database not ready yet");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

async fn execute_all(client: &Client, queries: &[String]) -> Vec<QueryOutput> {
    let mut outputs = Vec::with_capacity(queries.len());

    for (index, query) in queries.iter().enumerate() {
        let order = index + 1;
        match client.simple_query(query).await {
            Ok(messages) => {
                let statement = last_statement(messages);
                outputs.push(summarize(order, &command_of(query), statement));
            }
            Err(e) => {
                let message = e
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string());
                debug!(order, error = %message, "Query failed, skipping the rest");
                outputs.push(failed(order, message));
                break;
            }
        }
    }

    outputs
}

fn last_statement(messages: Vec<SimpleQueryMessage>) -> StatementResult {
    let mut current = StatementResult::default();
    let mut last = StatementResult::default();

    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                current.columns = columns.iter().map(|c| c.name().to_string()).collect();
            }
            SimpleQueryMessage::Row(row) => {
                if current.columns.is_empty() {
                    current.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                current
                    .rows
                    .push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
            }
            SimpleQueryMessage::CommandComplete(count) => {
                current.row_count = count;
                last = std::mem::take(&mut current);
            }
            _ => {}
        }
    }

    last
}

/// Leading keyword of the last statement, e.g. `SELECT`
fn command_of(query: &str) -> String {
    query
        .split(';')
        .filter_map(|statement| {
            statement
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.starts_with("--"))
        })
        .last()
        .and_then(|line| line.split_whitespace().next())
        .map(|word| word.to_uppercase())
        .unwrap_or_else(|| "QUERY".to_string())
}

fn feedback(command: &str, row_count: u64) -> String {
    let message = format!("{} operation executed.", command);
    let rows = if row_count == 1 { "row" } else { "rows" };
    if row_count > 0 {
        format!("{} {} {} affected.", message, row_count, rows)
    } else if command == "SELECT" {
        format!("{} {} {} returned.", message, row_count, rows)
    } else {
        message
    }
}

fn summarize(order: usize, command: &str, statement: StatementResult) -> QueryOutput {
    let feedback = feedback(command, statement.row_count);
    let fields = statement.columns.len();
    let rows = statement.rows.len();

    let output_type = if fields > 1 || (fields == 1 && rows > 1) {
        QueryOutputType::Tabular
    } else if fields == 1 && rows == 1 {
        QueryOutputType::Scalar
    } else {
        QueryOutputType::Text
    };

    let result = match output_type {
        QueryOutputType::Text => QueryResult::Text(feedback.clone()),
        QueryOutputType::Scalar | QueryOutputType::Tabular => QueryResult::Dataset(Dataset {
            columns: statement.columns.into_iter().map(DatasetColumn::new).collect(),
            rows: statement
                .rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|cell| cell.map(Value::String).unwrap_or(Value::Null))
                        .collect()
                })
                .collect(),
        }),
    };

    QueryOutput {
        order,
        status: QueryStatus::Success,
        feedback,
        output_type,
        result,
    }
}

fn failed(order: usize, message: String) -> QueryOutput {
    QueryOutput {
        order,
        status: QueryStatus::Error,
        feedback: message.clone(),
        output_type: QueryOutputType::Text,
        result: QueryResult::Text(message),
    }
}

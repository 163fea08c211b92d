//! Postgres-backed query engine.
//!
//! Queries are written with named placeholders (`:status`), rewritten to
//! positional ones (`$1`) before execution. Null parameters are written inline
//! as an untyped `NULL` (cast when the parameter has a type hint), so Postgres
//! infers their type instead of reading them as text. Every run happens in its own
//! transaction with `SET LOCAL statement_timeout`, so the engine-wide timeout
//! can never leak onto a pooled connection. Rows are folded into a single
//! JSON array with `jsonb_agg`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value as JsonValue;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::QueryScalar;
use tracing::debug;

use deferq_core::Hints;

use super::{BoundParameter, EngineError, QueryEngine};

/// Postgres error code for a statement cancelled by `statement_timeout`.
const QUERY_CANCELED: &str = "57014";

/// Largest `statement_timeout` Postgres accepts, in milliseconds.
const MAX_STATEMENT_TIMEOUT_MS: u128 = i32::MAX as u128;

pub struct PostgresQueryEngine {
    pool: PgPool,
    runtime: tokio::runtime::Runtime,
    timeout: Mutex<Option<Duration>>,
}

impl PostgresQueryEngine {
    /// Connect a pool of at most `max_connections` to `database_url`.
    ///
    /// The engine drives sqlx on a private current-thread runtime, so it
    /// must not be called from inside another tokio runtime.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            runtime,
            timeout: Mutex::new(None),
        })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout.lock().ok().and_then(|t| *t)
    }
}

impl QueryEngine for PostgresQueryEngine {
    fn set_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut current = self
            .timeout
            .lock()
            .map_err(|_| EngineError::Connection("timeout lock poisoned".to_string()))?;
        *current = Some(timeout);
        Ok(())
    }

    fn clear_timeout(&self) -> Result<(), EngineError> {
        let mut current = self
            .timeout
            .lock()
            .map_err(|_| EngineError::Connection("timeout lock poisoned".to_string()))?;
        *current = None;
        Ok(())
    }

    fn run(
        &self,
        query: &str,
        parameters: &[BoundParameter],
        hints: &Hints,
    ) -> Result<JsonValue, EngineError> {
        let (sql, order) = rewrite_placeholders(query, parameters)?;
        let wrapped =
            format!("SELECT COALESCE(jsonb_agg(to_jsonb(q)), '[]'::jsonb) FROM ({sql}) AS q");
        let set_timeout = statement_timeout_sql(self.timeout());

        if !hints.is_empty() {
            debug!(hints = ?hints, "postgres engine does not interpret query hints");
        }

        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(classify)?;
            sqlx::query(&set_timeout)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;

            let mut statement = sqlx::query_scalar::<Postgres, JsonValue>(&wrapped);
            for index in order {
                statement = bind_json(statement, &parameters[index].value);
            }
            let rows = statement.fetch_one(&mut *tx).await.map_err(classify)?;

            tx.commit().await.map_err(classify)?;
            Ok(rows)
        })
    }
}

/// `SET LOCAL` for `timeout`, clamped to what Postgres accepts. No timeout
/// maps to 0, which disables the limit.
pub(crate) fn statement_timeout_sql(timeout: Option<Duration>) -> String {
    let millis = timeout.map_or(0, |t| t.as_millis().clamp(1, MAX_STATEMENT_TIMEOUT_MS));
    format!("SET LOCAL statement_timeout = {millis}")
}

fn classify(error: sqlx::Error) -> EngineError {
    match &error {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            EngineError::Timeout
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            EngineError::Connection(error.to_string())
        }
        _ => EngineError::Execution(error.to_string()),
    }
}

fn bind_json<'q>(
    statement: QueryScalar<'q, Postgres, JsonValue, PgArguments>,
    value: &JsonValue,
) -> QueryScalar<'q, Postgres, JsonValue, PgArguments> {
    match value {
        // Not reached: `rewrite_placeholders` inlines nulls.
        JsonValue::Null => statement.bind(Option::<String>::None),
        JsonValue::Bool(b) => statement.bind(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => statement.bind(i),
            None => statement.bind(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => statement.bind(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => statement.bind(value.clone()),
    }
}

/// Rewrite `:name` placeholders to `$n`, appending `::type` when the
/// parameter carries a type hint. Null-valued parameters become a `NULL`
/// literal and take no position. Returns the SQL and, for each position, the
/// index of the parameter bound there.
///
/// `::` casts and anything inside single- or double-quoted text are left
/// untouched. A placeholder with no matching parameter is an error.
pub(crate) fn rewrite_placeholders(
    query: &str,
    parameters: &[BoundParameter],
) -> Result<(String, Vec<usize>), EngineError> {
    let mut sql = String::with_capacity(query.len());
    let mut order: Vec<usize> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut quote: Option<char> = None;

    let mut chars = query.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if let Some(open) = quote {
            sql.push(c);
            if c == open {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                sql.push(c);
            }
            ':' if chars.peek().is_some_and(|(_, next)| *next == ':') => {
                sql.push_str("::");
                chars.next();
            }
            ':' if chars
                .peek()
                .is_some_and(|(_, next)| next.is_ascii_alphabetic() || *next == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while let Some((j, next)) = chars.peek().copied() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        end = j + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let name = &query[start..end];

                let index = parameters
                    .iter()
                    .position(|p| p.name == name)
                    .ok_or_else(|| EngineError::Execution(format!("unbound parameter :{name}")))?;

                if parameters[index].value.is_null() {
                    sql.push_str("NULL");
                } else {
                    let position = *positions.entry(name).or_insert_with(|| {
                        order.push(index);
                        order.len()
                    });
                    sql.push('$');
                    sql.push_str(&position.to_string());
                }
                if let Some(hint) = &parameters[index].type_hint {
                    sql.push_str("::");
                    sql.push_str(hint);
                }
            }
            _ => sql.push(c),
        }
    }

    Ok((sql, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(name: &str, value: JsonValue, hint: Option<&str>) -> BoundParameter {
        BoundParameter {
            name: name.to_string(),
            value,
            type_hint: hint.map(str::to_string),
        }
    }

    #[test]
    fn named_placeholders_become_positional() {
        let params = vec![param("status", json!("paid"), None), param("owner", json!(7), None)];
        let (sql, order) = rewrite_placeholders(
            "SELECT * FROM orders WHERE owner_id = :owner AND status = :status",
            &params,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM orders WHERE owner_id = $1 AND status = $2");
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn repeated_placeholder_reuses_position() {
        let params = vec![param("day", json!("2024-01-01"), Some("date"))];
        let (sql, order) =
            rewrite_placeholders("SELECT :day, :day + 1", &params).unwrap();
        assert_eq!(sql, "SELECT $1::date, $1::date + 1");
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn casts_and_literals_are_untouched() {
        let params = vec![param("id", json!(1), None)];
        let (sql, order) = rewrite_placeholders(
            r#"SELECT created_at::date, ':id', "a:b" FROM t WHERE id = :id"#,
            &params,
        )
        .unwrap();
        assert_eq!(
            sql,
            r#"SELECT created_at::date, ':id', "a:b" FROM t WHERE id = $1"#
        );
        assert_eq!(order, vec![0]);
    }

    #[test]
    fn null_parameters_are_inlined_untyped_unless_hinted() {
        let params = vec![
            param("closed", JsonValue::Null, None),
            param("owner", json!(7), None),
            param("since", JsonValue::Null, Some("timestamptz")),
        ];
        let (sql, order) = rewrite_placeholders(
            "SELECT * FROM t WHERE closed_at IS NOT DISTINCT FROM :closed \
             AND owner_id = :owner AND (:since IS NULL OR created_at > :since)",
            &params,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE closed_at IS NOT DISTINCT FROM NULL \
             AND owner_id = $1 AND (NULL::timestamptz IS NULL OR created_at > NULL::timestamptz)"
        );
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn statement_timeout_is_clamped_to_the_postgres_maximum() {
        assert_eq!(statement_timeout_sql(None), "SET LOCAL statement_timeout = 0");
        assert_eq!(
            statement_timeout_sql(Some(Duration::from_millis(1500))),
            "SET LOCAL statement_timeout = 1500"
        );
        // A score of 7200 over the 5 minute base is 600 hours.
        let large = crate::sweep::timeout_for_score(Duration::from_secs(300), 7200);
        assert_eq!(
            statement_timeout_sql(Some(large)),
            "SET LOCAL statement_timeout = 2147483647"
        );
        assert_eq!(
            statement_timeout_sql(Some(Duration::MAX)),
            "SET LOCAL statement_timeout = 2147483647"
        );
    }

    #[test]
    fn sub_millisecond_timeout_is_not_mistaken_for_unbounded() {
        assert_eq!(
            statement_timeout_sql(Some(Duration::from_micros(10))),
            "SET LOCAL statement_timeout = 1"
        );
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        let err = rewrite_placeholders("SELECT :missing", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Execution(msg) if msg.contains(":missing")));
    }
}

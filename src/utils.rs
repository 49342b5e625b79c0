use sqlx::{query_scalar, Executor, Postgres};

use crate::errors::{HiveWorkerError, Result};

/// Quotes `identifier` the way postgres' `format('%I')` does.
pub async fn escape_identifier<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    identifier: &str,
) -> Result<String> {
    let escaped_identifier: Option<String> =
        query_scalar("select format('%I', $1::text) as escaped_identifier")
            .bind(identifier)
            .fetch_one(executor)
            .await?;

    escaped_identifier
        .ok_or_else(|| HiveWorkerError::Store(format!("could not escape '{identifier}'")))
}

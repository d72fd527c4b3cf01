//! Live schema introspection against `information_schema`.

use std::collections::BTreeSet;
use tokio_postgres::Client;

/// Column names of `table` in the current schema. Empty if the table does
/// not exist.
pub async fn column_names(
    client: &Client,
    table: &str,
) -> Result<BTreeSet<String>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT column_name::text FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1",
            &[&table],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
}

/// Primary key columns of `table`, in key order.
pub async fn primary_key_columns(
    client: &Client,
    table: &str,
) -> Result<Vec<String>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT a.attname::text
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = to_regclass(quote_ident($1))
             AND i.indisprimary
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
}

/// Name of the sequence owned by `table.column`, if any.
pub async fn serial_sequence(
    client: &Client,
    table: &str,
    column: &str,
) -> Result<Option<String>, tokio_postgres::Error> {
    let row = client
        .query_one(
            "SELECT pg_get_serial_sequence(quote_ident($1), $2)",
            &[&table, &column],
        )
        .await?;
    row.try_get::<_, Option<String>>(0)
}

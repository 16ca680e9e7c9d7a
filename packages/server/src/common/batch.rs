//! Chunked multi-row inserts.
//!
//! Postgres caps bind parameters per statement, so bulk inserts are split
//! into chunks of `rows_per_chunk(columns)` rows. All chunks run on the
//! caller's connection: pass a transaction to make the whole batch one
//! logical insert.

use anyhow::Result;
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, Postgres, QueryBuilder};

/// Conservative bind-parameter budget per statement.
pub const PARAM_LIMIT: usize = 30_000;

/// Rows per chunk for a given column count.
pub fn rows_per_chunk(columns: usize) -> usize {
    (PARAM_LIMIT / columns.max(1)).max(1)
}

/// Conflict handling for [`insert_many`].
#[derive(Debug, Clone, Copy)]
pub enum OnConflict<'a> {
    /// Let a conflicting row abort the statement.
    Error,
    /// `ON CONFLICT (target) DO NOTHING`; an empty target matches any
    /// constraint.
    DoNothing(&'a str),
    /// `ON CONFLICT (target) DO UPDATE SET col = EXCLUDED.col, ...`
    Update {
        target: &'a str,
        columns: &'a [&'a str],
    },
}

impl OnConflict<'_> {
    fn clause(&self) -> String {
        match self {
            OnConflict::Error => String::new(),
            OnConflict::DoNothing(target) if target.is_empty() => {
                " ON CONFLICT DO NOTHING".to_string()
            }
            OnConflict::DoNothing(target) => format!(" ON CONFLICT ({target}) DO NOTHING"),
            OnConflict::Update { target, columns } => {
                let assignments = columns
                    .iter()
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" ON CONFLICT ({target}) DO UPDATE SET {assignments}")
            }
        }
    }
}

/// Insert `rows` into `table`, chunked under the parameter limit.
///
/// `bind` pushes one row's values in column order. Returns the number of
/// affected rows across all chunks.
pub async fn insert_many<T, F>(
    conn: &mut PgConnection,
    table: &str,
    columns: &[&str],
    conflict: OnConflict<'_>,
    rows: &[T],
    bind: F,
) -> Result<u64>
where
    F: for<'qb, 'args> Fn(&mut Separated<'qb, 'args, Postgres, &'static str>, &T),
{
    if rows.is_empty() {
        return Ok(0);
    }

    let prefix = format!("INSERT INTO {} ({}) ", table, columns.join(", "));
    let tail = conflict.clause();
    let mut affected = 0u64;

    for chunk in rows.chunks(rows_per_chunk(columns.len())) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
        builder.push_values(chunk, |mut separated, row| bind(&mut separated, row));
        builder.push(&tail);
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(affected)
}

/// As [`insert_many`], but returns the generated `id` of every inserted
/// row, in insertion order.
pub async fn insert_many_returning_ids<T, F>(
    conn: &mut PgConnection,
    table: &str,
    columns: &[&str],
    conflict: OnConflict<'_>,
    rows: &[T],
    bind: F,
) -> Result<Vec<i64>>
where
    F: for<'qb, 'args> Fn(&mut Separated<'qb, 'args, Postgres, &'static str>, &T),
{
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let prefix = format!("INSERT INTO {} ({}) ", table, columns.join(", "));
    let tail = format!("{} RETURNING id", conflict.clause());
    let mut ids = Vec::with_capacity(rows.len());

    for chunk in rows.chunks(rows_per_chunk(columns.len())) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
        builder.push_values(chunk, |mut separated, row| bind(&mut separated, row));
        builder.push(&tail);
        let chunk_ids: Vec<i64> = builder.build_query_scalar().fetch_all(&mut *conn).await?;
        ids.extend(chunk_ids);
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_respects_the_parameter_limit() {
        assert_eq!(rows_per_chunk(10), 3_000);
        assert_eq!(rows_per_chunk(9), 3_333);
        // Degenerate cases still make progress.
        assert_eq!(rows_per_chunk(0), PARAM_LIMIT);
        assert_eq!(rows_per_chunk(PARAM_LIMIT * 2), 1);
    }

    #[test]
    fn conflict_clauses_render() {
        assert_eq!(OnConflict::Error.clause(), "");
        assert_eq!(
            OnConflict::DoNothing("upstream_id").clause(),
            " ON CONFLICT (upstream_id) DO NOTHING"
        );
        assert_eq!(OnConflict::DoNothing("").clause(), " ON CONFLICT DO NOTHING");
        assert_eq!(
            OnConflict::Update {
                target: "type_id, region_id, price_date",
                columns: &["average", "volume"],
            }
            .clause(),
            " ON CONFLICT (type_id, region_id, price_date) DO UPDATE SET \
             average = EXCLUDED.average, volume = EXCLUDED.volume"
        );
    }
}

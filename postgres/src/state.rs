use sqlx::{PgPool, prelude::FromRow};

/// A row of `tnd.destination_state`.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DestinationStateRow {
    pub namespace: String,
    pub name: String,
    pub state: serde_json::Value,
    /// Bumped on every write. Rows start at revision 1.
    pub revision: i64,
}

/// Fetches every persisted stream state.
pub async fn get_destination_state_rows(pool: &PgPool) -> sqlx::Result<Vec<DestinationStateRow>> {
    sqlx::query_as::<_, DestinationStateRow>(
        r#"
        select namespace, name, state, revision
        from tnd.destination_state
        order by namespace, name
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Fetches the state of one stream, if any was persisted.
pub async fn get_destination_state(
    pool: &PgPool,
    namespace: &str,
    name: &str,
) -> sqlx::Result<Option<DestinationStateRow>> {
    sqlx::query_as::<_, DestinationStateRow>(
        r#"
        select namespace, name, state, revision
        from tnd.destination_state
        where namespace = $1 and name = $2
        "#,
    )
    .bind(namespace)
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Writes `state` if the stored revision still equals `expected_revision`.
///
/// `expected_revision == 0` means the caller saw no row. Returns the new revision,
/// or `None` when another writer got there first.
pub async fn compare_and_set_destination_state(
    pool: &PgPool,
    namespace: &str,
    name: &str,
    expected_revision: i64,
    state: &serde_json::Value,
) -> sqlx::Result<Option<i64>> {
    let mut tx = pool.begin().await?;

    let new_revision: Option<i64> = if expected_revision == 0 {
        sqlx::query_scalar(
            r#"
            insert into tnd.destination_state (namespace, name, state, revision)
            values ($1, $2, $3, 1)
            on conflict (namespace, name) do nothing
            returning revision
            "#,
        )
        .bind(namespace)
        .bind(name)
        .bind(state)
        .fetch_optional(&mut *tx)
        .await?
    } else {
        sqlx::query_scalar(
            r#"
            update tnd.destination_state
            set state = $3, revision = revision + 1, updated_at = now()
            where namespace = $1 and name = $2 and revision = $4
            returning revision
            "#,
        )
        .bind(namespace)
        .bind(name)
        .bind(state)
        .bind(expected_revision)
        .fetch_optional(&mut *tx)
        .await?
    };

    tx.commit().await?;

    Ok(new_revision)
}

/// Removes the state of one stream. Returns whether a row existed.
pub async fn delete_destination_state(
    pool: &PgPool,
    namespace: &str,
    name: &str,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        delete from tnd.destination_state
        where namespace = $1 and name = $2
        "#,
    )
    .bind(namespace)
    .bind(name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

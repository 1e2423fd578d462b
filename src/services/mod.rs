//! Database operations shared by several route modules. Handlers own request
//! parsing and authorization; everything here takes a connection and returns
//! entities or projections.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::{app_error::AppError, models::UserEntity, schema};

pub mod articles;
pub mod consultations;
pub mod messages;
pub mod users;

/// Loads users by id in one query, keyed by id. Duplicate ids are fine.
pub async fn users_by_id(
    conn: &mut AsyncPgConnection,
    mut ids: Vec<i64>,
) -> Result<HashMap<i64, UserEntity>, AppError> {
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<UserEntity> = schema::users::table
        .filter(schema::users::id.eq_any(&ids))
        .select(UserEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load users")?;

    Ok(rows.into_iter().map(|user| (user.id, user)).collect())
}

pub async fn user_exists(conn: &mut AsyncPgConnection, id: i64) -> Result<bool, AppError> {
    let count: i64 = schema::users::table
        .find(id)
        .count()
        .get_result(conn)
        .await
        .context("Failed to check user")?;
    Ok(count > 0)
}

/// `%term%` for ILIKE with the wildcard characters in `term` escaped.
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Midnight UTC at the start of `date`.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Midnight UTC after `date`, for inclusive `to_date` filters.
pub fn day_after(date: NaiveDate) -> DateTime<Utc> {
    day_start(date.checked_add_days(Days::new(1)).unwrap_or(date))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_pattern("fever"), "%fever%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn date_bounds_cover_the_whole_day() {
        let date = NaiveDate::from_ymd_opt(2025, 7, 31).unwrap();
        assert_eq!(day_start(date).to_rfc3339(), "2025-07-31T00:00:00+00:00");
        assert_eq!(day_after(date).to_rfc3339(), "2025-08-01T00:00:00+00:00");
    }
}

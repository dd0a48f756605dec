use std::convert::TryFrom;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::models::{FileInfo, Record, Role, Row, Session, User};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        token TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY,
        employee_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        uploaded_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        row_index INTEGER NOT NULL,
        data TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT '',
        reason TEXT NOT NULL DEFAULT '',
        updated_at TEXT
    )",
];

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    role: String,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role: row.role.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    token: String,
    user_id: i64,
    username: String,
    role: String,
    expires_at: i64,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: i64,
    file_id: i64,
    data: String,
    status: String,
    reason: String,
    updated_at: Option<String>,
}

impl TryFrom<RecordRow> for Record {
    type Error = anyhow::Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        let data: Row = serde_json::from_str(&row.data)
            .with_context(|| format!("record {} has malformed data", row.id))?;
        Ok(Record {
            id: row.id,
            file_id: row.file_id,
            data,
            status: row.status.parse()?,
            reason: row.reason,
            updated_at: row.updated_at,
        })
    }
}

pub async fn setup_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid DATABASE_URL: {}", database_url))?
        .create_if_missing(true)
        .foreign_keys(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?)
}

pub async fn setup_db(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA.iter() {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// True when `err` came from a UNIQUE constraint, e.g. a taken username.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

// Users

pub async fn write_user(pool: &SqlitePool, username: &str, password_hash: &str, role: Role) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO users(username, password_hash, role, created_at) VALUES(?, ?, ?, ?)",
    )
    .bind(username)
    .bind(password_hash)
    .bind(role.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn read_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    sqlx::query_as::<_, UserRow>("SELECT id, username, password_hash, role FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(User::try_from)
        .transpose()
}

pub async fn read_user_by_name(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    sqlx::query_as::<_, UserRow>(
        "SELECT id, username, password_hash, role FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?
    .map(User::try_from)
    .transpose()
}

pub async fn read_users_with_role(pool: &SqlitePool, role: Role) -> Result<Vec<User>> {
    sqlx::query_as::<_, UserRow>(
        "SELECT id, username, password_hash, role FROM users WHERE role = ? ORDER BY id",
    )
    .bind(role.as_str())
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(User::try_from)
    .collect()
}

pub async fn count_users_with_role(pool: &SqlitePool, role: Role) -> Result<i64> {
    let rec: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE role = ?")
        .bind(role.as_str())
        .fetch_one(pool)
        .await?;
    Ok(rec.0)
}

/// Removes a user together with their sessions, files and records.
pub async fn delete_user(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// Sessions

pub async fn write_session(pool: &SqlitePool, token: &str, user_id: i64, ttl_hours: i64) -> Result<()> {
    let expires_at = (Utc::now() + Duration::hours(ttl_hours)).timestamp();
    sqlx::query("INSERT INTO sessions(token, user_id, expires_at) VALUES(?, ?, ?)")
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;
    Ok(())
}

/// Looks up a live session. Expired sessions are deleted and reported as absent.
pub async fn read_session(pool: &SqlitePool, token: &str) -> Result<Option<Session>> {
    let row = sqlx::query_as::<_, SessionRow>(
        "SELECT s.token, s.user_id, u.username, u.role, s.expires_at
        FROM sessions s JOIN users u ON u.id = s.user_id
        WHERE s.token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    if row.expires_at <= Utc::now().timestamp() {
        debug!(user_id = row.user_id, "session expired");
        delete_session(pool, token).await?;
        return Ok(None);
    }

    Ok(Some(Session {
        token: row.token,
        user_id: row.user_id,
        username: row.username,
        role: row.role.parse()?,
    }))
}

pub async fn delete_session(pool: &SqlitePool, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn purge_expired_sessions(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// Files and records

/// Stores an uploaded sheet for an employee. Returns the new file and its row count.
pub async fn write_file(pool: &SqlitePool, employee_id: i64, filename: &str, rows: &[Row]) -> Result<(FileInfo, u64)> {
    let mut tx = pool.begin().await?;

    let file_id = sqlx::query("INSERT INTO files(employee_id, filename, uploaded_at) VALUES(?, ?, ?)")
        .bind(employee_id)
        .bind(filename)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

    let mut count = 0;
    for (index, row) in rows.iter().enumerate() {
        sqlx::query("INSERT INTO records(file_id, row_index, data) VALUES(?, ?, ?)")
            .bind(file_id)
            .bind(index as i64)
            .bind(serde_json::to_string(row)?)
            .execute(&mut *tx)
            .await?;
        count += 1;
    }

    tx.commit().await?;

    Ok((
        FileInfo {
            id: file_id,
            filename: filename.to_string(),
        },
        count,
    ))
}

pub async fn read_files(pool: &SqlitePool, employee_id: i64) -> Result<Vec<FileInfo>> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, filename FROM files WHERE employee_id = ? ORDER BY id")
            .bind(employee_id)
            .fetch_all(pool)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(id, filename)| FileInfo { id, filename })
        .collect())
}

/// An employee's records in upload order, optionally limited to one file.
pub async fn read_records(pool: &SqlitePool, employee_id: i64, file_id: Option<i64>) -> Result<Vec<Record>> {
    sqlx::query_as::<_, RecordRow>(
        "SELECT r.id, r.file_id, r.data, r.status, r.reason, r.updated_at
        FROM records r JOIN files f ON f.id = r.file_id
        WHERE f.employee_id = ? AND (? IS NULL OR r.file_id = ?)
        ORDER BY r.file_id, r.row_index",
    )
    .bind(employee_id)
    .bind(file_id)
    .bind(file_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Record::try_from)
    .collect()
}

/// A record, but only if it belongs to `employee_id`.
pub async fn read_record(pool: &SqlitePool, id: i64, employee_id: i64) -> Result<Option<Record>> {
    sqlx::query_as::<_, RecordRow>(
        "SELECT r.id, r.file_id, r.data, r.status, r.reason, r.updated_at
        FROM records r JOIN files f ON f.id = r.file_id
        WHERE r.id = ? AND f.employee_id = ?",
    )
    .bind(id)
    .bind(employee_id)
    .fetch_optional(pool)
    .await?
    .map(Record::try_from)
    .transpose()
}

pub async fn update_record_status(pool: &SqlitePool, record: &Record) -> Result<()> {
    sqlx::query("UPDATE records SET status = ?, reason = ?, updated_at = ? WHERE id = ?")
        .bind(record.status.as_str())
        .bind(&record.reason)
        .bind(&record.updated_at)
        .bind(record.id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drops every file assigned to an employee; records go with them.
pub async fn clear_employee_data(pool: &SqlitePool, employee_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM files WHERE employee_id = ?")
        .bind(employee_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_assigned_employees(pool: &SqlitePool) -> Result<i64> {
    let rec: (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT f.employee_id) FROM files f
        WHERE EXISTS (SELECT 1 FROM records r WHERE r.file_id = f.id)",
    )
    .fetch_one(pool)
    .await?;
    Ok(rec.0)
}

pub async fn count_records(pool: &SqlitePool) -> Result<i64> {
    let rec: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
        .fetch_one(pool)
        .await?;
    Ok(rec.0)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::models::RecordStatus;
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    pub async fn setup_test_db() -> Result<SqlitePool> {
        let db_name: String = random_name();
        let pool = setup_pool(&format!("sqlite:///tmp/{}_test.db", db_name)).await?;
        setup_db(&pool).await?;

        Ok(pool)
    }

    fn random_name() -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect()
    }

    pub fn row(cells: &[(&str, &str)]) -> Row {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub async fn setup_employee(pool: &SqlitePool, username: &str) -> Result<i64> {
        write_user(pool, username, "not-a-real-hash", Role::Employee).await
    }

    #[tokio::test]
    async fn test_write_and_read_user() -> Result<()> {
        let pool = setup_test_db().await?;

        let id = write_user(&pool, "jdoe", "hash", Role::Employee).await?;

        let user = read_user(&pool, id).await?.unwrap();
        assert_eq!(
            user,
            User {
                id,
                username: "jdoe".to_string(),
                password_hash: "hash".to_string(),
                role: Role::Employee,
            }
        );
        assert_eq!(read_user_by_name(&pool, "jdoe").await?, Some(user));
        assert_eq!(read_user_by_name(&pool, "nobody").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_username_is_unique_violation() -> Result<()> {
        let pool = setup_test_db().await?;

        write_user(&pool, "jdoe", "hash", Role::Employee).await?;
        let err = write_user(&pool, "jdoe", "other", Role::Employee)
            .await
            .unwrap_err();

        assert!(is_unique_violation(&err));

        Ok(())
    }

    #[tokio::test]
    async fn test_read_users_with_role() -> Result<()> {
        let pool = setup_test_db().await?;

        write_user(&pool, "admin", "hash", Role::Admin).await?;
        setup_employee(&pool, "alice").await?;
        setup_employee(&pool, "bob").await?;

        let employees = read_users_with_role(&pool, Role::Employee).await?;
        let names: Vec<&str> = employees.iter().map(|u| u.username.as_str()).collect();

        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(count_users_with_role(&pool, Role::Admin).await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_session_lifecycle() -> Result<()> {
        let pool = setup_test_db().await?;
        let id = setup_employee(&pool, "alice").await?;

        write_session(&pool, "live", id, 1).await?;
        write_session(&pool, "stale", id, -1).await?;

        let session = read_session(&pool, "live").await?.unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(session.role, Role::Employee);

        assert_eq!(read_session(&pool, "stale").await?, None);
        assert_eq!(purge_expired_sessions(&pool).await?, 0);

        delete_session(&pool, "live").await?;
        assert_eq!(read_session(&pool, "live").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_write_file_and_read_records() -> Result<()> {
        let pool = setup_test_db().await?;
        let id = setup_employee(&pool, "alice").await?;

        let rows = vec![
            row(&[("Company", "Acme"), ("City", "Lyon")]),
            row(&[("Company", "Globex")]),
        ];
        let (file, count) = write_file(&pool, id, "leads.xlsx", &rows).await?;

        assert_eq!(count, 2);
        assert_eq!(read_files(&pool, id).await?, vec![file.clone()]);

        let records = read_records(&pool, id, None).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, rows[0]);
        assert_eq!(records[1].data, rows[1]);
        assert_eq!(records[0].status, RecordStatus::Unset);
        assert_eq!(records[0].file_id, file.id);

        assert!(read_records(&pool, id, Some(file.id + 1)).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_read_record_is_scoped_to_owner() -> Result<()> {
        let pool = setup_test_db().await?;
        let alice = setup_employee(&pool, "alice").await?;
        let bob = setup_employee(&pool, "bob").await?;

        write_file(&pool, alice, "a.xlsx", &[row(&[("A", "1")])]).await?;
        let record_id = read_records(&pool, alice, None).await?[0].id;

        assert!(read_record(&pool, record_id, alice).await?.is_some());
        assert!(read_record(&pool, record_id, bob).await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_update_record_status() -> Result<()> {
        let pool = setup_test_db().await?;
        let id = setup_employee(&pool, "alice").await?;
        write_file(&pool, id, "a.xlsx", &[row(&[("A", "1")])]).await?;

        let mut record = read_records(&pool, id, None).await?.remove(0);
        record.status = RecordStatus::Lose;
        record.reason = "went with a competitor".to_string();
        record.updated_at = Some(Utc::now().to_rfc3339());
        update_record_status(&pool, &record).await?;

        let stored = read_record(&pool, record.id, id).await?.unwrap();
        assert_eq!(stored, record);

        Ok(())
    }

    #[tokio::test]
    async fn test_clear_and_delete_cascade() -> Result<()> {
        let pool = setup_test_db().await?;
        let alice = setup_employee(&pool, "alice").await?;
        let bob = setup_employee(&pool, "bob").await?;

        write_file(&pool, alice, "a.xlsx", &[row(&[("A", "1")]), row(&[("A", "2")])]).await?;
        write_file(&pool, bob, "b.xlsx", &[row(&[("B", "1")])]).await?;
        write_session(&pool, "bob-token", bob, 1).await?;

        assert_eq!(count_assigned_employees(&pool).await?, 2);
        assert_eq!(count_records(&pool).await?, 3);

        assert_eq!(clear_employee_data(&pool, alice).await?, 1);
        assert_eq!(count_records(&pool).await?, 1);
        assert_eq!(count_assigned_employees(&pool).await?, 1);

        assert!(delete_user(&pool, bob).await?);
        assert_eq!(count_records(&pool).await?, 0);
        assert_eq!(read_session(&pool, "bob-token").await?, None);
        assert!(!delete_user(&pool, bob).await?);

        Ok(())
    }
}

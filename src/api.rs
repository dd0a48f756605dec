use bytes::BufMut;
use futures_util::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::{info, instrument, warn};
use warp::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, SET_COOKIE};
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::auth::{self, with_role};
use crate::config::Settings;
use crate::db;
use crate::error::ApiError;
use crate::models::{Employee, FileInfo, Record, Role, Session, User};
use crate::records::{self, RecordQuery, RecordStats, StatusChange, StatusFilter};
use crate::spreadsheet;

const CSV_CONTENT_TYPE: &str = "text/csv;charset=utf-8";
const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct NewEmployee {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmployeeSearch {
    pub search: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmployeeRecordQuery {
    pub file_id: Option<i64>,
    pub search: Option<String>,
    #[serde(default)]
    pub status: StatusFilter,
}

impl EmployeeRecordQuery {
    fn record_query(&self) -> RecordQuery {
        RecordQuery {
            search: self.search.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<ExportFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmployeeList {
    pub employees: Vec<Employee>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file: FileInfo,
    pub rows: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignedData {
    pub employee: Employee,
    pub files: Vec<FileInfo>,
    pub records: Vec<Record>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordList {
    pub records: Vec<Record>,
    pub stats: RecordStats,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_employees: i64,
    pub assigned_count: i64,
    pub total_rows: i64,
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(1024 * 16).and(warp::body::json())
}

fn with_pool(pool: SqlitePool) -> impl Filter<Extract = (SqlitePool,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || pool.clone())
}

fn with_settings(settings: Settings) -> impl Filter<Extract = (Settings,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || settings.clone())
}

/// Every route of the admin and employee consoles. Callers add `recover`.
pub fn routes(pool: SqlitePool, settings: Settings) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    health()
        .or(login(pool.clone(), settings.clone()))
        .or(logout(pool.clone()))
        .or(list_employees(pool.clone()))
        .or(create_employee(pool.clone()))
        .or(delete_employee(pool.clone()))
        .or(upload_file(pool.clone(), settings))
        .or(assigned_records(pool.clone()))
        .or(clear_assigned(pool.clone()))
        .or(export_assigned(pool.clone()))
        .or(admin_stats(pool.clone()))
        .or(employee_files(pool.clone()))
        .or(employee_records(pool.clone()))
        .or(update_record(pool.clone()))
        .or(export_records(pool))
}

// Filters
pub fn health() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("health").and(warp::get()).map(|| "ok")
}

pub fn login(pool: SqlitePool, settings: Settings) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "auth" / "login")
        .and(warp::post())
        .and(json_body::<LoginRequest>())
        .and(with_pool(pool))
        .and(with_settings(settings))
        .and_then(login_handler)
}

pub fn logout(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "auth" / "logout")
        .and(warp::post())
        .and(auth::optional_token())
        .and(with_pool(pool))
        .and_then(logout_handler)
}

pub fn list_employees(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "employees")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Admin))
        .and(warp::query::<EmployeeSearch>())
        .and(with_pool(pool))
        .and_then(list_employees_handler)
}

pub fn create_employee(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "employees")
        .and(warp::post())
        .and(with_role(pool.clone(), Role::Admin))
        .and(json_body::<NewEmployee>())
        .and(with_pool(pool))
        .and_then(create_employee_handler)
}

pub fn delete_employee(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "employees" / i64)
        .and(warp::delete())
        .and(with_role(pool.clone(), Role::Admin))
        .and(with_pool(pool))
        .and_then(delete_employee_handler)
}

pub fn upload_file(pool: SqlitePool, settings: Settings) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "files" / "upload")
        .and(warp::post())
        .and(with_role(pool.clone(), Role::Admin))
        .and(warp::multipart::form().max_length(settings.max_upload_bytes))
        .and(with_pool(pool))
        .and_then(upload_handler)
}

pub fn assigned_records(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "employees" / i64 / "records")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Admin))
        .and(with_pool(pool))
        .and_then(assigned_records_handler)
}

pub fn clear_assigned(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "employees" / i64 / "records")
        .and(warp::delete())
        .and(with_role(pool.clone(), Role::Admin))
        .and(with_pool(pool))
        .and_then(clear_assigned_handler)
}

pub fn export_assigned(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "employees" / i64 / "export")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Admin))
        .and(warp::query::<ExportQuery>())
        .and(with_pool(pool))
        .and_then(export_assigned_handler)
}

pub fn admin_stats(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "stats")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Admin))
        .and(with_pool(pool))
        .and_then(admin_stats_handler)
}

pub fn employee_files(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "employee" / "files")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Employee))
        .and(with_pool(pool))
        .and_then(employee_files_handler)
}

pub fn employee_records(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "employee" / "records")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Employee))
        .and(warp::query::<EmployeeRecordQuery>())
        .and(with_pool(pool))
        .and_then(employee_records_handler)
}

pub fn update_record(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "employee" / "records" / i64)
        .and(warp::patch())
        .and(with_role(pool.clone(), Role::Employee))
        .and(json_body::<StatusChange>())
        .and(with_pool(pool))
        .and_then(update_record_handler)
}

pub fn export_records(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "employee" / "records" / "export")
        .and(warp::get())
        .and(with_role(pool.clone(), Role::Employee))
        .and(warp::query::<EmployeeRecordQuery>())
        .and(with_pool(pool))
        .and_then(export_records_handler)
}

// Handlers
#[instrument(skip(req, pool, settings), fields(username = %req.username))]
async fn login_handler(req: LoginRequest, pool: SqlitePool, settings: Settings) -> Result<Response, Rejection> {
    let user = db::read_user_by_name(&pool, &req.username)
        .await
        .map_err(ApiError::Internal)?
        .filter(|user| auth::verify_password(&req.password, &user.password_hash))
        .ok_or(ApiError::InvalidCredentials)?;

    let token = auth::new_token();
    db::write_session(&pool, &token, user.id, settings.session_ttl_hours)
        .await
        .map_err(ApiError::Internal)?;
    info!(role = %user.role, "logged in");

    let cookie = auth::session_cookie(&token, settings.session_ttl_hours);
    let body = LoginResponse {
        token,
        username: user.username,
        role: user.role,
    };
    Ok(warp::reply::with_header(warp::reply::json(&body), SET_COOKIE, cookie).into_response())
}

async fn logout_handler(token: Option<String>, pool: SqlitePool) -> Result<Response, Rejection> {
    if let Some(token) = token {
        if let Err(e) = db::delete_session(&pool, &token).await {
            warn!(error = ?e, "failed to delete session on logout");
        }
    }
    let body = serde_json::json!({ "ok": true });
    Ok(warp::reply::with_header(warp::reply::json(&body), SET_COOKIE, auth::expired_cookie()).into_response())
}

#[instrument(skip(session, pool), fields(admin = %session.username))]
async fn list_employees_handler(session: Session, query: EmployeeSearch, pool: SqlitePool) -> Result<Response, Rejection> {
    let needle = query
        .search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    let employees: Vec<Employee> = db::read_users_with_role(&pool, Role::Employee)
        .await
        .map_err(ApiError::Internal)?
        .into_iter()
        .filter(|u| needle.is_empty() || u.username.to_lowercase().contains(&needle))
        .map(Employee::from)
        .collect();

    Ok(warp::reply::json(&EmployeeList { employees }).into_response())
}

#[instrument(skip(session, new, pool), fields(admin = %session.username, username = %new.username))]
async fn create_employee_handler(session: Session, new: NewEmployee, pool: SqlitePool) -> Result<Response, Rejection> {
    let username = new.username.trim();
    if username.is_empty() || new.password.is_empty() {
        return Err(ApiError::BadRequest("Enter username and password".to_string()).into());
    }

    let hash = auth::hash_password(&new.password)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("hashing password: {}", e)))?;

    let id = match db::write_user(&pool, username, &hash, Role::Employee).await {
        Ok(id) => id,
        Err(e) if db::is_unique_violation(&e) => {
            return Err(ApiError::Conflict("Username already exists".to_string()).into())
        }
        Err(e) => return Err(ApiError::Internal(e).into()),
    };
    info!(employee_id = id, "employee created");

    let employee = Employee {
        id,
        username: username.to_string(),
        role: Role::Employee,
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "employee": employee })),
        StatusCode::CREATED,
    )
    .into_response())
}

#[instrument(skip(session, pool), fields(admin = %session.username))]
async fn delete_employee_handler(id: i64, session: Session, pool: SqlitePool) -> Result<Response, Rejection> {
    require_employee(&pool, id).await?;
    db::delete_user(&pool, id).await.map_err(ApiError::Internal)?;
    info!(employee_id = id, "employee deleted");

    Ok(warp::reply::json(&serde_json::json!({ "deleted": true })).into_response())
}

#[instrument(skip(session, form, pool), fields(admin = %session.username))]
async fn upload_handler(session: Session, form: FormData, pool: SqlitePool) -> Result<Response, Rejection> {
    let upload = read_upload(form).await?;

    let employee_id = upload
        .employee_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Select an employee".to_string()))?
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("Select an employee".to_string()))?;

    let (filename, bytes) = upload
        .file
        .ok_or_else(|| ApiError::BadRequest("Choose a file".to_string()))?;

    let employee = require_employee(&pool, employee_id).await?;

    if !spreadsheet::is_supported_upload(&filename) {
        return Err(ApiError::from(spreadsheet::SpreadsheetError::UnsupportedType).into());
    }
    let rows = spreadsheet::parse_workbook(&bytes).map_err(ApiError::from)?;

    let (file, count) = db::write_file(&pool, employee.id, &filename, &rows)
        .await
        .map_err(ApiError::Internal)?;
    info!(employee = %employee.username, file = %file.filename, rows = count, "file allocated");

    Ok(warp::reply::with_status(
        warp::reply::json(&UploadResponse { file, rows: count }),
        StatusCode::CREATED,
    )
    .into_response())
}

#[derive(Default)]
struct Upload {
    employee_id: Option<String>,
    file: Option<(String, Vec<u8>)>,
}

async fn read_upload(form: FormData) -> Result<Upload, ApiError> {
    let mut upload = Upload::default();
    futures_util::pin_mut!(form);

    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed upload: {}", e)))?
    {
        let name = part.name().to_string();
        let filename = part.filename().map(String::from);

        let mut buf: Vec<u8> = Vec::new();
        let stream = part.stream();
        futures_util::pin_mut!(stream);
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Malformed upload: {}", e)))?
        {
            buf.put(chunk);
        }

        match name.as_str() {
            "employeeId" => upload.employee_id = Some(String::from_utf8_lossy(&buf).into_owned()),
            "file" => {
                if let Some(filename) = filename.filter(|f| !f.is_empty()) {
                    upload.file = Some((filename, buf));
                }
            }
            _ => {}
        }
    }

    Ok(upload)
}

#[instrument(skip(session, pool), fields(admin = %session.username))]
async fn assigned_records_handler(id: i64, session: Session, pool: SqlitePool) -> Result<Response, Rejection> {
    let employee = require_employee(&pool, id).await?;
    let files = db::read_files(&pool, id).await.map_err(ApiError::Internal)?;
    let records = db::read_records(&pool, id, None)
        .await
        .map_err(ApiError::Internal)?;

    Ok(warp::reply::json(&AssignedData {
        employee: employee.into(),
        files,
        records,
    })
    .into_response())
}

#[instrument(skip(session, pool), fields(admin = %session.username))]
async fn clear_assigned_handler(id: i64, session: Session, pool: SqlitePool) -> Result<Response, Rejection> {
    require_employee(&pool, id).await?;
    let files = db::clear_employee_data(&pool, id)
        .await
        .map_err(ApiError::Internal)?;
    info!(employee_id = id, files, "assigned data cleared");

    Ok(warp::reply::json(&serde_json::json!({ "cleared": files })).into_response())
}

#[instrument(skip(session, pool), fields(admin = %session.username))]
async fn export_assigned_handler(id: i64, session: Session, query: ExportQuery, pool: SqlitePool) -> Result<Response, Rejection> {
    let employee = require_employee(&pool, id).await?;
    let records = db::read_records(&pool, id, None)
        .await
        .map_err(ApiError::Internal)?;
    if records.is_empty() {
        return Err(ApiError::NotFound("No data to export".to_string()).into());
    }

    let refs: Vec<&Record> = records.iter().collect();
    let (columns, rows) = spreadsheet::records_table(&refs);
    let stem = format!("{}_data", safe_filename(&employee.username));

    let reply = match query.format.unwrap_or(ExportFormat::Csv) {
        ExportFormat::Csv => attachment(
            spreadsheet::to_csv(&columns, &rows).into_bytes(),
            CSV_CONTENT_TYPE,
            &format!("{}.csv", stem),
        ),
        ExportFormat::Xlsx => attachment(
            spreadsheet::to_xlsx(&columns, &rows).map_err(ApiError::from)?,
            XLSX_CONTENT_TYPE,
            &format!("{}.xlsx", stem),
        ),
    };
    Ok(reply)
}

async fn admin_stats_handler(_session: Session, pool: SqlitePool) -> Result<Response, Rejection> {
    let stats = AdminStats {
        total_employees: db::count_users_with_role(&pool, Role::Employee)
            .await
            .map_err(ApiError::Internal)?,
        assigned_count: db::count_assigned_employees(&pool)
            .await
            .map_err(ApiError::Internal)?,
        total_rows: db::count_records(&pool).await.map_err(ApiError::Internal)?,
    };
    Ok(warp::reply::json(&stats).into_response())
}

async fn employee_files_handler(session: Session, pool: SqlitePool) -> Result<Response, Rejection> {
    let files = db::read_files(&pool, session.user_id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(warp::reply::json(&FileList { files }).into_response())
}

#[instrument(skip(session, pool), fields(username = %session.username))]
async fn employee_records_handler(session: Session, query: EmployeeRecordQuery, pool: SqlitePool) -> Result<Response, Rejection> {
    let all = db::read_records(&pool, session.user_id, query.file_id)
        .await
        .map_err(ApiError::Internal)?;

    let stats = RecordStats::from_records(&all);
    let records = records::filter_records(&all, &query.record_query())
        .into_iter()
        .cloned()
        .collect();

    Ok(warp::reply::json(&RecordList { records, stats }).into_response())
}

#[instrument(skip(session, change, pool), fields(username = %session.username, status = %change.status))]
async fn update_record_handler(id: i64, session: Session, change: StatusChange, pool: SqlitePool) -> Result<Response, Rejection> {
    let mut record = db::read_record(&pool, id, session.user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("Record not found".to_string()))?;

    records::apply_status(&mut record, &change, chrono::Utc::now()).map_err(ApiError::from)?;
    db::update_record_status(&pool, &record)
        .await
        .map_err(ApiError::Internal)?;
    info!(record_id = id, "status updated");

    Ok(warp::reply::json(&record).into_response())
}

#[instrument(skip(session, pool), fields(username = %session.username))]
async fn export_records_handler(session: Session, query: EmployeeRecordQuery, pool: SqlitePool) -> Result<Response, Rejection> {
    let all = db::read_records(&pool, session.user_id, query.file_id)
        .await
        .map_err(ApiError::Internal)?;

    let filtered = records::filter_records(&all, &query.record_query());
    if filtered.is_empty() {
        return Err(ApiError::NotFound("No data to export".to_string()).into());
    }

    let (columns, rows) = spreadsheet::records_table(&filtered);
    Ok(attachment(
        spreadsheet::to_csv(&columns, &rows).into_bytes(),
        CSV_CONTENT_TYPE,
        &format!("records_{}.csv", safe_filename(&session.username)),
    ))
}

async fn require_employee(pool: &SqlitePool, id: i64) -> Result<User, ApiError> {
    db::read_user(pool, id)
        .await?
        .filter(|u| u.role == Role::Employee)
        .ok_or_else(|| ApiError::NotFound("Employee not found".to_string()))
}

fn attachment(body: Vec<u8>, content_type: &str, filename: &str) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", filename);
    let reply = warp::reply::with_header(body, CONTENT_TYPE, content_type);
    warp::reply::with_header(reply, CONTENT_DISPOSITION, disposition).into_response()
}

// Usernames end up in header values; keep them to a plain ASCII subset.
fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

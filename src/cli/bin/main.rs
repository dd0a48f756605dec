// Macros
#[macro_use]
extern crate lazy_static;

// Std
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// Crates
use anyhow::{anyhow, bail, Context, Result};
use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use dotenv::dotenv;
use prettytable::{color, row, Attr, Cell, Row, Table};
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};

// Local
use leadsheet::api::{
    AdminStats, AssignedData, EmployeeList, FileList, LoginResponse, RecordList, UploadResponse,
};
use leadsheet::local::{LocalStore, CURRENT_EMPLOYEE_KEY, ROLE_KEY};
use leadsheet::records::{RecordQuery, StatusChange, StatusFilter};
use leadsheet::spreadsheet;
use leadsheet::{Employee, Record, RecordStatus, Role};

lazy_static! {
    static ref STATUS_COLORS: HashMap<RecordStatus, color::Color> = vec![
        (RecordStatus::Win, color::GREEN),
        (RecordStatus::Lose, color::RED),
        (RecordStatus::Pending, color::YELLOW),
    ]
    .into_iter()
    .collect();
}

const DEFAULT_LOCAL_STORE: &str = "leadsheet-local.json";

struct Remote {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl Remote {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow!("No token. Run `leadsheet login` and set LEADSHEET_TOKEN."))
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let res = self
            .client
            .get(&self.url(path))
            .bearer_auth(self.token()?)
            .query(query)
            .send()
            .await?;
        check(res).await
    }
}

fn filter_args() -> [Arg; 3] {
    [
        Arg::new("file").long("file").value_name("file-id").help("Only rows from this file."),
        Arg::new("search").short('s').long("search").help("Case-insensitive text search."),
        Arg::new("status")
            .long("status")
            .help("All, Win, Lose, Pending or None.")
            .default_value("All"),
    ]
}

fn cli() -> Command {
    Command::new("leadsheet")
        .version(crate_version!())
        .about("Admin and employee consoles for assigned spreadsheet rows.")
        .subcommand_required(true)
        .arg(
            Arg::new("token")
                .long("token")
                .global(true)
                .help("Session token; defaults to LEADSHEET_TOKEN."),
        )
        .subcommand(
            Command::new("login")
                .about("Log in and print a session token.")
                .arg(Arg::new("username").required(true))
                .arg(Arg::new("password").required(true))
                .arg(
                    Arg::new("admin")
                        .long("admin")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("employee")
                        .help("Log in to the admin console (the default)."),
                )
                .arg(
                    Arg::new("employee")
                        .long("employee")
                        .action(ArgAction::SetTrue)
                        .help("Log in to the employee console."),
                ),
        )
        .subcommand(Command::new("logout").about("End the current session."))
        .subcommand(
            Command::new("employees")
                .about("List employees.")
                .arg(Arg::new("search").short('s').long("search")),
        )
        .subcommand(
            Command::new("add-employee")
                .about("Create an employee account.")
                .arg(Arg::new("username").required(true))
                .arg(Arg::new("password").required(true)),
        )
        .subcommand(
            Command::new("remove-employee")
                .about("Delete an employee and everything assigned to them.")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(
            Command::new("upload")
                .about("Allocate a workbook to an employee.")
                .arg(Arg::new("employee-id").required(true))
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("assigned")
                .about("Show the rows assigned to an employee.")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(
            Command::new("clear")
                .about("Remove everything assigned to an employee.")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(
            Command::new("export")
                .about("Download an employee's rows.")
                .arg(Arg::new("id").required(true))
                .arg(
                    Arg::new("format")
                        .long("format")
                        .value_parser(["csv", "xlsx"])
                        .default_value("csv"),
                )
                .arg(Arg::new("out").short('o').long("out")),
        )
        .subcommand(Command::new("stats").about("Console totals."))
        .subcommand(Command::new("files").about("List your assigned files."))
        .subcommand(
            Command::new("records")
                .about("List your rows.")
                .args(filter_args()),
        )
        .subcommand(
            Command::new("set-status")
                .about("Mark a row Win, Lose or Pending with a reason.")
                .arg(Arg::new("record-id").required(true))
                .arg(Arg::new("status").required(true))
                .arg(Arg::new("reason").required(true)),
        )
        .subcommand(
            Command::new("my-export")
                .about("Download your filtered rows as CSV.")
                .args(filter_args())
                .arg(Arg::new("out").short('o').long("out")),
        )
        .subcommand(
            Command::new("local")
                .about("Work on a local store instead of the server.")
                .subcommand_required(true)
                .arg(
                    Arg::new("store")
                        .long("store")
                        .global(true)
                        .help("Store file; defaults to LOCAL_STORE."),
                )
                .subcommand(
                    Command::new("assign")
                        .about("Admin: assign a workbook to an employee.")
                        .arg(Arg::new("admin-user").required(true))
                        .arg(Arg::new("admin-password").required(true))
                        .arg(Arg::new("employee").required(true))
                        .arg(Arg::new("path").required(true)),
                )
                .subcommand(
                    Command::new("clear")
                        .about("Admin: drop an employee's dataset.")
                        .arg(Arg::new("admin-user").required(true))
                        .arg(Arg::new("admin-password").required(true))
                        .arg(Arg::new("employee").required(true)),
                )
                .subcommand(
                    Command::new("records")
                        .about("List an employee's rows.")
                        .arg(Arg::new("employee").required(true))
                        .args(filter_args()),
                )
                .subcommand(
                    Command::new("set-status")
                        .about("Annotate one row.")
                        .arg(Arg::new("employee").required(true))
                        .arg(Arg::new("row").required(true))
                        .arg(Arg::new("status").required(true))
                        .arg(Arg::new("reason").required(true)),
                )
                .subcommand(
                    Command::new("export")
                        .about("Write an employee's filtered rows to CSV.")
                        .arg(Arg::new("employee").required(true))
                        .args(filter_args())
                        .arg(Arg::new("out").short('o').long("out")),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let matches = cli().get_matches();

    if let Some(("local", sub)) = matches.subcommand() {
        return run_local(sub);
    }

    let base_url: String = env::var("BASE_URL").context("BASE_URL env var must be set!")?;
    let token = matches
        .get_one::<String>("token")
        .cloned()
        .or_else(|| env::var("LEADSHEET_TOKEN").ok());
    let remote = Remote {
        base_url,
        client: Client::new(),
        token,
    };

    match matches.subcommand() {
        Some(("login", sub)) => login(&remote, sub).await,
        Some(("logout", _)) => logout(&remote).await,
        Some(("employees", sub)) => list_employees(&remote, sub).await,
        Some(("add-employee", sub)) => add_employee(&remote, sub).await,
        Some(("remove-employee", sub)) => remove_employee(&remote, sub).await,
        Some(("upload", sub)) => upload(&remote, sub).await,
        Some(("assigned", sub)) => assigned(&remote, sub).await,
        Some(("clear", sub)) => clear(&remote, sub).await,
        Some(("export", sub)) => export_assigned(&remote, sub).await,
        Some(("stats", _)) => stats(&remote).await,
        Some(("files", _)) => files(&remote).await,
        Some(("records", sub)) => my_records(&remote, sub).await,
        Some(("set-status", sub)) => set_status(&remote, sub).await,
        Some(("my-export", sub)) => my_export(&remote, sub).await,
        _ => unreachable!("clap requires a subcommand"),
    }
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument: {}", name))
}

fn id_arg(matches: &ArgMatches, name: &str) -> Result<i64> {
    let value = arg(matches, name)?;
    value
        .parse::<i64>()
        .with_context(|| format!("{} must be a number, got '{}'", name, value))
}

fn record_query(matches: &ArgMatches) -> Result<RecordQuery> {
    Ok(RecordQuery {
        search: matches.get_one::<String>("search").cloned(),
        status: arg(matches, "status")?.parse::<StatusFilter>()?,
    })
}

fn filter_params(matches: &ArgMatches) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    for key in ["file", "search", "status"] {
        if let Some(value) = matches.get_one::<String>(key) {
            let name = if key == "file" { "file_id" } else { key };
            params.push((name, value.clone()));
        }
    }
    params
}

fn status_change(matches: &ArgMatches) -> Result<StatusChange> {
    let status: RecordStatus = arg(matches, "status")?.parse()?;
    Ok(StatusChange {
        status,
        reason: arg(matches, "reason")?.to_string(),
    })
}

/// Turns an error reply into `Err` with the server's message.
async fn check(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let message = res
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            bail!("{} ({}); log in with the right console", message, status)
        }
        _ => bail!("{}", message),
    }
}

async fn login(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let wanted = if matches.get_flag("employee") {
        Role::Employee
    } else {
        Role::Admin
    };
    let body = serde_json::json!({
        "username": arg(matches, "username")?,
        "password": arg(matches, "password")?,
    });

    let res = remote
        .client
        .post(&remote.url("/api/auth/login"))
        .json(&body)
        .send()
        .await?;
    let login = check(res).await?.json::<LoginResponse>().await?;

    if login.role != wanted {
        // Drop the session the wrong console just opened.
        let res = remote
            .client
            .post(&remote.url("/api/auth/logout"))
            .bearer_auth(&login.token)
            .send()
            .await;
        if let Err(e) = res {
            eprintln!("Warning: {}", e);
        }
        match wanted {
            Role::Employee => bail!("Use Admin login for admin accounts"),
            Role::Admin => bail!("Invalid Admin credentials"),
        }
    }

    println!("Logged in as {} ({}).", login.username, login.role);
    println!("export LEADSHEET_TOKEN={}", login.token);
    Ok(())
}

async fn logout(remote: &Remote) -> Result<()> {
    let mut req = remote.client.post(&remote.url("/api/auth/logout"));
    if let Some(token) = remote.token.as_deref() {
        req = req.bearer_auth(token);
    }
    // Logging out locally succeeds even if the server is unreachable.
    if let Err(e) = req.send().await {
        eprintln!("Warning: {}", e);
    }
    println!("Logged out. Unset LEADSHEET_TOKEN.");
    Ok(())
}

async fn list_employees(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let mut query = Vec::new();
    if let Some(search) = matches.get_one::<String>("search") {
        query.push(("search", search.clone()));
    }
    let list = remote
        .get("/api/admin/employees", &query)
        .await?
        .json::<EmployeeList>()
        .await?;

    employee_table(&list.employees).printstd();
    Ok(())
}

async fn add_employee(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let body = serde_json::json!({
        "username": arg(matches, "username")?,
        "password": arg(matches, "password")?,
    });
    let res = remote
        .client
        .post(&remote.url("/api/admin/employees"))
        .bearer_auth(remote.token()?)
        .json(&body)
        .send()
        .await?;
    check(res).await?;

    println!("Employee created.");
    Ok(())
}

async fn remove_employee(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let id = id_arg(matches, "id")?;
    let res = remote
        .client
        .delete(&remote.url(&format!("/api/admin/employees/{}", id)))
        .bearer_auth(remote.token()?)
        .send()
        .await?;
    check(res).await?;

    println!("Employee deleted.");
    Ok(())
}

async fn upload(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let employee_id = id_arg(matches, "employee-id")?;
    let path = Path::new(arg(matches, "path")?);
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Choose a file"))?
        .to_string();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let form = Form::new()
        .text("employeeId", employee_id.to_string())
        .part("file", Part::bytes(bytes).file_name(filename));

    let res = remote
        .client
        .post(&remote.url("/api/admin/files/upload"))
        .bearer_auth(remote.token()?)
        .multipart(form)
        .send()
        .await?;
    let upload = check(res).await?.json::<UploadResponse>().await?;

    println!(
        "Allocated {} ({} rows) to employee {}.",
        upload.file.filename, upload.rows, employee_id
    );
    Ok(())
}

async fn assigned(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let id = id_arg(matches, "id")?;
    let data = remote
        .get(&format!("/api/admin/employees/{}/records", id), &[])
        .await?
        .json::<AssignedData>()
        .await?;

    println!("Employee: {}", data.employee.username);
    for file in &data.files {
        println!("  file {}: {}", file.id, file.filename);
    }
    if data.records.is_empty() {
        println!("No data assigned.");
    } else {
        record_table(&data.records).printstd();
    }
    Ok(())
}

async fn clear(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let id = id_arg(matches, "id")?;
    let res = remote
        .client
        .delete(&remote.url(&format!("/api/admin/employees/{}/records", id)))
        .bearer_auth(remote.token()?)
        .send()
        .await?;
    check(res).await?;

    println!("Cleared");
    Ok(())
}

async fn export_assigned(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let id = id_arg(matches, "id")?;
    let format = arg(matches, "format")?.to_string();
    let res = remote
        .get(
            &format!("/api/admin/employees/{}/export", id),
            &[("format", format.clone())],
        )
        .await?;

    let fallback = format!("{}_data.{}", id, format);
    save_download(res, matches.get_one::<String>("out"), &fallback).await?;
    println!("{} exported", format.to_uppercase());
    Ok(())
}

async fn stats(remote: &Remote) -> Result<()> {
    let stats = remote
        .get("/api/admin/stats", &[])
        .await?
        .json::<AdminStats>()
        .await?;

    let mut table = Table::new();
    table.add_row(row![Fb => "Employees", "Assigned", "Rows"]);
    table.add_row(row![stats.total_employees, stats.assigned_count, stats.total_rows]);
    table.printstd();
    Ok(())
}

async fn files(remote: &Remote) -> Result<()> {
    let list = remote
        .get("/api/employee/files", &[])
        .await?
        .json::<FileList>()
        .await?;

    let mut table = Table::new();
    table.add_row(row![Fb => "Id", "File"]);
    for file in list.files {
        table.add_row(row![file.id, file.filename]);
    }
    table.printstd();
    Ok(())
}

async fn my_records(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let list = remote
        .get("/api/employee/records", &filter_params(matches))
        .await?
        .json::<RecordList>()
        .await?;

    println!(
        "Total {}  Win {}  Lose {}  Pending {}",
        list.stats.total, list.stats.win, list.stats.lose, list.stats.pending
    );
    if list.records.is_empty() {
        println!("No records match.");
    } else {
        record_table(&list.records).printstd();
    }
    Ok(())
}

async fn set_status(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let id = id_arg(matches, "record-id")?;
    let change = status_change(matches)?;
    change.validate()?;

    let res = remote
        .client
        .patch(&remote.url(&format!("/api/employee/records/{}", id)))
        .bearer_auth(remote.token()?)
        .json(&change)
        .send()
        .await?;
    let record = check(res).await?.json::<Record>().await?;

    record_table(&[record]).printstd();
    Ok(())
}

async fn my_export(remote: &Remote, matches: &ArgMatches) -> Result<()> {
    let res = remote
        .get("/api/employee/records/export", &filter_params(matches))
        .await?;
    save_download(res, matches.get_one::<String>("out"), "records.csv").await?;
    println!("CSV exported");
    Ok(())
}

async fn save_download(res: Response, out: Option<&String>, fallback: &str) -> Result<()> {
    let served_name = res
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split("filename=\"").nth(1))
        .and_then(|v| v.split('"').next())
        .map(String::from);

    let path = match out {
        Some(out) => PathBuf::from(out),
        None => PathBuf::from(served_name.unwrap_or_else(|| fallback.to_string())),
    };
    let bytes = res.bytes().await?;
    fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    println!("Saved {}", path.display());
    Ok(())
}

// Local store

fn run_local(matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<String>("store")
        .cloned()
        .or_else(|| env::var("LOCAL_STORE").ok())
        .unwrap_or_else(|| DEFAULT_LOCAL_STORE.to_string());
    let mut store = LocalStore::open(&path)?;

    match matches.subcommand() {
        Some(("assign", sub)) => {
            check_local_admin(sub)?;
            let employee = arg(sub, "employee")?;
            let file = arg(sub, "path")?;
            if !spreadsheet::is_supported_upload(file) {
                bail!("{}", spreadsheet::SpreadsheetError::UnsupportedType);
            }
            let bytes = fs::read(file).with_context(|| format!("reading {}", file))?;
            let rows = spreadsheet::parse_workbook(&bytes)?;

            let count = store.assign_dataset(employee, rows)?;
            store.set(ROLE_KEY, &Role::Admin)?;
            store.save()?;
            println!("Allocated {} rows to {}.", count, employee);
        }
        Some(("clear", sub)) => {
            check_local_admin(sub)?;
            let employee = arg(sub, "employee")?;
            store.clear_dataset(employee);
            store.save()?;
            println!("Cleared");
        }
        Some(("records", sub)) => {
            let employee = arg(sub, "employee")?;
            let (records, stats) = store.query(employee, &record_query(sub)?)?;
            println!(
                "Total {}  Win {}  Lose {}  Pending {}",
                stats.total, stats.win, stats.lose, stats.pending
            );
            if records.is_empty() {
                println!("No records match.");
            } else {
                record_table(&records).printstd();
            }
        }
        Some(("set-status", sub)) => {
            let employee = arg(sub, "employee")?;
            let row_id = id_arg(sub, "row")?;
            let record = store.apply_status(employee, row_id, &status_change(sub)?)?;
            store.set(ROLE_KEY, &Role::Employee)?;
            store.set(CURRENT_EMPLOYEE_KEY, &serde_json::json!({ "username": employee }))?;
            store.save()?;
            record_table(&[record]).printstd();
        }
        Some(("export", sub)) => {
            let employee = arg(sub, "employee")?;
            let (records, _) = store.query(employee, &record_query(sub)?)?;
            if records.is_empty() {
                bail!("No data to export");
            }
            let refs: Vec<&Record> = records.iter().collect();
            let (columns, rows) = spreadsheet::records_table(&refs);
            let out = sub
                .get_one::<String>("out")
                .cloned()
                .unwrap_or_else(|| format!("records_{}.csv", employee));
            fs::write(&out, spreadsheet::to_csv(&columns, &rows))
                .with_context(|| format!("writing {}", out))?;
            println!("Saved {}", out);
        }
        _ => unreachable!("clap requires a subcommand"),
    }
    Ok(())
}

fn check_local_admin(matches: &ArgMatches) -> Result<()> {
    let username = env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string());
    let password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "1234".to_string());
    if arg(matches, "admin-user")? == username && arg(matches, "admin-password")? == password {
        Ok(())
    } else {
        Err(anyhow!("Invalid Admin credentials"))
    }
}

// Tables

fn employee_table(employees: &[Employee]) -> Table {
    let mut table = Table::new();
    table.add_row(row![Fb => "Id", "Username", "Role"]);
    for e in employees {
        table.add_row(row![e.id, e.username, e.role]);
    }
    table
}

fn record_table(records: &[Record]) -> Table {
    let columns = spreadsheet::columns(records.iter().map(|r| &r.data));

    let mut table = Table::new();
    let mut header: Vec<Cell> = vec![Cell::new("Id").with_style(Attr::Bold)];
    for c in &columns {
        header.push(Cell::new(c).with_style(Attr::Bold));
    }
    header.push(Cell::new("Status").with_style(Attr::Bold));
    header.push(Cell::new("Reason").with_style(Attr::Bold));
    table.add_row(Row::new(header));

    for record in records {
        let mut cells: Vec<Cell> = vec![Cell::new(&record.id.to_string())];
        for c in &columns {
            cells.push(Cell::new(record.data.get(c).map(String::as_str).unwrap_or("")));
        }

        let status = match record.status {
            RecordStatus::Unset => "-",
            other => other.as_str(),
        };
        let mut status_cell = Cell::new(status);
        if let Some(color) = STATUS_COLORS.get(&record.status) {
            status_cell = status_cell.with_style(Attr::ForegroundColor(*color));
        }
        cells.push(status_cell);
        cells.push(Cell::new(&record.reason));
        table.add_row(Row::new(cells));
    }
    table
}

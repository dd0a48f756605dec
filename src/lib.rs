pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod local;
pub mod models;
pub mod records;
pub mod spreadsheet;
pub mod telemetry;

pub use models::{Employee, FileInfo, Record, RecordStatus, Role, Session, User};

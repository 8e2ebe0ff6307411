use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    /// Registry of contest database files in the selected workspace.
    pub registry: Option<Connection>,
    /// The activated contest database; uploads and stats run against it.
    pub db: Option<Connection>,
    pub active_file: Option<String>,
}

//! Concrete action handlers
//!
//! Handlers return `Ok(text)` for the user (or for the model, when the action
//! was requested inside the tool loop). Errors are turned into usage hints or
//! `action failed: ...` strings by the executor.

use super::{system, ActionKind};
use crate::fs_guard::FileSystemGuard;
use chrono::{DateTime, Datelike, Local, TimeZone, Weekday};
use sdk::errors::EngineError;
use sdk::types::{ActionRequest, ParamError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Directory listings stop after this many entries
const MAX_LIST_ENTRIES: usize = 200;

/// Handlers for every [`ActionKind`]
pub struct ActionHandlers {
    guard: FileSystemGuard,
    max_file_bytes: usize,
    review_template: String,
    shutdown: Arc<AtomicBool>,
}

impl ActionHandlers {
    pub fn new(guard: FileSystemGuard, max_file_bytes: usize, review_template: String) -> Self {
        Self {
            guard,
            max_file_bytes,
            review_template,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing shutdown flag with the host
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Flag raised by a confirmed `shutdown` action
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn guard(&self) -> &FileSystemGuard {
        &self.guard
    }

    pub async fn run(&self, kind: ActionKind, request: &ActionRequest) -> Result<String, EngineError> {
        match kind {
            ActionKind::GetTime => Ok(format_time(&Local::now())),
            ActionKind::GetSystemStatus => system::status_report().await,
            ActionKind::ListFiles => {
                let path = request.param_str_opt("path").unwrap_or_else(|| ".".to_string());
                self.list_files(&path).await
            }
            ActionKind::ReadFile => {
                let path = required(request, "path")?;
                self.read_file(&path).await
            }
            ActionKind::AnalyzeFile => {
                let path = required(request, "path")?;
                self.analyze_file(&path).await
            }
            ActionKind::Shutdown => {
                info!("Shutdown requested");
                self.shutdown.store(true, Ordering::SeqCst);
                Ok("Shutting down. Sampai jumpa!".to_string())
            }
        }
    }

    async fn list_files(&self, relative: &str) -> Result<String, EngineError> {
        let path = self.guard.resolve(relative)?;
        debug!("Listing directory: {}", path.display());

        let mut entries = fs::read_dir(&path)
            .await
            .map_err(|_| EngineError::NotAFile(path.clone()))?;

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut links = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let ft = entry.file_type().await?;
            if ft.is_dir() {
                dirs.push(format!("d  {}/", name));
            } else if ft.is_symlink() {
                links.push(format!("l  {}", name));
            } else {
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                files.push(format!("f  {:>8}  {}", format_size(size), name));
            }
        }

        dirs.sort();
        files.sort();
        links.sort();

        let total = dirs.len() + files.len() + links.len();
        let mut out = Vec::with_capacity(total.min(MAX_LIST_ENTRIES) + 2);
        out.push(format!(
            "{}/  ({} entries)",
            self.guard.display_relative(&path),
            total
        ));
        out.extend(dirs.into_iter().chain(files).chain(links).take(MAX_LIST_ENTRIES));
        if total > MAX_LIST_ENTRIES {
            out.push(format!("... {} more", total - MAX_LIST_ENTRIES));
        }
        Ok(out.join("\n"))
    }

    async fn read_file(&self, relative: &str) -> Result<String, EngineError> {
        let file = self.guard.read_file(relative, self.max_file_bytes).await?;
        let mut out = format!(
            "File: {}\n\n{}",
            self.guard.display_relative(&file.path),
            file.content
        );
        if file.truncated {
            out.push_str(&truncation_note(self.max_file_bytes));
        }
        Ok(out)
    }

    async fn analyze_file(&self, relative: &str) -> Result<String, EngineError> {
        let file = self.guard.read_file(relative, self.max_file_bytes).await?;
        let mut content = file.content;
        if file.truncated {
            content.push_str(&truncation_note(self.max_file_bytes));
        }
        Ok(self
            .review_template
            .replace("{filename}", &self.guard.display_relative(&file.path))
            .replace("{content}", &content))
    }
}

fn required(request: &ActionRequest, key: &str) -> Result<String, EngineError> {
    request.param_str(key).map_err(|e| match e {
        ParamError::MissingParameter(p) => EngineError::MissingParameter(p),
    })
}

fn truncation_note(max_bytes: usize) -> String {
    format!("\n\n[truncated after {} bytes]", max_bytes)
}

/// Formats a timestamp the way the assistant reports it, in Indonesian.
pub fn format_time<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "Hari ini {}, tanggal {}, jam {}",
        indonesian_day(now.weekday()),
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S")
    )
}

fn indonesian_day(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Senin",
        Weekday::Tue => "Selasa",
        Weekday::Wed => "Rabu",
        Weekday::Thu => "Kamis",
        Weekday::Fri => "Jumat",
        Weekday::Sat => "Sabtu",
        Weekday::Sun => "Minggu",
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

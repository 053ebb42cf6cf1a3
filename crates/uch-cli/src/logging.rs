use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use uch_core::{AssociationTarget, Failure, SetDefaultOutcome};

pub const LOG_ENV: &str = "UCH_LOG";

/// Diagnostics go to stderr so stdout stays one JSON object per command.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn default_log_path() -> PathBuf {
    if let Some(appdata) = std::env::var_os("APPDATA") {
        return PathBuf::from(appdata)
            .join("UserChoiceKit")
            .join("uch.log");
    }
    PathBuf::from("uch.log")
}

/// Appends `record` to the audit log as one compact JSON line.
pub fn append_record(path: &Path, record: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

pub fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Audit record for one `set-default` attempt.
pub fn set_default_record(
    time_unix_ms: u64,
    target: &AssociationTarget,
    prog_id: &str,
    result: &Result<SetDefaultOutcome, Failure>,
) -> Value {
    let mut record = json!({
        "time_unix_ms": time_unix_ms,
        "target": target.as_str(),
        "prog_id": prog_id,
    });
    let detail = match result {
        Ok(SetDefaultOutcome::AlreadyDefault) => json!({ "status": "ALREADY_DEFAULT" }),
        Ok(SetDefaultOutcome::Written(written)) => json!({
            "status": "WRITTEN",
            "hash": written.hash,
            "last_write_time_filetime": written.last_write_time.as_u64(),
        }),
        Err(err) => json!({
            "status": "FAILED",
            "stage": err.stage(),
            "error": err.to_string(),
        }),
    };
    if let (Some(fields), Value::Object(extra)) = (record.as_object_mut(), detail) {
        fields.extend(extra);
    }
    record
}

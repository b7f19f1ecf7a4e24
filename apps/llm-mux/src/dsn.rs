use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolve the effective DSN. An explicit DSN is used as given (with SQLite
/// file bootstrap); otherwise a SQLite database under the data dir is used.
pub(crate) fn resolve_dsn(input: &str, data_dir: &str) -> Result<String> {
    if !input.trim().is_empty() {
        ensure_sqlite_dsn(input)?;
        return Ok(input.to_string());
    }

    let base = if data_dir.trim().is_empty() {
        Path::new("data")
    } else {
        Path::new(data_dir)
    };
    let db_path = base.join("db").join("llm-mux.db");
    let rendered = db_path.to_string_lossy();
    let dsn = match rendered.strip_prefix('/') {
        Some(absolute) => format!("sqlite:///{absolute}"),
        None => format!("sqlite://{rendered}"),
    };
    ensure_sqlite_dsn(&dsn)?;
    Ok(dsn)
}

/// SQLite wants its file to exist before the pool opens it; non-SQLite DSNs
/// pass through untouched.
pub(crate) fn ensure_sqlite_dsn(dsn: &str) -> Result<()> {
    let Some(rest) = dsn.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    if rest.is_empty() || rest.starts_with(":memory:") || rest.starts_with("memory:") {
        return Ok(());
    }

    let path_part = rest.split('?').next().unwrap_or_default();
    if path_part.is_empty() {
        return Ok(());
    }

    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }
    if !path.exists() {
        std::fs::File::create(&path)
            .with_context(|| format!("create database file {}", path.display()))?;
    }
    Ok(())
}

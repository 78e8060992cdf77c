use serde::Serialize;
use std::io::Write;

/// Print one JSON document to stdout, flushed for piped output.
pub fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    writeln!(lock, "{json}")?;
    lock.flush()?;
    Ok(())
}

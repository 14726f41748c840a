use std::path::Path;

use anyhow::Context;
use log::info;

use crate::results::BenchmarkReport;

/// Persists the report as pretty JSON. The write goes through a sibling
/// temp file and a rename, so a crash never leaves a half-written report.
pub fn write_report(report: &BenchmarkReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let payload =
        serde_json::to_vec_pretty(report).context("failed to serialize benchmark report")?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to move report into {}", path.display()))?;
    info!("Benchmark report written to {}", path.display());
    Ok(())
}

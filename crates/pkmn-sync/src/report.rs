use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pkmn_core::{AbortReason, RunRecord};
use tokio::fs;

/// Writes `<dir>/<run_id>/run_record.json` and `summary.md`, returning the run directory.
pub async fn write_reports(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    let run_dir = dir.join(record.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(record).context("serializing run record")?;
    fs::write(run_dir.join("run_record.json"), json)
        .await
        .context("writing run_record.json")?;

    fs::write(run_dir.join("summary.md"), render_summary(record))
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

pub fn render_summary(record: &RunRecord) -> String {
    let counts = &record.counts;
    let finished = record
        .finished_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());

    let mut out = format!(
        "# Sync Run {}\n\n- Status: {}\n- Started: {}\n- Finished: {}\n",
        record.run_id,
        record.status,
        record.started_at.to_rfc3339(),
        finished,
    );
    if let Some(reason) = &record.abort_reason {
        out.push_str(&format!("- Aborted: {}\n", describe_abort(reason)));
    }

    out.push_str(&format!(
        "\n## Entities\n\n| fetched | cache hit | inserted | updated | unchanged | failed |\n|---|---|---|---|---|---|\n| {} | {} | {} | {} | {} | {} |\n",
        counts.fetched, counts.cache_hit, counts.inserted, counts.updated, counts.unchanged, counts.failed,
    ));

    out.push_str("\n## Aggregates\n\n");
    if record.aggregates_derived {
        out.push_str(&format!(
            "- inserted: {}\n- updated: {}\n- unchanged: {}\n",
            record.aggregates.inserted, record.aggregates.updated, record.aggregates.unchanged,
        ));
    } else {
        out.push_str("Not derived this run.\n");
    }

    if !record.failures.is_empty() {
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for failure in &record.failures {
            *by_kind.entry(failure.kind.to_string()).or_default() += 1;
        }
        out.push_str("\n## Failures\n\n");
        for (kind, n) in &by_kind {
            out.push_str(&format!("- {kind}: {n}\n"));
        }
        out.push('\n');
        for failure in &record.failures {
            out.push_str(&format!(
                "- `{}` ({}): {}\n",
                failure.item, failure.kind, failure.message
            ));
        }
    }
    out
}

fn describe_abort(reason: &AbortReason) -> String {
    match reason {
        AbortReason::CircuitBreakerTripped { failed, attempted } => {
            format!("circuit breaker tripped ({failed} of {attempted} items failed)")
        }
        AbortReason::Cancelled => "cancelled".to_string(),
        AbortReason::DeadlineExceeded => "run deadline exceeded".to_string(),
    }
}

use gwdeploy_core::{orchestrator::HostLedger, paths};
use std::path::Path;

use crate::output::{print_json, print_table};

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let ledger_path = paths::ledger_path(root);
    let attempts = if ledger_path.exists() {
        HostLedger::open(&ledger_path)?.history(limit)?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&attempts);
    }
    if attempts.is_empty() {
        println!("No deployments recorded.");
        return Ok(());
    }

    let rows = attempts
        .iter()
        .map(|a| {
            let short_id: String = a.id.to_string().chars().take(8).collect();
            vec![
                a.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                short_id,
                a.target.to_string(),
                a.previous
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".into()),
                a.outcome()
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "-".into()),
                a.failed_stage
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into()),
                a.duration_secs()
                    .map(|s| format!("{s}s"))
                    .unwrap_or_else(|| "-".into()),
            ]
        })
        .collect();
    print_table(
        &[
            "STARTED (UTC)",
            "ATTEMPT",
            "TARGET",
            "PREVIOUS",
            "OUTCOME",
            "FAILED IN",
            "TOOK",
        ],
        rows,
    );
    Ok(())
}

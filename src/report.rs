//! Plain-text summary of a run's records: outcome header, per-action
//! counts, then one line per subject.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::sync::record::{Action, SyncRecord, SyncStatus};

/// Whether a record counts as a problem in the summary. Skips for missing
/// emails are expected noise and excluded.
fn is_problem(record: &SyncRecord) -> bool {
    match record.status {
        SyncStatus::Failure => true,
        SyncStatus::Skipped => record.action != Action::SkippedNoEmail,
        SyncStatus::Success => false,
    }
}

pub fn render_summary(records: &[SyncRecord]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Access reconciliation summary — {}\n",
        Utc::now().to_rfc3339()
    ));

    if records.is_empty() {
        out.push_str("No user operations were performed or reported.\n");
        return out;
    }

    let successes = records
        .iter()
        .filter(|r| r.status == SyncStatus::Success)
        .count();
    let problems = records.iter().filter(|r| is_problem(r)).count();

    let outcome = match (successes, problems) {
        (_, 0) => "completed successfully",
        (0, _) => "completed with problems",
        _ => "partially completed",
    };
    out.push_str(&format!(
        "Run {outcome}: {successes} successful operations, {problems} problems/omissions.\n\n"
    ));

    let mut by_tag: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        *by_tag.entry(record.action.tag()).or_default() += 1;
    }
    out.push_str("Actions:\n");
    for (tag, count) in &by_tag {
        out.push_str(&format!("  {tag}: {count}\n"));
    }

    out.push_str("\nDetails:\n");
    for record in records {
        let mut line = format!(
            "  [{}] {} {} — {} ({})",
            record.status.as_str(),
            record.service.as_str(),
            record.target,
            record.subject,
            record.action.tag(),
        );
        if let Some(error) = &record.error {
            line.push_str(&format!(": {error}"));
        }
        line.push('\n');
        out.push_str(&line);
    }
    out
}

use anyhow::Result;
use tf_core::config::Config;
use tf_core::store::TaskGraphStore;
use tf_core::types::StatusCounts;
use tf_daemon::daemon::open_store;

pub async fn run(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let counts = store.status_counts().await?;
    println!("{}", render(&counts));
    Ok(())
}

pub fn render(counts: &StatusCounts) -> String {
    let rows = [
        ("pending", counts.pending),
        ("in_progress", counts.in_progress),
        ("completed", counts.completed),
        ("failed", counts.failed),
        ("blocked", counts.blocked),
        ("skipped", counts.skipped),
    ];
    let mut out = format!("taskforge status\n{}\nTotal tasks:    {}", "-".repeat(30), counts.total());
    for (label, n) in rows {
        out.push_str(&format!("\n  {:<13} {}", format!("{label}:"), n));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_status() {
        let counts = StatusCounts {
            pending: 2,
            completed: 5,
            blocked: 1,
            ..StatusCounts::default()
        };
        let text = render(&counts);
        assert!(text.contains("Total tasks:    8"), "{text}");
        assert!(text.contains("  completed:    5"), "{text}");
        assert!(text.contains("  in_progress:  0"), "{text}");
        assert_eq!(text.lines().count(), 9);
    }
}

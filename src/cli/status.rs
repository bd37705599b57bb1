// src/cli/status.rs - Session and hours summary

use chrono::Utc;

use super::Context;
use crate::core::clock::format_hms;
use crate::core::machine::select_open_session;
use crate::core::types::DashboardSnapshot;

pub async fn show_status(ctx: &Context, offline: bool) -> anyhow::Result<()> {
    let (snapshot, fetched_at) = if offline {
        match ctx.cache.load() {
            Some(cached) => (cached.snapshot, Some(cached.fetched_at)),
            None => {
                println!("No cached dashboard. Run `studytrack status` while online first.");
                return Ok(());
            }
        }
    } else {
        let gateway = ctx.gateway()?;
        let snapshot = gateway
            .fetch_current_state()
            .await
            .map_err(|e| ctx.fail(e))?;
        if let Err(e) = ctx.cache.save(&snapshot, Utc::now()) {
            tracing::warn!("Failed to write dashboard cache: {}", e);
        }
        (snapshot, None)
    };

    print!("{}", render_status(&snapshot));
    if let Some(at) = fetched_at {
        println!("  (cached {})", at.format("%Y-%m-%d %H:%M UTC"));
    }
    Ok(())
}

fn render_status(snapshot: &DashboardSnapshot) -> String {
    let mut out = String::new();
    let selection = select_open_session(&snapshot.user_sessions);

    match selection.open {
        Some(session) => {
            let elapsed = (Utc::now() - session.start_time)
                .to_std()
                .unwrap_or_default();
            let place = session
                .location
                .and_then(|id| snapshot.location(id))
                .map(|l| l.name.as_str())
                .filter(|n| !n.is_empty())
                .unwrap_or("unknown location");
            out.push_str(&format!(
                "  Studying:   {} at {} (session {})\n",
                format_hms(elapsed),
                place,
                session.id
            ));
        }
        None => out.push_str("  Studying:   no\n"),
    }
    for anomaly in &selection.anomalies {
        out.push_str(&format!("  Warning:    {anomaly}\n"));
    }

    out.push_str(&format!("  Total:      {:.2} h\n", snapshot.total_hours()));
    for (period, hours) in snapshot.hours_by_period() {
        let label = period
            .map(|p| format!("period {p}"))
            .unwrap_or_else(|| "unassigned".into());
        out.push_str(&format!("    {label:<14}{hours:.2} h\n"));
    }
    out
}

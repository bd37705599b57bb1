// src/cli/clock.rs - One-shot clock-in / clock-out

use std::sync::Arc;

use super::Context;
use crate::core::clock::{format_hms, SystemTime};
use crate::core::tracker::{SessionTracker, TrackerConfig, TrackerDeps, TrackerHandle};
use crate::core::types::{DashboardSnapshot, SessionState};
use crate::gateway::DashboardGateway;
use crate::geofence::region::resolve_location;
use crate::geofence::{ChannelRegionWatcher, RegionWatcher};
use crate::infra::errors::StudyError;

pub(crate) fn spawn_tracker(
    ctx: &Context,
    gateway: Arc<dyn DashboardGateway>,
    watcher: Arc<dyn RegionWatcher>,
    geofence_enabled: bool,
) -> (TrackerHandle, tokio::task::JoinHandle<()>) {
    let mut config = TrackerConfig::from(&ctx.config);
    config.geofence_enabled &= geofence_enabled;
    SessionTracker::spawn(
        config,
        TrackerDeps {
            gateway,
            watcher,
            bus: ctx.bus.clone(),
            source: Arc::new(SystemTime),
            cache: Some(ctx.cache.clone()),
        },
    )
}

/// Pick the location to clock in at: the geofence containing the given
/// coordinates, then the explicit id, then the configured default, then the
/// organization's only location.
pub fn choose_location(
    snapshot: &DashboardSnapshot,
    explicit: Option<i64>,
    coords: Option<(f64, f64)>,
    default_location: Option<i64>,
) -> Result<i64, StudyError> {
    if let Some((lat, lon)) = coords {
        if let Some(location) = resolve_location(&snapshot.org_locations, lat, lon) {
            return Ok(location.id);
        }
        if explicit.is_none() && default_location.is_none() {
            return Err(StudyError::rejected(format!(
                "({lat}, {lon}) is not inside any study location"
            )));
        }
    }
    if let Some(id) = explicit.or(default_location) {
        if snapshot.org_locations.is_empty() || snapshot.location(id).is_some() {
            return Ok(id);
        }
        return Err(StudyError::rejected(format!("unknown location {id}")));
    }
    match snapshot.org_locations.as_slice() {
        [only] => Ok(only.id),
        [] => Err(StudyError::rejected("organization has no study locations")),
        _ => Err(StudyError::rejected(
            "several locations available; pass --location or --lat/--lon",
        )),
    }
}

pub async fn clock_in(
    ctx: &Context,
    location: Option<i64>,
    coords: Option<(f64, f64)>,
) -> anyhow::Result<()> {
    let gateway = ctx.gateway()?;
    let snapshot = gateway
        .fetch_current_state()
        .await
        .map_err(|e| ctx.fail(e))?;
    let location_id = choose_location(&snapshot, location, coords, ctx.config.default_location)?;

    let (handle, task) = spawn_tracker(ctx, gateway, Arc::new(ChannelRegionWatcher::new()), false);
    let result = match handle.rebuild().await {
        Ok(_) => handle.clock_in(location_id).await,
        Err(e) => Err(e),
    };
    let elapsed = handle.elapsed();
    handle.shutdown().await;
    let _ = task.await;

    print_state(&result?, elapsed);
    Ok(())
}

pub async fn clock_out(ctx: &Context) -> anyhow::Result<()> {
    let gateway = ctx.gateway()?;
    let (handle, task) = spawn_tracker(ctx, gateway, Arc::new(ChannelRegionWatcher::new()), false);
    let result = match handle.rebuild().await {
        Ok(_) => handle.clock_out().await,
        Err(e) => Err(e),
    };
    handle.shutdown().await;
    let _ = task.await;

    print_state(&result?, std::time::Duration::ZERO);
    Ok(())
}

pub(crate) fn print_state(state: &SessionState, elapsed: std::time::Duration) {
    match state {
        SessionState::Idle => println!("Not clocked in."),
        SessionState::Studying(active) => println!(
            "Clocked in (session {}), elapsed {}",
            active.session_id,
            format_hms(elapsed)
        ),
        SessionState::GraceWaitingForReentry { deadline, .. } => println!(
            "Outside the study location; clocking out at {} unless you return",
            deadline.format("%H:%M:%S UTC")
        ),
    }
}

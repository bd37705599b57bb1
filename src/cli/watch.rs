// src/cli/watch.rs - Interactive tracker driven from stdin
//
// Runs the session tracker with geofencing enabled. Each stdin line is one
// host signal:
//
//   enter <region> | exit <region>   region transition ("3" or "location-3")
//   fix <lat> <lon>                  position fix; membership changes become transitions
//   bg | fg                          host backgrounded / foregrounded
//   in [location] | out              clock in / clock out
//   refresh | state | quit

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use super::clock::{print_state, spawn_tracker};
use super::Context;
use crate::core::clock::{format_hms, InstantSource, SystemTime};
use crate::core::tracker::TrackerHandle;
use crate::core::types::{region_id_for_location, SessionState};
use crate::events::{BusEvent, Subscription, Topic};
use crate::geofence::{ChannelRegionWatcher, RegionTransition, TransitionKind};
use crate::infra::errors::StudyError;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchCommand {
    Transition { region_id: String, kind: TransitionKind },
    Fix { lat: f64, lon: f64 },
    Background,
    Foreground,
    ClockIn(Option<i64>),
    ClockOut,
    Refresh,
    State,
    Quit,
}

pub fn parse_command(line: &str) -> Result<WatchCommand, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let region = |raw: &str| match raw.parse::<i64>() {
        Ok(id) => region_id_for_location(id),
        Err(_) => raw.to_string(),
    };
    match parts.as_slice() {
        ["enter", r] => Ok(WatchCommand::Transition {
            region_id: region(*r),
            kind: TransitionKind::Enter,
        }),
        ["exit", r] => Ok(WatchCommand::Transition {
            region_id: region(*r),
            kind: TransitionKind::Exit,
        }),
        ["fix", lat, lon] => {
            let lat = lat.parse().map_err(|_| format!("bad latitude '{lat}'"))?;
            let lon = lon.parse().map_err(|_| format!("bad longitude '{lon}'"))?;
            Ok(WatchCommand::Fix { lat, lon })
        }
        ["bg"] => Ok(WatchCommand::Background),
        ["fg"] => Ok(WatchCommand::Foreground),
        ["in"] => Ok(WatchCommand::ClockIn(None)),
        ["in", id] => id
            .parse()
            .map(|id| WatchCommand::ClockIn(Some(id)))
            .map_err(|_| format!("bad location id '{id}'")),
        ["out"] => Ok(WatchCommand::ClockOut),
        ["refresh"] => Ok(WatchCommand::Refresh),
        ["state"] => Ok(WatchCommand::State),
        ["quit"] | ["exit"] => Ok(WatchCommand::Quit),
        [] => Err("empty command".into()),
        _ => Err(format!("unknown command '{}'", line.trim())),
    }
}

fn print_events(ctx: &Context, ticks: bool) -> Vec<Subscription> {
    let mut subs = vec![
        ctx.bus.subscribe(Topic::StateChanged, |event| {
            if let BusEvent::StateChanged(state) = event {
                println!("[state] {state}");
            }
            Ok(())
        }),
        ctx.bus.subscribe(Topic::GeofenceTransition, |event| {
            if let BusEvent::GeofenceTransition(t) = event {
                println!("[geofence] {:?} {}", t.kind, t.region_id);
            }
            Ok(())
        }),
        ctx.bus.subscribe(Topic::GeofenceExpired, |event| {
            if let BusEvent::GeofenceExpired(e) = event {
                println!("[geofence] grace elapsed for {}", e.region_id);
            }
            Ok(())
        }),
        ctx.bus.subscribe(Topic::ClockOut, |event| {
            if let BusEvent::ClockOut { session_id, reason } = event {
                println!("[clock] session {session_id} closed ({reason:?})");
            }
            Ok(())
        }),
        ctx.bus.subscribe(Topic::CommandFailed, |event| {
            if let BusEvent::CommandFailed { command, message } = event {
                println!("[error] {command}: {message}");
            }
            Ok(())
        }),
    ];
    if ticks {
        subs.push(ctx.bus.subscribe(Topic::ClockTick, |event| {
            if let BusEvent::ClockTick { elapsed } = event {
                println!("[tick] {}", format_hms(*elapsed));
            }
            Ok(())
        }));
    }
    subs
}

pub async fn run_watch(ctx: &Context, ticks: bool) -> anyhow::Result<()> {
    let gateway = ctx.gateway()?;
    let watcher = Arc::new(ChannelRegionWatcher::new());
    let source = SystemTime;
    let subs = print_events(ctx, ticks);
    let (handle, task) = spawn_tracker(ctx, gateway, watcher.clone(), true);

    println!("Watching. Commands: enter/exit <region>, fix <lat> <lon>, bg, fg, in [id], out, refresh, state, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        if command == WatchCommand::Quit {
            break;
        }
        dispatch(ctx, &handle, &watcher, &source, command).await;
    }

    handle.shutdown().await;
    let _ = task.await;
    for sub in subs {
        sub.unsubscribe();
    }
    Ok(())
}

async fn dispatch(
    ctx: &Context,
    handle: &TrackerHandle,
    watcher: &ChannelRegionWatcher,
    source: &dyn InstantSource,
    command: WatchCommand,
) {
    match command {
        WatchCommand::Transition { region_id, kind } => {
            let delivered = watcher.inject(RegionTransition {
                region_id,
                kind,
                at: source.now(),
            });
            if delivered {
                return;
            }
            if watcher.is_registered() {
                eprintln!("Transition dropped: the region feed is backed up");
            } else {
                eprintln!("No regions are being watched");
            }
        }
        WatchCommand::Fix { lat, lon } => {
            watcher.observe_fix(lat, lon, source.now());
        }
        WatchCommand::Background => handle.background(),
        WatchCommand::Foreground => handle.foreground(),
        WatchCommand::ClockIn(location) => {
            match location.or(ctx.config.default_location) {
                Some(id) => report(handle.clock_in(id).await, handle),
                None => eprintln!("No location given and no default_location configured"),
            }
        }
        WatchCommand::ClockOut => report(handle.clock_out().await, handle),
        WatchCommand::Refresh => report(handle.rebuild().await, handle),
        WatchCommand::State => print_state(&handle.state(), handle.elapsed()),
        WatchCommand::Quit => {}
    }
}

fn report(result: Result<SessionState, StudyError>, handle: &TrackerHandle) {
    match result {
        Ok(state) => print_state(&state, handle.elapsed()),
        Err(e) => eprintln!("error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("exit 3").unwrap(),
            WatchCommand::Transition {
                region_id: "location-3".into(),
                kind: TransitionKind::Exit
            }
        );
        assert_eq!(
            parse_command("  enter location-7 ").unwrap(),
            WatchCommand::Transition {
                region_id: "location-7".into(),
                kind: TransitionKind::Enter
            }
        );
        assert_eq!(
            parse_command("fix 33.2 -87.5").unwrap(),
            WatchCommand::Fix { lat: 33.2, lon: -87.5 }
        );
        assert_eq!(parse_command("in").unwrap(), WatchCommand::ClockIn(None));
        assert_eq!(parse_command("in 4").unwrap(), WatchCommand::ClockIn(Some(4)));
        assert_eq!(parse_command("quit").unwrap(), WatchCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("fix north south").is_err());
        assert!(parse_command("dance").is_err());
        assert!(parse_command("in four").is_err());
    }
}

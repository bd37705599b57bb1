// src/cli/mod.rs - CLI definition (clap derive)

pub mod auth;
pub mod clock;
pub mod sessions;
pub mod status;
pub mod watch;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::auth::TokenStore;
use crate::events::{BusEvent, EventBus, Subscription, Topic};
use crate::gateway::cache::DashboardCache;
use crate::gateway::http::HttpGateway;
use crate::gateway::retry::{RetryConfig, RetryGateway};
use crate::gateway::DashboardGateway;
use crate::infra::config::Config;
use crate::infra::errors::StudyError;

#[derive(Parser)]
#[command(name = "studytrack", about = "Track study hours with geofenced clock-in/out", version)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the current session and hour totals
    Status {
        /// Use the last cached dashboard instead of the server
        #[arg(long)]
        offline: bool,
    },
    /// Start a study session
    ClockIn {
        /// Location id to clock in at
        #[arg(long)]
        location: Option<i64>,
        /// Current latitude; picks the location whose geofence contains it
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Current longitude
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },
    /// End the current study session
    ClockOut,
    /// Run the tracker interactively, reading region events from stdin
    Watch {
        /// Print a line on every clock tick
        #[arg(long)]
        ticks: bool,
    },
    /// Correct or remove recorded sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Obtain and store an access token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Forget stored credentials and cached data
    Logout,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// Set the recorded hours of a session
    Edit {
        id: i64,
        #[arg(long)]
        hours: f64,
    },
    /// Delete a session
    Delete { id: i64 },
}

/// Shared state for one CLI invocation.
pub struct Context {
    pub config: Config,
    pub bus: EventBus,
    pub cache: DashboardCache,
    _unauthorized: Subscription,
}

impl Context {
    /// Build the context and install the unauthorized handler: a rejected
    /// credential clears stored tokens and cached data.
    pub fn new(config: Config, cache: DashboardCache) -> Self {
        let bus = EventBus::new();
        let handler_cache = cache.clone();
        let unauthorized = bus.subscribe(Topic::Unauthorized, move |_| {
            TokenStore::clear()?;
            handler_cache.clear()?;
            eprintln!("Your session has expired. Run `studytrack login` to sign in again.");
            Ok(())
        });
        Self {
            config,
            bus,
            cache,
            _unauthorized: unauthorized,
        }
    }

    /// Gateway built from stored credentials, with fetch retries.
    pub fn gateway(&self) -> anyhow::Result<Arc<dyn DashboardGateway>> {
        let tokens = TokenStore::load()?;
        if !tokens.is_logged_in() {
            anyhow::bail!("Not logged in. Run `studytrack login` first.");
        }
        let http = HttpGateway::new(
            &self.config.api.base_url,
            tokens.access_token,
            self.config.api.timeout(),
        )?;
        Ok(Arc::new(RetryGateway::with_config(
            Arc::new(http),
            RetryConfig::from(&self.config.retry),
        )))
    }

    /// Convert a gateway error for display, signalling unauthorized first.
    pub fn fail(&self, error: StudyError) -> anyhow::Error {
        if error.is_unauthorized() {
            self.bus.publish(BusEvent::Unauthorized);
        }
        anyhow::Error::new(error)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.bus.shutdown();
    }
}

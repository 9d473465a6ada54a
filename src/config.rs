//! Typed configuration: CLI + environment at process start (clap, in the
//! teacher's `ebeans` style), plus an in-memory overlay merged in by
//! `POST /api/config` (§4.6) that never touches the environment or disk.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

fn default_http_host() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Process-start configuration, overridable by environment variable or
/// flag. Mirrors the env-driven list in the external-interfaces section:
/// WS/HTTP bind addresses, probe/dispatch intervals, the database path, the
/// job-workdir root, the opt-in requeue sweep, and opaque relay tokens.
#[derive(Parser, Clone, Debug)]
#[command(name = "jobmesh-master", about = "Cluster control plane for dispatching jobs to worker nodes")]
pub struct Args {
    /// Host the HTTP/WebSocket listener binds to (node channel and submission surface share one listener).
    #[arg(long, env = "JOBMESH_HTTP_HOST", default_value = "127.0.0.1")]
    pub http_host: String,

    /// Port the HTTP/WebSocket listener binds to.
    #[arg(long, env = "JOBMESH_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Seconds between health-monitor probe ticks.
    #[arg(long, env = "JOBMESH_PROBE_INTERVAL_SECS", default_value_t = 15)]
    pub probe_interval_secs: u64,

    /// Seconds to wait for a single probe response before marking a node unresponsive.
    #[arg(long, env = "JOBMESH_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    pub probe_timeout_secs: u64,

    /// Seconds between dispatcher ticks.
    #[arg(long, env = "JOBMESH_DISPATCH_INTERVAL_SECS", default_value_t = 2)]
    pub dispatch_interval_secs: u64,

    /// Path to the embedded SQLite database file.
    #[arg(long, env = "JOBMESH_DB_PATH", default_value = "jobmesh.sqlite3")]
    pub db_path: PathBuf,

    /// Root directory jobs' advisory working directories are derived from.
    #[arg(long, env = "JOBMESH_WORKDIR_ROOT", default_value = "/tmp/jobmesh-work")]
    pub workdir_root: PathBuf,

    /// If set, jobs still RUNNING at startup are swept to FAILED after `requeue_grace_secs`.
    #[arg(long, env = "JOBMESH_REQUEUE_RUNNING_ON_START", default_value_t = false)]
    pub requeue_running_on_start: bool,

    /// Grace period before the startup sweep runs, when enabled.
    #[arg(long, env = "JOBMESH_REQUEUE_GRACE_SECS", default_value_t = 30)]
    pub requeue_grace_secs: u64,

    /// Opaque bot token(s) for chat-platform relay collaborators; stored, never interpreted here.
    #[arg(long, env = "JOBMESH_RELAY_BOT_TOKEN")]
    pub relay_bot_token: Option<String>,

    /// Use structured JSON logging instead of the human-readable formatter.
    #[arg(long, env = "JOBMESH_DEBUG", default_value_t = false)]
    pub debug: bool,
}

/// The live, mergeable snapshot handed out by `GET /api/config` and
/// mutated (overlay-only) by `POST /api/config`. The environment-derived
/// values in [`Args`] remain the base layer underneath this.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigOverlay {
    #[serde(default)]
    pub probe_interval_secs: Option<u64>,
    #[serde(default)]
    pub probe_timeout_secs: Option<u64>,
    #[serde(default)]
    pub dispatch_interval_secs: Option<u64>,
    /// The one field the original master actually re-reads live on every
    /// dispatch tick (`_send_job_assignment`'s `workdir_root` lookup) rather
    /// than freezing at process start.
    #[serde(default)]
    pub workdir_root: Option<PathBuf>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub http_host: IpAddr,
    pub http_port: u16,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub dispatch_interval: Duration,
    pub db_path: PathBuf,
    pub workdir_root: PathBuf,
    pub requeue_running_on_start: bool,
    pub requeue_grace: Duration,
    pub relay_bot_token: Option<String>,
}

impl Config {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let http_host = args
            .http_host
            .parse()
            .unwrap_or_else(|_| default_http_host());
        Ok(Self {
            http_host,
            http_port: args.http_port,
            probe_interval: Duration::from_secs(args.probe_interval_secs),
            probe_timeout: Duration::from_secs(args.probe_timeout_secs),
            dispatch_interval: Duration::from_secs(args.dispatch_interval_secs),
            db_path: args.db_path.clone(),
            workdir_root: args.workdir_root.clone(),
            requeue_running_on_start: args.requeue_running_on_start,
            requeue_grace: Duration::from_secs(args.requeue_grace_secs),
            relay_bot_token: args.relay_bot_token.clone(),
        })
    }

    /// Applies a partial overlay on top of this config's in-memory values.
    /// Never touches the environment or the process's own `Args` — only the
    /// running snapshot served back out of `GET /api/config`.
    pub fn apply_overlay(&mut self, overlay: &ConfigOverlay) {
        if let Some(secs) = overlay.probe_interval_secs {
            self.probe_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = overlay.probe_timeout_secs {
            self.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overlay.dispatch_interval_secs {
            self.dispatch_interval = Duration::from_secs(secs);
        }
        if let Some(root) = &overlay.workdir_root {
            self.workdir_root = root.clone();
        }
    }

    pub fn as_overlay_snapshot(&self) -> ConfigOverlay {
        ConfigOverlay {
            probe_interval_secs: Some(self.probe_interval.as_secs()),
            probe_timeout_secs: Some(self.probe_timeout.as_secs()),
            dispatch_interval_secs: Some(self.dispatch_interval.as_secs()),
            workdir_root: Some(self.workdir_root.clone()),
            extra: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_merge_only_touches_named_fields() {
        let args = Args::parse_from(["jobmesh-master"]);
        let mut config = Config::from_args(&args).unwrap();
        let original_dispatch = config.dispatch_interval;

        config.apply_overlay(&ConfigOverlay {
            probe_interval_secs: Some(30),
            probe_timeout_secs: None,
            dispatch_interval_secs: None,
            workdir_root: None,
            extra: HashMap::new(),
        });

        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.dispatch_interval, original_dispatch);
    }

    #[test]
    fn overlay_merge_overrides_workdir_root() {
        let args = Args::parse_from(["jobmesh-master"]);
        let mut config = Config::from_args(&args).unwrap();

        config.apply_overlay(&ConfigOverlay {
            probe_interval_secs: None,
            probe_timeout_secs: None,
            dispatch_interval_secs: None,
            workdir_root: Some(PathBuf::from("/srv/jobmesh-work")),
            extra: HashMap::new(),
        });

        assert_eq!(config.workdir_root, PathBuf::from("/srv/jobmesh-work"));
    }
}

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use argh::FromArgs;
use thiserror::Error;
use whizard_adapter_lib::{DEFAULT_SERVICE, DEFAULT_STORAGE};

pub const LEADER_ELECTION_ID: &str = "whizard-controller-manager-leader-election";


#[derive(FromArgs)]
/// Whizard adapter
pub struct AdapterArgs {
    /// monitoring service new tenants and clusters are bound to
    #[argh(option, default = "String::from(DEFAULT_SERVICE)")]
    pub default_whizard_service: String,

    /// storage new tenants are bound to
    #[argh(option, default = "String::from(DEFAULT_STORAGE)")]
    pub default_storage: String,

    /// whether to enable the kubesphere cluster controller (default true)
    #[argh(option, default = "true")]
    pub kubesphere_adapter_enabled: bool,

    /// whether to enable the tenant web server
    #[argh(switch)]
    pub web_enabled: bool,

    /// address the tenant web server binds to (default :9090)
    #[argh(option, default = "String::from(\":9090\")")]
    pub web_bind_address: String,

    /// largest request body the tenant web server accepts, in bytes (default 1048576)
    #[argh(option, default = "default_content_length_limit()")]
    pub content_length_limit: u64,

    /// whether to enable leader election, needed when running several replicas
    #[argh(switch)]
    pub leader_elect: bool,

    /// seconds non-leaders wait after a renewal before taking over an unrenewed lease (default 30)
    #[argh(option, default = "default_lease_duration()")]
    pub leader_elect_lease_duration: u64,

    /// seconds the leader keeps trying to renew before it stops leading (default 15)
    #[argh(option, default = "default_renew_deadline()")]
    pub leader_elect_renew_deadline: u64,

    /// seconds between acquisition and renewal attempts (default 5)
    #[argh(option, default = "default_retry_period()")]
    pub leader_elect_retry_period: u64,

    /// namespace holding the leader election lease
    #[argh(option, default = "String::from(\"kubesphere-monitoring-system\")")]
    pub leader_elect_namespace: String,

    /// address the metric endpoint binds to (default :9092)
    #[argh(option, default = "String::from(\":9092\")")]
    pub metrics_bind_address: String,

    /// address the probe endpoint binds to (default :9091)
    #[argh(option, default = "String::from(\":9091\")")]
    pub health_probe_bind_address: String,
}

// content length limit
fn default_content_length_limit() -> u64 {
    1024 * 1024
}

// lease duration
fn default_lease_duration() -> u64 { 30 }

// renew deadline
fn default_renew_deadline() -> u64 { 15 }

// retry period
fn default_retry_period() -> u64 { 5 }


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

// Validated runtime options.
#[derive(Clone, Debug)]
pub struct Options {
    pub default_whizard_service: String,
    pub default_storage: String,
    pub kubesphere_adapter_enabled: bool,
    pub web_enabled: bool,
    pub web_bind_address: SocketAddr,
    pub content_length_limit: u64,
    pub leader_election: Option<LeaderElectionConfig>,
    pub metrics_bind_address: SocketAddr,
    pub health_probe_bind_address: SocketAddr,
}

#[derive(Debug, Error)]
#[error("invalid options: {}", .0.join("; "))]
pub struct InvalidOptions(pub Vec<String>);

impl TryFrom<AdapterArgs> for Options {
    type Error = InvalidOptions;

    // Collects every problem instead of stopping at the first one.
    fn try_from(args: AdapterArgs) -> Result<Self, Self::Error> {
        let mut errs = Vec::new();

        if args.default_whizard_service.trim().is_empty() {
            errs.push("--default-whizard-service must not be empty".to_string());
        }
        if args.default_storage.trim().is_empty() {
            errs.push("--default-storage must not be empty".to_string());
        }

        if args.content_length_limit == 0 {
            errs.push("--content-length-limit must be greater than zero".to_string());
        }

        let web_bind_address = bind_address("--web-bind-address", &args.web_bind_address, &mut errs);
        let metrics_bind_address = bind_address("--metrics-bind-address", &args.metrics_bind_address, &mut errs);
        let health_probe_bind_address =
            bind_address("--health-probe-bind-address", &args.health_probe_bind_address, &mut errs);

        let leader_election = if args.leader_elect {
            let lease = args.leader_elect_lease_duration;
            let renew = args.leader_elect_renew_deadline;
            let retry = args.leader_elect_retry_period;
            if lease > i32::MAX as u64 {
                errs.push(format!(
                    "--leader-elect-lease-duration ({}s) must be at most {}s",
                    lease,
                    i32::MAX
                ));
            }
            if retry == 0 {
                errs.push("--leader-elect-retry-period must be greater than zero".to_string());
            }
            if renew > lease {
                errs.push(format!(
                    "--leader-elect-renew-deadline ({}s) must be less than or equal to --leader-elect-lease-duration ({}s)",
                    renew, lease
                ));
            }
            if retry >= renew {
                errs.push(format!(
                    "--leader-elect-retry-period ({}s) must be less than --leader-elect-renew-deadline ({}s)",
                    retry, renew
                ));
            }
            if args.leader_elect_namespace.is_empty() {
                errs.push("--leader-elect-namespace must not be empty".to_string());
            }
            Some(LeaderElectionConfig {
                lease_name: LEADER_ELECTION_ID.to_string(),
                namespace: args.leader_elect_namespace,
                lease_duration: Duration::from_secs(lease),
                renew_deadline: Duration::from_secs(renew),
                retry_period: Duration::from_secs(retry),
            })
        } else {
            None
        };

        match (web_bind_address, metrics_bind_address, health_probe_bind_address) {
            (Some(web), Some(metrics), Some(health)) if errs.is_empty() => Ok(Options {
                default_whizard_service: args.default_whizard_service,
                default_storage: args.default_storage,
                kubesphere_adapter_enabled: args.kubesphere_adapter_enabled,
                web_enabled: args.web_enabled,
                web_bind_address: web,
                content_length_limit: args.content_length_limit,
                leader_election,
                metrics_bind_address: metrics,
                health_probe_bind_address: health,
            }),
            _ => Err(InvalidOptions(errs)),
        }
    }
}

// Accepts ":port", "host:port" or "ip:port"; an empty host listens on all interfaces.
pub fn parse_bind_address(address: &str) -> Option<SocketAddr> {
    let address = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    address.to_socket_addrs().ok()?.next()
}

fn bind_address(flag: &str, value: &str, errs: &mut Vec<String>) -> Option<SocketAddr> {
    let parsed = parse_bind_address(value);
    if parsed.is_none() {
        errs.push(format!("{} {:?} is not a valid bind address", flag, value));
    }
    parsed
}

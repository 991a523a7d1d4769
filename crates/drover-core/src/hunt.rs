//! Hunt records, arguments, counters, and foreman targeting rules.

use serde::{Deserialize, Serialize};

use crate::config::HuntSettings;
use crate::flow_args::FlowArgs;
use crate::ids::{ClientId, HuntId};
use crate::message::StartupInfo;

/// Hunt lifecycle. Created PAUSED; STOPPED and COMPLETED are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HuntState {
    Paused,
    Started,
    Stopped,
    Completed,
}

impl HuntState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HuntState::Stopped | HuntState::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    Expired,
    ClientLimitReached,
    CrashLimitExceeded,
}

/// Per-group flow definition of a variable hunt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableFlowGroup {
    pub name: String,
    pub client_ids: Vec<ClientId>,
    pub flow: FlowArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hunt_type", rename_all = "snake_case")]
pub enum HuntArguments {
    /// Same flow for every admitted client.
    Standard { flow: FlowArgs },
    /// Flow chosen by the group the client belongs to.
    Variable { groups: Vec<VariableFlowGroup> },
}

impl HuntArguments {
    /// Flow arguments for `client_id`, or `None` when a variable hunt has no
    /// group for it.
    pub fn flow_for(&self, client_id: &ClientId) -> Option<&FlowArgs> {
        match self {
            HuntArguments::Standard { flow } => Some(flow),
            HuntArguments::Variable { groups } => groups
                .iter()
                .find(|g| g.client_ids.contains(client_id))
                .map(|g| &g.flow),
        }
    }

    /// Number of clients a variable hunt can ever admit.
    pub fn variable_client_count(&self) -> Option<usize> {
        match self {
            HuntArguments::Standard { .. } => None,
            HuntArguments::Variable { groups } => {
                Some(groups.iter().map(|g| g.client_ids.len()).sum())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ClientRule {
    Os { os: String },
    Label { label: String },
    MinVersion { version: u32 },
}

impl ClientRule {
    pub fn matches(&self, info: &StartupInfo) -> bool {
        match self {
            ClientRule::Os { os } => info.os.eq_ignore_ascii_case(os),
            ClientRule::Label { label } => info.client_info.labels.iter().any(|l| l == label),
            ClientRule::MinVersion { version } => info.client_info.client_version >= *version,
        }
    }
}

/// Targeting rules evaluated by the foreman. An empty rule set matches
/// every client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRuleSet {
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub rules: Vec<ClientRule>,
}

impl ClientRuleSet {
    pub fn matches(&self, info: &StartupInfo) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        match self.match_mode {
            MatchMode::All => self.rules.iter().all(|r| r.matches(info)),
            MatchMode::Any => self.rules.iter().any(|r| r.matches(info)),
        }
    }
}

/// Rule registered with the foreman while a hunt is STARTED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForemanRule {
    pub hunt_id: HuntId,
    pub rule_set: ClientRuleSet,
    pub expiry_time: Option<u64>,
}

impl ForemanRule {
    pub fn expired(&self, now: u64) -> bool {
        self.expiry_time.is_some_and(|t| t < now)
    }
}

/// Caller-supplied hunt parameters. Unset limits fall back to the
/// configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntSpec {
    pub description: String,
    pub args: HuntArguments,
    pub client_rule_set: ClientRuleSet,
    pub duration_ms: Option<u64>,
    /// Clients admitted per minute; 0 = unlimited.
    pub client_rate: Option<f64>,
    /// Max clients ever admitted; 0 = unlimited.
    pub client_limit: Option<u64>,
    pub crash_limit: Option<u64>,
    pub avg_results_per_client_limit: Option<u64>,
    pub avg_cpu_seconds_per_client_limit: Option<f64>,
    pub avg_network_bytes_per_client_limit: Option<u64>,
    pub per_client_cpu_limit: Option<f64>,
    pub per_client_network_bytes_limit: Option<u64>,
}

impl HuntSpec {
    pub fn standard(flow: FlowArgs) -> Self {
        Self::with_args(HuntArguments::Standard { flow })
    }

    pub fn variable(groups: Vec<VariableFlowGroup>) -> Self {
        Self::with_args(HuntArguments::Variable { groups })
    }

    fn with_args(args: HuntArguments) -> Self {
        Self {
            description: String::new(),
            args,
            client_rule_set: ClientRuleSet::default(),
            duration_ms: None,
            client_rate: None,
            client_limit: None,
            crash_limit: None,
            avg_results_per_client_limit: None,
            avg_cpu_seconds_per_client_limit: None,
            avg_network_bytes_per_client_limit: None,
            per_client_cpu_limit: None,
            per_client_network_bytes_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntRecord {
    pub hunt_id: HuntId,
    pub description: String,
    pub args: HuntArguments,
    pub client_rule_set: ClientRuleSet,
    pub hunt_state: HuntState,
    pub stop_reason: Option<StopReason>,
    pub duration_ms: u64,
    pub client_rate: f64,
    pub client_limit: u64,
    pub crash_limit: u64,
    pub avg_results_per_client_limit: u64,
    pub avg_cpu_seconds_per_client_limit: f64,
    pub avg_network_bytes_per_client_limit: u64,
    pub per_client_cpu_limit: Option<f64>,
    pub per_client_network_bytes_limit: Option<u64>,
    pub num_clients_at_start_time: u64,
    /// Admission slots taken. Reserved before the client's flow is created,
    /// so it can run ahead of the flow count but never behind.
    #[serde(default)]
    pub num_clients_admitted: u64,
    pub create_time: u64,
    /// First transition to STARTED. Never reset.
    pub init_start_time: Option<u64>,
    pub last_start_time: Option<u64>,
    pub revision: u64,
}

impl HuntRecord {
    /// A fresh PAUSED hunt with defaults applied.
    pub fn from_spec(hunt_id: HuntId, spec: HuntSpec, defaults: &HuntSettings, now: u64) -> Self {
        Self {
            hunt_id,
            description: spec.description,
            args: spec.args,
            client_rule_set: spec.client_rule_set,
            hunt_state: HuntState::Paused,
            stop_reason: None,
            duration_ms: spec
                .duration_ms
                .unwrap_or(defaults.default_duration_secs * 1000),
            client_rate: spec.client_rate.unwrap_or(defaults.default_client_rate),
            client_limit: spec.client_limit.unwrap_or(defaults.default_client_limit),
            crash_limit: spec.crash_limit.unwrap_or(defaults.default_crash_limit),
            avg_results_per_client_limit: spec
                .avg_results_per_client_limit
                .unwrap_or(defaults.default_avg_results_per_client_limit),
            avg_cpu_seconds_per_client_limit: spec
                .avg_cpu_seconds_per_client_limit
                .unwrap_or(defaults.default_avg_cpu_seconds_per_client_limit),
            avg_network_bytes_per_client_limit: spec
                .avg_network_bytes_per_client_limit
                .unwrap_or(defaults.default_avg_network_bytes_per_client_limit),
            per_client_cpu_limit: spec.per_client_cpu_limit,
            per_client_network_bytes_limit: spec.per_client_network_bytes_limit,
            num_clients_at_start_time: 0,
            num_clients_admitted: 0,
            create_time: now,
            init_start_time: None,
            last_start_time: None,
            revision: 0,
        }
    }

    /// `init_start_time + duration`; a hunt that never started never expires.
    pub fn expiry_time(&self) -> Option<u64> {
        self.init_start_time
            .map(|start| start.saturating_add(self.duration_ms))
    }

    pub fn expired(&self, now: u64) -> bool {
        self.expiry_time().is_some_and(|expiry| now > expiry)
    }
}

/// Aggregates over a hunt's per-client flows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HuntCounters {
    pub num_clients: u64,
    pub num_running: u64,
    pub num_successful: u64,
    pub num_failed: u64,
    pub num_crashed: u64,
    pub total_results: u64,
    pub total_cpu_seconds: f64,
    pub total_network_bytes: u64,
}

impl HuntCounters {
    pub fn all_terminal(&self) -> bool {
        self.num_running == 0
    }

    pub fn avg_results_per_client(&self) -> f64 {
        self.per_client(self.total_results as f64)
    }

    pub fn avg_cpu_seconds_per_client(&self) -> f64 {
        self.per_client(self.total_cpu_seconds)
    }

    pub fn avg_network_bytes_per_client(&self) -> f64 {
        self.per_client(self.total_network_bytes as f64)
    }

    fn per_client(&self, total: f64) -> f64 {
        if self.num_clients == 0 {
            0.0
        } else {
            total / self.num_clients as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_args::TimelineArgs;
    use crate::message::ClientInfo;

    fn timeline() -> FlowArgs {
        FlowArgs::Timeline(TimelineArgs { root: "/".into() })
    }

    fn info(os: &str, labels: &[&str]) -> StartupInfo {
        StartupInfo {
            client_info: ClientInfo {
                client_name: "agent".into(),
                client_version: 3,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                timeline_btime_support: true,
            },
            os: os.into(),
            boot_time: 0,
        }
    }

    #[test]
    fn new_hunt_is_paused_with_defaults() {
        let defaults = HuntSettings::default();
        let hunt = HuntRecord::from_spec(HuntId::random(), HuntSpec::standard(timeline()), &defaults, 5);
        assert_eq!(hunt.hunt_state, HuntState::Paused);
        assert_eq!(hunt.client_limit, defaults.default_client_limit);
        assert_eq!(hunt.crash_limit, defaults.default_crash_limit);
        assert_eq!(hunt.num_clients_at_start_time, 0);
        assert_eq!(hunt.num_clients_admitted, 0);
    }

    #[test]
    fn never_started_hunt_never_expires() {
        let hunt = HuntRecord::from_spec(
            HuntId::random(),
            HuntSpec::standard(timeline()),
            &HuntSettings::default(),
            0,
        );
        assert_eq!(hunt.expiry_time(), None);
        assert!(!hunt.expired(u64::MAX));
    }

    #[test]
    fn expiry_is_start_plus_duration() {
        let mut hunt = HuntRecord::from_spec(
            HuntId::random(),
            HuntSpec {
                duration_ms: Some(1_000),
                ..HuntSpec::standard(timeline())
            },
            &HuntSettings::default(),
            0,
        );
        hunt.init_start_time = Some(500);
        assert_eq!(hunt.expiry_time(), Some(1_500));
        assert!(!hunt.expired(1_500));
        assert!(hunt.expired(1_501));
    }

    #[test]
    fn variable_hunt_selects_group_flow() {
        let a = ClientId::from_index(1);
        let b = ClientId::from_index(2);
        let args = HuntArguments::Variable {
            groups: vec![VariableFlowGroup {
                name: "linux".into(),
                client_ids: vec![a.clone()],
                flow: timeline(),
            }],
        };
        assert_eq!(args.flow_for(&a), Some(&timeline()));
        assert_eq!(args.flow_for(&b), None);
        assert_eq!(args.variable_client_count(), Some(1));
    }

    #[test]
    fn rule_set_match_modes() {
        let linux_prod = info("Linux", &["prod"]);
        let windows = info("Windows", &[]);

        let all = ClientRuleSet {
            match_mode: MatchMode::All,
            rules: vec![
                ClientRule::Os { os: "linux".into() },
                ClientRule::Label { label: "prod".into() },
            ],
        };
        assert!(all.matches(&linux_prod));
        assert!(!all.matches(&windows));

        let any = ClientRuleSet {
            match_mode: MatchMode::Any,
            rules: vec![
                ClientRule::Os { os: "windows".into() },
                ClientRule::Label { label: "prod".into() },
            ],
        };
        assert!(any.matches(&linux_prod));
        assert!(any.matches(&windows));
        assert!(ClientRuleSet::default().matches(&windows));
    }

    #[test]
    fn counters_average_over_admitted_clients() {
        let counters = HuntCounters {
            num_clients: 4,
            total_results: 10,
            total_cpu_seconds: 2.0,
            total_network_bytes: 400,
            ..Default::default()
        };
        assert_eq!(counters.avg_results_per_client(), 2.5);
        assert_eq!(counters.avg_cpu_seconds_per_client(), 0.5);
        assert_eq!(counters.avg_network_bytes_per_client(), 100.0);
        assert_eq!(HuntCounters::default().avg_results_per_client(), 0.0);
    }
}

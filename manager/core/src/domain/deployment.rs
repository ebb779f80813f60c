// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Deployment Aggregate
//!
//! A deployment is one named workload of an application. Each row carries a
//! time-based `id`; an upgrade mints a new row that points back at the row it
//! replaces through `previous_deployment_id`, while `deployment_id` stays the
//! same for the lifetime of the `(application_name, name)` pair.
//!
//! The template is opaque to the manager apart from `scale`, `volumes`, and
//! the resource descriptor used to size admission reservations.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Deployment state machine and its invariants

use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::ids::{name_uuid, now_secs, time_uuid};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const MAX_NAME_LEN: usize = 63;

/// Detail codes written into `status_detail.code` by the reconciler.
pub mod detail_codes {
    pub const ACTIVE: &str = "ACTIVE";
    pub const WAITING: &str = "WAITING";
    pub const TERMINATING: &str = "TERMINATING";
    pub const TERMINATED: &str = "TERMINATED";
    pub const STOPPING: &str = "STOPPING";
    pub const STOPPED: &str = "STOPPED";
    pub const LIMIT_TIME_EXCEED: &str = "LimitTimeExceed";
    pub const LIMIT_SPENDING_EXCEED: &str = "LimitSpendingExceed";
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Init,
    Waiting,
    Active,
    Error,
    Terminating,
    Terminated,
    Upgrading,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 7] = [
        Self::Init,
        Self::Waiting,
        Self::Active,
        Self::Error,
        Self::Terminating,
        Self::Terminated,
        Self::Upgrading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Waiting => "Waiting",
            Self::Active => "Active",
            Self::Error => "Error",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Upgrading => "Upgrading",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// States in which the platform holds an admission reservation for the row.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active | Self::Error | Self::Upgrading)
    }

    /// Whether the reconciler may move a row from `self` to `next`.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Terminating) | (_, Error) => !self.is_terminal(),
            (Terminating, Terminated) => true,
            (Init, Terminated) => true,
            (Init | Terminated | Active | Error, Waiting) => true,
            (Init | Active, Upgrading) => true,
            (Waiting | Upgrading | Error, Active) => true,
            (Upgrading, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = AxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AxError::invalid_param(format!("Unknown deployment status: {}", s)))
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// `{code, message, detail}` attached to the latest status change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl StatusDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn from_error(code: &str, error: &AxError) -> Self {
        Self {
            code: code.to_string(),
            message: error.message().to_string(),
            detail: error.detail().unwrap_or_default().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.message.is_empty() && self.detail.is_empty()
    }
}

/// Limits after which the monitor deletes a deployment. Values are kept as
/// strings because they are stored in a text map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationPolicy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time_seconds: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub spending_cents: String,
}

impl TerminationPolicy {
    fn parse(value: &str) -> Option<f64> {
        value.trim().parse::<f64>().ok().filter(|v| *v > 0.0)
    }

    pub fn time_limit(&self) -> Option<f64> {
        Self::parse(&self.time_seconds)
    }

    pub fn spending_limit(&self) -> Option<f64> {
        Self::parse(&self.spending_cents)
    }

    /// Detail code of the first exceeded limit, spending before time.
    pub fn exceeded(&self, cost_cents: f64, run_time_secs: f64) -> Option<&'static str> {
        if self.spending_limit().is_some_and(|limit| cost_cents > limit) {
            return Some(detail_codes::LIMIT_SPENDING_EXCEED);
        }
        if self.time_limit().is_some_and(|limit| run_time_secs > limit) {
            return Some(detail_codes::LIMIT_TIME_EXCEED);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scale {
    #[serde(default)]
    pub min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<u32>,
}

impl Scale {
    /// Instances the reservation is sized for.
    pub fn instances(&self) -> u32 {
        self.min.max(1)
    }
}

/// Body of `POST /deployments/{id}/scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub desired: Option<u32>,
}

impl ScaleRequest {
    pub fn validate(&self) -> AxResult<()> {
        if self.min < 1 {
            return Err(AxError::invalid_param("scale.min must be at least 1"));
        }
        if let Some(max) = self.max {
            if max < self.min {
                return Err(AxError::invalid_param(format!(
                    "scale.max ({}) must not be lower than scale.min ({})",
                    max, self.min
                )));
            }
        }
        if let Some(desired) = self.desired {
            if desired < self.min || self.max.is_some_and(|max| desired > max) {
                return Err(AxError::invalid_param(format!(
                    "scale.desired ({}) must lie between scale.min and scale.max",
                    desired
                )));
            }
        }
        Ok(())
    }

    /// Replica count the side-car is asked for.
    pub fn replicas(&self) -> u32 {
        self.desired.unwrap_or(self.min)
    }
}

/// CPU and memory the admission controller is asked to hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub cpu_cores: f64,
    pub mem_mib: f64,
}

impl Footprint {
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            cpu_cores: self.cpu_cores * factor as f64,
            mem_mib: self.mem_mib * factor as f64,
        }
    }
}

fn number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Scale block of a template; absent or malformed blocks read as the default.
pub fn template_scale(template: &Value) -> Scale {
    template
        .get("scale")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub fn template_has_volumes(template: &Value) -> bool {
    match template.get("volumes") {
        Some(Value::Object(m)) => !m.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        _ => false,
    }
}

/// Resources of one instance: the top-level descriptor when present,
/// otherwise the sum over `containers[].resources`.
pub fn instance_footprint(template: &Value) -> Footprint {
    let top = Footprint {
        cpu_cores: number(template.get("cpu_cores")),
        mem_mib: number(template.get("mem_mib")),
    };
    if top.cpu_cores > 0.0 || top.mem_mib > 0.0 {
        return top;
    }
    let Some(Value::Array(containers)) = template.get("containers") else {
        return top;
    };
    containers
        .iter()
        .filter_map(|c| c.get("resources"))
        .fold(Footprint::default(), |acc, r| Footprint {
            cpu_cores: acc.cpu_cores + number(r.get("cpu_cores")),
            mem_mib: acc.mem_mib + number(r.get("mem_mib")),
        })
}

pub fn validate_name(name: &str) -> AxResult<()> {
    static NAME: OnceLock<Regex> = OnceLock::new();
    let re = NAME.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("deployment name pattern is valid")
    });
    if !re.is_match(name) {
        return Err(AxError::invalid_param(format!(
            "The deployment name {} is invalid: expect the format ^[a-z0-9]([-a-z0-9]*[a-z0-9])?$.",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AxError::invalid_param(format!(
            "The deployment name {} can not be more than {} characters.",
            name, MAX_NAME_LEN
        )));
    }
    Ok(())
}

// ============================================================================
// Aggregate
// ============================================================================

/// Request body of `POST /deployments` and `PUT /deployments/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub application_name: String,
    pub name: String,
    #[serde(default)]
    pub template: Value,
    #[serde(default)]
    pub termination_policy: Option<TerminationPolicy>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl DeploymentSpec {
    pub fn validate(&self) -> AxResult<()> {
        if self.application_name.is_empty() {
            return Err(AxError::invalid_param("application_name is required"));
        }
        validate_name(&self.name)?;
        if !self.template.is_null() && !self.template.is_object() {
            return Err(AxError::invalid_param("template must be an object"));
        }
        if template_has_volumes(&self.template) && template_scale(&self.template).min > 1 {
            return Err(AxError::invalid_param(
                "Deployments with volumes can not run more than one instance.",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub deployment_id: String,
    pub application_name: String,
    pub name: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_detail: StatusDetail,
    #[serde(default)]
    pub template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_deployment_id: Option<String>,
    #[serde(default)]
    pub termination_policy: TerminationPolicy,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub launch_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub mtime: i64,
}

impl Deployment {
    pub fn new(spec: DeploymentSpec) -> Self {
        let now = now_secs();
        Self {
            id: time_uuid().to_string(),
            deployment_id: Self::stable_id(&spec.application_name, &spec.name),
            application_name: spec.application_name,
            name: spec.name,
            status: DeploymentStatus::Init,
            status_detail: StatusDetail::default(),
            template: spec.template,
            previous_deployment_id: None,
            termination_policy: spec.termination_policy.unwrap_or_default(),
            labels: spec.labels,
            create_time: now,
            launch_time: now,
            end_time: 0,
            mtime: now,
        }
    }

    /// Identity shared by every row of one `(application_name, name)` pair.
    pub fn stable_id(application_name: &str, name: &str) -> String {
        name_uuid(&format!("{}$${}", application_name, name)).to_string()
    }

    /// Serialisation key for the per-deployment lock.
    pub fn key(&self) -> String {
        format!("{}/{}", self.application_name, self.name)
    }

    pub fn heartbeat_key(&self) -> String {
        self.key()
    }

    /// Next generation of this deployment carrying `spec`'s template.
    pub fn upgrade_to(&self, spec: DeploymentSpec) -> Self {
        let mut next = Self::new(spec);
        next.previous_deployment_id = Some(self.id.clone());
        next.status = DeploymentStatus::Upgrading;
        next
    }

    pub fn same_template(&self, other: &Value) -> bool {
        &self.template == other
    }

    pub fn scale(&self) -> Scale {
        template_scale(&self.template)
    }

    pub fn has_volumes(&self) -> bool {
        template_has_volumes(&self.template)
    }

    /// Per-instance resources multiplied by `scale.min` (at least one).
    pub fn footprint(&self) -> Footprint {
        instance_footprint(&self.template).scaled(self.scale().instances())
    }

    /// Replace the template's scale block with `request`.
    pub fn apply_scale(&mut self, request: ScaleRequest) -> AxResult<()> {
        request.validate()?;
        if self.has_volumes() && request.replicas() > 1 {
            return Err(AxError::invalid_param(
                "Scale deployment with volumes is not supported.",
            ));
        }
        let mut scale = self.scale();
        scale.min = request.min;
        scale.max = request.max.or(scale.max.filter(|m| *m >= request.min));
        scale.desired = request.desired;
        let value = serde_json::to_value(scale)?;
        match self.template.as_object_mut() {
            Some(template) => {
                template.insert("scale".to_string(), value);
            }
            None => self.template = serde_json::json!({ "scale": value }),
        }
        Ok(())
    }

    /// Move to `next`, stamping `mtime` (and `end_time` on termination).
    pub fn transition(&mut self, next: DeploymentStatus, detail: Option<StatusDetail>) -> AxResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AxError::new(
                codes::ERR_API_INVALID_PARAM,
                format!("Can not move deployment {} from {} to {}.", self.key(), self.status, next),
            ));
        }
        self.status = next;
        if let Some(detail) = detail {
            self.status_detail = detail;
        }
        let now = now_secs();
        self.mtime = now;
        match next {
            DeploymentStatus::Terminated => self.end_time = now,
            DeploymentStatus::Waiting if self.end_time != 0 => {
                self.launch_time = now;
                self.end_time = 0;
            }
            _ => {}
        }
        Ok(())
    }

    /// Seconds the current generation has been running.
    pub fn run_time(&self, now: i64) -> i64 {
        let end = if self.end_time > 0 { self.end_time } else { now };
        (end - self.launch_time).max(0)
    }

    /// Detail code of the termination-policy limit this row has exceeded.
    pub fn should_terminate(&self, cost_cents: f64, now: i64) -> Option<&'static str> {
        if matches!(self.status, DeploymentStatus::Terminating | DeploymentStatus::Terminated) {
            return None;
        }
        self.termination_policy.exceeded(cost_cents, self.run_time(now) as f64)
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}({})", self.application_name, self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(template: Value) -> DeploymentSpec {
        DeploymentSpec {
            application_name: "app-1".into(),
            name: "d1".into(),
            template,
            termination_policy: None,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_names() {
        assert!(validate_name("web-1").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("-web").is_err());
        assert!(validate_name("Web").is_err());
        assert!(validate_name("web-").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_footprint_top_level_times_min_scale() {
        let d = Deployment::new(spec(json!({"cpu_cores": 1.0, "mem_mib": 512, "scale": {"min": 3}})));
        assert_eq!(d.footprint(), Footprint { cpu_cores: 3.0, mem_mib: 1536.0 });
    }

    #[test]
    fn test_footprint_sums_containers_and_defaults_scale() {
        let d = Deployment::new(spec(json!({
            "containers": [
                {"resources": {"cpu_cores": 0.5, "mem_mib": 256}},
                {"resources": {"cpu_cores": "0.25", "mem_mib": 128}},
                {"image": "sidecar"}
            ]
        })));
        assert_eq!(d.footprint(), Footprint { cpu_cores: 0.75, mem_mib: 384.0 });
    }

    #[test]
    fn test_ids_are_stable_across_generations() {
        let d = Deployment::new(spec(json!({"v": "A"})));
        let next = d.upgrade_to(spec(json!({"v": "B"})));
        assert_eq!(d.deployment_id, next.deployment_id);
        assert_ne!(d.id, next.id);
        assert_eq!(next.previous_deployment_id.as_deref(), Some(d.id.as_str()));
        assert_eq!(next.status, DeploymentStatus::Upgrading);
        assert!(!next.same_template(&d.template));
    }

    #[test]
    fn test_transitions() {
        let mut d = Deployment::new(spec(json!({})));
        d.transition(DeploymentStatus::Waiting, None).unwrap();
        d.transition(DeploymentStatus::Active, Some(StatusDetail::new(detail_codes::ACTIVE, "ok")))
            .unwrap();
        d.transition(DeploymentStatus::Terminating, None).unwrap();
        d.transition(DeploymentStatus::Terminated, None).unwrap();
        assert!(d.end_time > 0);
        assert!(d.transition(DeploymentStatus::Active, None).is_err());
        assert!(d.transition(DeploymentStatus::Error, None).is_err());
        d.transition(DeploymentStatus::Waiting, None).unwrap();
        assert_eq!(d.end_time, 0);
    }

    #[test]
    fn test_scale_request_rules() {
        assert!(ScaleRequest { min: 0, max: None, desired: None }.validate().is_err());
        assert!(ScaleRequest { min: 3, max: Some(2), desired: None }.validate().is_err());
        assert!(ScaleRequest { min: 2, max: Some(2), desired: None }.validate().is_ok());
        assert!(ScaleRequest { min: 2, max: Some(4), desired: Some(5) }.validate().is_err());
        assert!(ScaleRequest { min: 2, max: None, desired: Some(1) }.validate().is_err());
        assert_eq!(ScaleRequest { min: 2, max: Some(4), desired: Some(3) }.replicas(), 3);
        assert_eq!(ScaleRequest { min: 2, max: None, desired: None }.replicas(), 2);

        let mut with_volumes = Deployment::new(spec(json!({"volumes": {"data": {}}})));
        assert!(with_volumes.apply_scale(ScaleRequest { min: 2, max: None, desired: None }).is_err());
        with_volumes.apply_scale(ScaleRequest { min: 1, max: None, desired: None }).unwrap();

        let mut d = Deployment::new(spec(json!({"cpu_cores": 1, "scale": {"min": 1, "max": 4}})));
        d.apply_scale(ScaleRequest { min: 2, max: None, desired: None }).unwrap();
        assert_eq!(d.scale(), Scale { min: 2, max: Some(4), desired: None });
        assert_eq!(d.footprint().cpu_cores, 2.0);
    }

    #[test]
    fn test_spec_rejects_volumes_with_replicas() {
        let s = spec(json!({"volumes": [{"name": "data"}], "scale": {"min": 2}}));
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_termination_policy() {
        let mut d = Deployment::new(spec(json!({})));
        d.termination_policy = TerminationPolicy {
            time_seconds: "3600".into(),
            spending_cents: "100".into(),
        };
        let start = d.launch_time;
        assert_eq!(d.should_terminate(10.0, start + 60), None);
        assert_eq!(d.should_terminate(150.0, start + 60), Some(detail_codes::LIMIT_SPENDING_EXCEED));
        assert_eq!(d.should_terminate(0.0, start + 7200), Some(detail_codes::LIMIT_TIME_EXCEED));

        d.termination_policy.time_seconds = "garbage".into();
        assert_eq!(d.should_terminate(0.0, start + 7200), None);
    }

    #[test]
    fn test_status_wire_form() {
        assert_eq!(serde_json::to_value(DeploymentStatus::Active).unwrap(), json!("Active"));
        assert_eq!("terminated".parse::<DeploymentStatus>().unwrap(), DeploymentStatus::Terminated);
    }
}

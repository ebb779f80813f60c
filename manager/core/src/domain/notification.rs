// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Notification Domain
//!
//! Events, routing rules and the closed catalogue of notification codes.
//!
//! Every event carries a code from [`taxonomy`]; the code fixes its channel,
//! severity and human message. Rules select events by code, channel and
//! severity and name the recipients that should hear about them.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Shared vocabulary of the manager (producer side) and the
//!   notifier (dispatcher side)

use crate::domain::error::{AxError, AxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Topics
// ============================================================================

/// Inbound topic every producer writes to.
pub const TOPIC_AXNC: &str = "axnc";
pub const TOPIC_UI: &str = "axnc-ui";
pub const TOPIC_EMAIL: &str = "axnc-email";
pub const TOPIC_SLACK: &str = "axnc-slack";
pub const TOPIC_SUPPORT: &str = "axnc-support";

pub const CHANNEL_TOPICS: [&str; 4] = [TOPIC_UI, TOPIC_EMAIL, TOPIC_SLACK, TOPIC_SUPPORT];

pub const DEFAULT_RULE_ID: &str = "default-rule";

// ============================================================================
// Channel & Severity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    System,
    Configuration,
    Job,
    Deployment,
    Spending,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::System,
        Channel::Configuration,
        Channel::Job,
        Channel::Deployment,
        Channel::Spending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::System => "system",
            Channel::Configuration => "configuration",
            Channel::Job => "job",
            Channel::Deployment => "deployment",
            Channel::Spending => "spending",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AxError::invalid_param(format!("Invalid channel supplied ({})", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Critical, Severity::Warning, Severity::Info];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| AxError::invalid_param(format!("Invalid severity supplied ({})", s)))
    }
}

// ============================================================================
// Codes
// ============================================================================

pub mod code {
    pub const CONFIGURATION_INVALID_SMTP: &str = "configuration.notification.invalid_smtp";
    pub const CONFIGURATION_INVALID_SLACK: &str = "configuration.notification.invalid_slack";

    pub const JOB_CI_INVALID_COMMAND: &str = "job.ci.invalid_command";
    pub const JOB_CI_INVALID_EVENT_TYPE: &str = "job.ci.invalid_event_type";
    pub const JOB_CI_INVALID_SCM_TYPE: &str = "job.ci.invalid_scm_type";
    pub const JOB_CI_EVENT_CREATION_FAILURE: &str = "job.ci.event_creation_failure";
    pub const JOB_CI_TEMPLATE_NOT_FOUND: &str = "job.ci.template_not_found";
    pub const JOB_CI_YAML_UPDATE_FAILURE: &str = "job.ci.yaml_update_failure";
    pub const JOB_CI_STATUS_REPORTING_FAILURE: &str = "job.ci.status_reporting_failure";
    pub const JOB_CI_ELB_CREATION_FAILURE: &str = "job.ci.elb_creation_failure";
    pub const JOB_CI_ELB_DELETION_FAILURE: &str = "job.ci.elb_deletion_failure";
    pub const JOB_CI_ELB_VERIFICATION_FAILURE: &str = "job.ci.elb_verification_failure";
    pub const JOB_CI_WEBHOOK_CREATION_FAILURE: &str = "job.ci.webhook_creation_failure";
    pub const JOB_CI_WEBHOOK_DELETION_FAILURE: &str = "job.ci.webhook_deletion_failure";
    pub const JOB_CI_WEBHOOK_VERIFICATION_FAILURE: &str = "job.ci.webhook_verification_failure";
    pub const JOB_CI_REPO_NOT_FOUND: &str = "job.ci.repo_not_found";

    pub const JOB_STATUS_STARTED: &str = "job.status.started";
    pub const JOB_STATUS_SUCCESS: &str = "job.status.success";
    pub const JOB_STATUS_FAILED: &str = "job.status.failed";

    pub const JOB_POLICY_INVALID_ENABLED_POLICY: &str = "job.policy.invalid_enabled_policy";
    pub const JOB_POLICY_INVALID_POLICY_BECOMES_VALID: &str = "job.policy.invalid_policy_becomes_valid";
    pub const JOB_POLICY_ENABLED_POLICY: &str = "job.policy.enabled_policy";
    pub const JOB_POLICY_DISABLED_POLICY: &str = "job.policy.disabled_policy";

    pub const DEPLOYMENT_STATUS_CHANGED: &str = "deployment.status.changed";
}

/// A row of the closed code catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCode {
    pub code: String,
    pub channel: Channel,
    pub severity: Severity,
    pub message: String,
    /// Exempt from the per-code rate limit.
    #[serde(default)]
    pub no_limit: bool,
}

impl NotificationCode {
    fn new(code: &str, channel: Channel, severity: Severity, message: &str, no_limit: bool) -> Self {
        Self {
            code: code.to_string(),
            channel,
            severity,
            message: message.to_string(),
            no_limit,
        }
    }
}

/// The complete, closed set of notification codes.
pub fn taxonomy() -> Vec<NotificationCode> {
    use Channel::*;
    use Severity::*;
    let c = NotificationCode::new;
    vec![
        c(code::CONFIGURATION_INVALID_SMTP, Configuration, Critical, "The SMTP configuration is invalid", false),
        c(code::CONFIGURATION_INVALID_SLACK, Configuration, Critical, "The Slack configuration is invalid", false),
        c(code::JOB_CI_INVALID_COMMAND, Job, Warning, "Invalid command in CI event", false),
        c(code::JOB_CI_INVALID_EVENT_TYPE, Job, Warning, "Unsupported CI event type", false),
        c(code::JOB_CI_INVALID_SCM_TYPE, Job, Warning, "Unsupported SCM type", false),
        c(code::JOB_CI_EVENT_CREATION_FAILURE, Job, Critical, "Failed to create job from CI event", true),
        c(code::JOB_CI_TEMPLATE_NOT_FOUND, Job, Warning, "No template found for CI event", true),
        c(code::JOB_CI_YAML_UPDATE_FAILURE, Job, Critical, "Failed to update templates from repository", false),
        c(code::JOB_CI_STATUS_REPORTING_FAILURE, Job, Warning, "Failed to report job status to SCM", false),
        c(code::JOB_CI_ELB_CREATION_FAILURE, Job, Critical, "Failed to create webhook load balancer", false),
        c(code::JOB_CI_ELB_DELETION_FAILURE, Job, Critical, "Failed to delete webhook load balancer", false),
        c(code::JOB_CI_ELB_VERIFICATION_FAILURE, Job, Critical, "Failed to verify webhook load balancer", false),
        c(code::JOB_CI_WEBHOOK_CREATION_FAILURE, Job, Critical, "Failed to create SCM webhook", false),
        c(code::JOB_CI_WEBHOOK_DELETION_FAILURE, Job, Critical, "Failed to delete SCM webhook", false),
        c(code::JOB_CI_WEBHOOK_VERIFICATION_FAILURE, Job, Critical, "Failed to verify SCM webhook", false),
        c(code::JOB_CI_REPO_NOT_FOUND, Job, Warning, "Repository not found", false),
        c(code::JOB_STATUS_STARTED, Job, Info, "Job started", true),
        c(code::JOB_STATUS_SUCCESS, Job, Info, "Job succeeded", true),
        c(code::JOB_STATUS_FAILED, Job, Critical, "Job failed", true),
        c(code::JOB_POLICY_INVALID_ENABLED_POLICY, Job, Warning, "An enabled policy became invalid", true),
        c(code::JOB_POLICY_INVALID_POLICY_BECOMES_VALID, Job, Info, "An invalid policy became valid", true),
        c(code::JOB_POLICY_ENABLED_POLICY, Job, Info, "Policy enabled", true),
        c(code::JOB_POLICY_DISABLED_POLICY, Job, Info, "Policy disabled", true),
        c(code::DEPLOYMENT_STATUS_CHANGED, Deployment, Info, "Deployment status changed", true),
    ]
}

pub fn lookup(code: &str) -> Option<NotificationCode> {
    taxonomy().into_iter().find(|c| c.code == code)
}

// ============================================================================
// Event
// ============================================================================

/// The message carried on every notification topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotificationMessage {
    pub event_id: String,
    #[serde(default)]
    pub trace_id: String,
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub facility: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub severity: String,
    /// Microseconds since the epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

impl EventNotificationMessage {
    /// Stamp channel, severity and message from the catalogue entry.
    pub fn classify(&mut self, entry: &NotificationCode) {
        self.channel = entry.channel.to_string();
        self.severity = entry.severity.to_string();
        self.message = entry.message.clone();
        if self.trace_id.is_empty() {
            self.trace_id = self.event_id.clone();
        }
    }
}

// ============================================================================
// Rule
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub severities: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Seconds since the epoch.
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub last_modified_time: i64,
}

fn enabled_by_default() -> bool {
    true
}

impl Rule {
    /// Seeded at notifier startup when no rule with this id exists.
    pub fn default_rule() -> Self {
        Self {
            rule_id: DEFAULT_RULE_ID.to_string(),
            name: "Default rule".to_string(),
            channels: [
                Channel::System,
                Channel::Configuration,
                Channel::Job,
                Channel::Deployment,
                Channel::Spending,
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            codes: Vec::new(),
            severities: vec![Severity::Critical.to_string(), Severity::Warning.to_string()],
            recipients: vec!["super_admin@group".to_string(), "admin@group".to_string()],
            enabled: true,
            create_time: 0,
            last_modified_time: 0,
        }
    }

    /// An enabled rule matches when every non-empty dimension contains the
    /// event's value.
    pub fn matches(&self, code: &str, channel: &str, severity: &str) -> bool {
        fn admits(list: &[String], value: &str) -> bool {
            list.is_empty() || list.iter().any(|v| v == value)
        }
        self.enabled
            && admits(&self.codes, code)
            && admits(&self.channels, channel)
            && admits(&self.severities, severity)
    }

    pub fn validate(&self) -> AxResult<()> {
        if self.name.trim().is_empty() {
            return Err(AxError::invalid_param("Must specify a rule name"));
        }
        if self.channels.is_empty() {
            return Err(AxError::invalid_param("Must specify at least one channel"));
        }
        for channel in &self.channels {
            channel.parse::<Channel>()?;
        }
        if self.severities.is_empty() {
            return Err(AxError::invalid_param("Must specify at least one severity"));
        }
        for severity in &self.severities {
            severity.parse::<Severity>()?;
        }
        if self.recipients.is_empty() {
            return Err(AxError::invalid_param("Must specify at least one recipient"));
        }
        for c in &self.codes {
            if lookup(c).is_none() {
                return Err(AxError::invalid_param(format!("Invalid code supplied ({})", c)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::codes;

    #[test]
    fn test_taxonomy_is_closed_and_unique() {
        let all = taxonomy();
        assert_eq!(all.len(), 24);
        let mut names: Vec<_> = all.iter().map(|c| c.code.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all.len());
        assert_eq!(
            lookup(code::DEPLOYMENT_STATUS_CHANGED).unwrap().channel,
            Channel::Deployment
        );
        assert!(lookup("job.status.exploded").is_none());
    }

    #[test]
    fn test_rule_matching() {
        let mut rule = Rule::default_rule();
        assert!(rule.matches(code::JOB_STATUS_FAILED, "job", "critical"));
        assert!(!rule.matches(code::JOB_STATUS_SUCCESS, "job", "info"));

        rule.codes = vec![code::JOB_STATUS_FAILED.into()];
        assert!(!rule.matches(code::JOB_CI_REPO_NOT_FOUND, "job", "warning"));

        rule.enabled = false;
        assert!(!rule.matches(code::JOB_STATUS_FAILED, "job", "critical"));
    }

    #[test]
    fn test_empty_dimensions_match_anything() {
        let rule = Rule {
            channels: vec![],
            severities: vec![],
            ..Rule::default_rule()
        };
        assert!(rule.matches("anything", "spending", "info"));
    }

    #[test]
    fn test_rule_validation() {
        assert!(Rule::default_rule().validate().is_ok());

        let bad_channel = Rule {
            channels: vec!["pager".into()],
            ..Rule::default_rule()
        };
        assert!(bad_channel.validate().unwrap_err().is_code(codes::ERR_API_INVALID_PARAM));

        let no_recipients = Rule {
            recipients: vec![],
            ..Rule::default_rule()
        };
        assert!(no_recipients.validate().is_err());

        let bad_code = Rule {
            codes: vec!["nope".into()],
            ..Rule::default_rule()
        };
        assert!(bad_code.validate().is_err());
    }

    #[test]
    fn test_classify_defaults_trace_id() {
        let mut event = EventNotificationMessage {
            event_id: "e1".into(),
            trace_id: String::new(),
            code: code::JOB_STATUS_FAILED.into(),
            message: String::new(),
            facility: "axamm".into(),
            cluster: String::new(),
            channel: String::new(),
            severity: String::new(),
            timestamp: 1,
            recipients: vec![],
            detail: BTreeMap::new(),
        };
        event.classify(&lookup(code::JOB_STATUS_FAILED).unwrap());
        assert_eq!(event.trace_id, "e1");
        assert_eq!(event.channel, "job");
        assert_eq!(event.severity, "critical");
    }
}

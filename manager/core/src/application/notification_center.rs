// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Notification Center
//!
//! Rule management and the dispatcher behind the `axnc` topic.
//!
//! ```text
//! axnc ──► EventDispatcher ──► events table
//!                 │
//!                 ├──► axnc-ui ──────► ChannelWorker(ui)
//!                 ├──► axnc-email ───► ChannelWorker(email)
//!                 ├──► axnc-slack ───► ChannelWorker(slack)
//!                 └──► axnc-support ─► ChannelWorker(support)
//! ```
//!
//! Recipients are the union of the event's explicit recipients and those of
//! every enabled rule matching the event. A code that is not marked
//! `no_limit` is delivered to the user-facing topics at most once per
//! [`RATE_LIMIT_WINDOW`]; throttled events still reach the support topic.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Routing of platform events to delivery channels

use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::ids::{now_secs, time_uuid};
use crate::domain::notification::{
    code, lookup, taxonomy, Channel, EventNotificationMessage, NotificationCode, Rule,
    DEFAULT_RULE_ID, TOPIC_EMAIL, TOPIC_SLACK, TOPIC_SUPPORT, TOPIC_UI,
};
use crate::domain::repository::{EventRepository, NotificationCodeRepository, RuleRepository};
use crate::infrastructure::bus::{BusMessage, BusProducer, Consumer, ConsumerConfig, MessageHandler, MessageLog};
use crate::infrastructure::retry::{retry, RetryConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DISPATCHER_GROUP: &str = "axnc-dispatcher";
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10 * 60);
/// Budget for republishing one event onto a channel topic.
pub const REPUBLISH_BUDGET: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// Rule Management
// ============================================================================

#[async_trait]
pub trait NotificationCenterService: Send + Sync {
    async fn list_rules(&self) -> AxResult<Vec<Rule>>;

    async fn get_rule(&self, rule_id: &str) -> AxResult<Rule>;

    /// Insert or replace `rule`, minting an id for new rules.
    async fn update_rule(&self, rule: Rule) -> AxResult<Rule>;

    async fn delete_rule(&self, rule_id: &str) -> AxResult<()>;

    async fn list_events(&self, trace_id: Option<&str>, limit: usize) -> AxResult<Vec<EventNotificationMessage>>;

    async fn list_codes(&self) -> AxResult<Vec<NotificationCode>>;

    /// Write the default rule when it is missing and the code catalogue.
    async fn seed_defaults(&self) -> AxResult<()>;
}

pub struct StandardNotificationCenter {
    rules: Arc<dyn RuleRepository>,
    events: Arc<dyn EventRepository>,
    codes: Arc<dyn NotificationCodeRepository>,
}

impl StandardNotificationCenter {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        events: Arc<dyn EventRepository>,
        codes: Arc<dyn NotificationCodeRepository>,
    ) -> Self {
        Self { rules, events, codes }
    }
}

#[async_trait]
impl NotificationCenterService for StandardNotificationCenter {
    async fn list_rules(&self) -> AxResult<Vec<Rule>> {
        Ok(self.rules.list_rules().await?)
    }

    async fn get_rule(&self, rule_id: &str) -> AxResult<Rule> {
        self.rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| AxError::not_found(format!("Rule {} is not found.", rule_id)))
    }

    async fn update_rule(&self, mut rule: Rule) -> AxResult<Rule> {
        rule.validate()?;
        let now = now_secs();
        let existing = if rule.rule_id.is_empty() {
            rule.rule_id = time_uuid().to_string();
            None
        } else {
            self.rules.get_rule(&rule.rule_id).await?
        };
        rule.create_time = existing.map(|r| r.create_time).unwrap_or(now);
        rule.last_modified_time = now;
        self.rules.save_rule(&rule).await?;
        info!("Saved notification rule {} ({})", rule.rule_id, rule.name);
        Ok(rule)
    }

    async fn delete_rule(&self, rule_id: &str) -> AxResult<()> {
        self.rules.delete_rule(rule_id).await?;
        info!("Deleted notification rule {}", rule_id);
        Ok(())
    }

    async fn list_events(&self, trace_id: Option<&str>, limit: usize) -> AxResult<Vec<EventNotificationMessage>> {
        Ok(self.events.list_events(trace_id, limit).await?)
    }

    async fn list_codes(&self) -> AxResult<Vec<NotificationCode>> {
        Ok(self.codes.list_codes().await?)
    }

    async fn seed_defaults(&self) -> AxResult<()> {
        if self.rules.get_rule(DEFAULT_RULE_ID).await?.is_none() {
            let mut rule = Rule::default_rule();
            let now = now_secs();
            rule.create_time = now;
            rule.last_modified_time = now;
            self.rules.save_rule(&rule).await?;
            info!("Seeded the default notification rule");
        }
        let catalogue = taxonomy();
        for entry in &catalogue {
            self.codes.save_code(entry).await?;
        }
        info!("Seeded {} notification codes", catalogue.len());
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Consumer of the `axnc` topic.
pub struct EventDispatcher {
    rules: Arc<dyn RuleRepository>,
    events: Arc<dyn EventRepository>,
    producer: BusProducer,
    cluster: String,
    republish_retry: RetryConfig,
    /// Placeholders replaced in detail values, e.g. `%%AXOPS_EXT_DNS%%`.
    substitutions: Vec<(String, String)>,
    /// Last delivery timestamp (microseconds) per code.
    last_sent: Mutex<HashMap<String, i64>>,
}

impl EventDispatcher {
    pub fn new(rules: Arc<dyn RuleRepository>, events: Arc<dyn EventRepository>, producer: BusProducer) -> Self {
        Self {
            rules,
            events,
            producer,
            cluster: String::new(),
            republish_retry: RetryConfig::any_error(REPUBLISH_BUDGET),
            substitutions: Vec::new(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_substitution(mut self, placeholder: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutions.push((placeholder.into(), value.into()));
        self
    }

    pub fn with_republish_retry(mut self, retry: RetryConfig) -> Self {
        self.republish_retry = retry;
        self
    }

    /// True when `event` must be withheld from the user-facing topics. Every
    /// call records the event as the latest of its code.
    fn throttle(&self, event: &EventNotificationMessage, entry: &NotificationCode) -> bool {
        let window = RATE_LIMIT_WINDOW.as_micros() as i64;
        let mut last_sent = self.last_sent.lock();
        let previous = last_sent.insert(event.code.clone(), event.timestamp);
        if entry.no_limit {
            return false;
        }
        previous.is_some_and(|at| event.timestamp - at < window)
    }

    async fn resolve_recipients(&self, event: &EventNotificationMessage) -> AxResult<Vec<String>> {
        let mut recipients: BTreeSet<String> = event.recipients.iter().cloned().collect();
        for rule in self.rules.list_rules().await? {
            if rule.matches(&event.code, &event.channel, &event.severity) {
                recipients.extend(rule.recipients);
            }
        }
        Ok(recipients.into_iter().collect())
    }

    /// Topics `event` goes to, with the recipients each one carries.
    fn route(event: &EventNotificationMessage, throttled: bool) -> Vec<(&'static str, Vec<String>)> {
        let mut routes = Vec::new();
        let config_failure = [code::CONFIGURATION_INVALID_SMTP, code::CONFIGURATION_INVALID_SLACK]
            .contains(&event.code.as_str());
        if !throttled && !config_failure {
            routes.push((TOPIC_UI, ui_recipients(&event.recipients)));
            let email = email_recipients(&event.recipients);
            if !email.is_empty() {
                routes.push((TOPIC_EMAIL, email));
            }
            let slack = slack_recipients(&event.recipients);
            if !slack.is_empty() {
                routes.push((TOPIC_SLACK, slack));
            }
        }
        if event.channel == Channel::System.as_str() {
            routes.push((TOPIC_SUPPORT, Vec::new()));
        }
        routes
    }

    pub async fn dispatch(&self, mut event: EventNotificationMessage) -> AxResult<Vec<&'static str>> {
        let entry = lookup(&event.code).ok_or_else(|| {
            AxError::new(codes::ERR_EVENT_INVALID, format!("Unrecognizable event code ({})", event.code))
        })?;
        event.classify(&entry);
        if event.cluster.is_empty() {
            event.cluster = self.cluster.clone();
        }
        event.recipients = self.resolve_recipients(&event).await?;
        for value in event.detail.values_mut() {
            for (placeholder, replacement) in &self.substitutions {
                if value.contains(placeholder.as_str()) {
                    *value = value.replace(placeholder.as_str(), replacement);
                }
            }
        }
        self.events.save_event(&event).await?;

        let throttled = self.throttle(&event, &entry);
        if throttled {
            info!("Throttling event {} ({})", event.event_id, event.code);
        }

        let mut sent = Vec::new();
        for (topic, recipients) in Self::route(&event, throttled) {
            let mut copy = event.clone();
            copy.recipients = recipients;
            let payload = serde_json::to_string(&copy)?;
            let producer = &self.producer;
            let key = &event.trace_id;
            let result = retry(Some(&self.republish_retry), || producer.send(topic, key, &payload)).await;
            match result {
                Ok(_) => sent.push(topic),
                Err(e) => error!("Failed to send event {} to {}: {}", event.event_id, topic, e),
            }
        }
        metrics::counter!("axamm_notifications_dispatched_total", "code" => event.code.clone()).increment(1);
        Ok(sent)
    }
}

fn ui_recipients(recipients: &[String]) -> Vec<String> {
    recipients.iter().filter(|r| !r.ends_with("@slack")).cloned().collect()
}

fn email_recipients(recipients: &[String]) -> Vec<String> {
    recipients
        .iter()
        .filter(|r| r.contains('@'))
        .filter(|r| !["@slack", "@internal", "@group"].iter().any(|s| r.ends_with(s)))
        .cloned()
        .collect()
}

fn slack_recipients(recipients: &[String]) -> Vec<String> {
    recipients.iter().filter(|r| r.ends_with("@slack")).cloned().collect()
}

#[async_trait]
impl MessageHandler for EventDispatcher {
    async fn handle(&self, message: &BusMessage) -> AxResult<()> {
        let event: EventNotificationMessage = match serde_json::from_str(&message.value) {
            Ok(event) => event,
            Err(e) => {
                // Undecodable payloads are dropped rather than retried.
                error!("Dropping malformed event at {}@{}: {}", message.partition, message.offset, e);
                return Ok(());
            }
        };
        match self.dispatch(event).await {
            Ok(topics) => {
                debug!("Dispatched event to {:?}", topics);
                Ok(())
            }
            Err(e) if e.is_code(codes::ERR_EVENT_INVALID) => {
                warn!("Dropping event: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Channel Workers
// ============================================================================

/// Delivery transport of one channel topic.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn deliver(&self, event: &EventNotificationMessage) -> AxResult<()>;
}

/// Sink that records deliveries in the log. Transports plug in behind
/// [`ChannelSink`].
pub struct LogSink {
    pub topic: &'static str,
}

#[async_trait]
impl ChannelSink for LogSink {
    async fn deliver(&self, event: &EventNotificationMessage) -> AxResult<()> {
        info!(
            "[{}] {} ({}) for {:?}",
            self.topic, event.code, event.severity, event.recipients
        );
        Ok(())
    }
}

struct SinkHandler(Arc<dyn ChannelSink>);

#[async_trait]
impl MessageHandler for SinkHandler {
    async fn handle(&self, message: &BusMessage) -> AxResult<()> {
        let event: EventNotificationMessage = serde_json::from_str(&message.value)?;
        self.0.deliver(&event).await
    }
}

#[derive(Debug, Clone)]
pub struct ChannelWorkerConfig {
    pub topic: String,
    pub group: String,
    pub concurrency: usize,
    pub retry: Option<RetryConfig>,
}

impl ChannelWorkerConfig {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: format!("{}-worker", topic),
            concurrency: 1,
            retry: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Consumer group of `concurrency` members feeding one sink.
#[derive(Clone)]
pub struct ChannelWorker {
    log: Arc<dyn MessageLog>,
    config: ChannelWorkerConfig,
    sink: Arc<dyn ChannelSink>,
}

impl ChannelWorker {
    pub fn new(log: Arc<dyn MessageLog>, config: ChannelWorkerConfig, sink: Arc<dyn ChannelSink>) -> Self {
        Self { log, config, sink }
    }

    /// Default worker set: one member per topic, logging sinks.
    pub fn defaults(log: Arc<dyn MessageLog>) -> Vec<Self> {
        [TOPIC_UI, TOPIC_EMAIL, TOPIC_SLACK, TOPIC_SUPPORT]
            .into_iter()
            .map(|topic| Self::new(log.clone(), ChannelWorkerConfig::new(topic), Arc::new(LogSink { topic })))
            .collect()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let handler: Arc<dyn MessageHandler> = Arc::new(SinkHandler(self.sink));
        let mut members = JoinSet::new();
        for i in 0..self.config.concurrency {
            let mut consumer = ConsumerConfig::new(
                self.config.topic.clone(),
                self.config.group.clone(),
                format!("{}-{}", self.config.group, i),
            );
            consumer.retry = self.config.retry.clone();
            members.spawn(Consumer::new(self.log.clone(), consumer).run(handler.clone(), cancel.clone()));
        }
        while members.join_next().await.is_some() {}
        info!("Channel worker {} stopped", self.config.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::monotonic_micros;
    use crate::domain::notification::TOPIC_AXNC;
    use crate::infrastructure::axdb::memory::InMemoryDatabase;
    use crate::infrastructure::axdb::schema::notification_tables;
    use crate::infrastructure::bus::InMemoryLog;
    use crate::infrastructure::repositories::{AxdbCodeRepository, AxdbEventRepository, AxdbRuleRepository};
    use std::collections::BTreeMap;

    struct Fixture {
        center: StandardNotificationCenter,
        dispatcher: EventDispatcher,
        log: Arc<InMemoryLog>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(InMemoryDatabase::with_tables(notification_tables()));
        let rules = Arc::new(AxdbRuleRepository::new(db.clone()));
        let events = Arc::new(AxdbEventRepository::new(db.clone()));
        let log = Arc::new(InMemoryLog::new(1));
        Fixture {
            center: StandardNotificationCenter::new(rules.clone(), events.clone(), Arc::new(AxdbCodeRepository::new(db))),
            dispatcher: EventDispatcher::new(rules, events, BusProducer::new(log.clone()))
                .with_republish_retry(RetryConfig::any_error(Duration::ZERO)),
            log,
        }
    }

    fn event(code: &str, recipients: &[&str]) -> EventNotificationMessage {
        EventNotificationMessage {
            event_id: time_uuid().to_string(),
            trace_id: String::new(),
            code: code.to_string(),
            message: String::new(),
            facility: "axamm".into(),
            cluster: String::new(),
            channel: String::new(),
            severity: String::new(),
            timestamp: monotonic_micros(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            detail: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let f = fixture();
        f.center.seed_defaults().await.unwrap();
        let mut rule = f.center.get_rule(DEFAULT_RULE_ID).await.unwrap();
        rule.enabled = false;
        f.center.update_rule(rule).await.unwrap();

        f.center.seed_defaults().await.unwrap();
        assert!(!f.center.get_rule(DEFAULT_RULE_ID).await.unwrap().enabled);
        assert_eq!(f.center.list_codes().await.unwrap().len(), taxonomy().len());
    }

    #[tokio::test]
    async fn test_update_rule_mints_id_and_keeps_create_time() {
        let f = fixture();
        let created = f
            .center
            .update_rule(Rule {
                rule_id: String::new(),
                name: "ops".into(),
                ..Rule::default_rule()
            })
            .await
            .unwrap();
        assert!(!created.rule_id.is_empty());
        assert!(created.create_time > 0);

        let updated = f
            .center
            .update_rule(Rule {
                name: "ops-2".into(),
                create_time: 0,
                ..created.clone()
            })
            .await
            .unwrap();
        assert_eq!(updated.create_time, created.create_time);
        assert_eq!(f.center.list_rules().await.unwrap().len(), 1);

        f.center.delete_rule(&created.rule_id).await.unwrap();
        let err = f.center.get_rule(&created.rule_id).await.unwrap_err();
        assert!(err.is_code(codes::ERR_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_dispatch_resolves_and_routes() {
        let f = fixture();
        f.center.seed_defaults().await.unwrap();

        let topics = f
            .dispatcher
            .dispatch(event(code::JOB_STATUS_FAILED, &["dev@example.com", "ops@slack"]))
            .await
            .unwrap();
        assert_eq!(topics, vec![TOPIC_UI, TOPIC_EMAIL, TOPIC_SLACK]);

        let email: EventNotificationMessage =
            serde_json::from_str(&f.log.messages(TOPIC_EMAIL)[0].value).unwrap();
        assert_eq!(email.recipients, vec!["dev@example.com".to_string()]);
        assert_eq!(email.severity, "critical");

        let ui: EventNotificationMessage = serde_json::from_str(&f.log.messages(TOPIC_UI)[0].value).unwrap();
        assert!(ui.recipients.contains(&"admin@group".to_string()));
        assert!(!ui.recipients.contains(&"ops@slack".to_string()));

        let stored = f.center.list_events(Some(&email.trace_id), 0).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_per_code() {
        let f = fixture();
        let first = event(code::JOB_CI_REPO_NOT_FOUND, &["dev@example.com"]);
        let mut second = event(code::JOB_CI_REPO_NOT_FOUND, &["dev@example.com"]);
        second.timestamp = first.timestamp + 60_000_000;
        let mut later = event(code::JOB_CI_REPO_NOT_FOUND, &["dev@example.com"]);
        // the window runs from the latest event of the code, throttled or not
        later.timestamp = second.timestamp + RATE_LIMIT_WINDOW.as_micros() as i64;

        assert_eq!(f.dispatcher.dispatch(first).await.unwrap().len(), 2);
        assert!(f.dispatcher.dispatch(second).await.unwrap().is_empty());
        assert_eq!(f.dispatcher.dispatch(later).await.unwrap().len(), 2);

        // exempt codes are never throttled
        for _ in 0..2 {
            let topics = f.dispatcher.dispatch(event(code::JOB_STATUS_SUCCESS, &["dev@example.com"])).await.unwrap();
            assert_eq!(topics, vec![TOPIC_UI, TOPIC_EMAIL]);
        }
    }

    #[tokio::test]
    async fn test_detail_placeholders_are_substituted() {
        let f = fixture();
        let dispatcher = f.dispatcher.with_substitution("%%AXOPS_EXT_DNS%%", "ax.example.com");
        let mut e = event(code::JOB_STATUS_FAILED, &["dev@example.com"]);
        e.detail.insert("url".into(), "https://%%AXOPS_EXT_DNS%%/jobs/1".into());
        dispatcher.dispatch(e).await.unwrap();

        let ui: EventNotificationMessage = serde_json::from_str(&f.log.messages(TOPIC_UI)[0].value).unwrap();
        assert_eq!(ui.detail["url"], "https://ax.example.com/jobs/1");
    }

    #[tokio::test]
    async fn test_configuration_failures_skip_user_topics() {
        let f = fixture();
        let topics = f
            .dispatcher
            .dispatch(event(code::CONFIGURATION_INVALID_SMTP, &["dev@example.com"]))
            .await
            .unwrap();
        assert!(topics.is_empty());
    }

    #[tokio::test]
    async fn test_handler_drops_unknown_codes() {
        let f = fixture();
        let message = BusMessage {
            topic: TOPIC_AXNC.into(),
            partition: 0,
            offset: "0".into(),
            key: "k".into(),
            value: serde_json::to_string(&event("no.such.code", &[])).unwrap(),
        };
        f.dispatcher.handle(&message).await.unwrap();
        assert!(f.log.messages(TOPIC_UI).is_empty());
    }

    #[tokio::test]
    async fn test_channel_worker_delivers() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);

        #[async_trait]
        impl ChannelSink for Recorder {
            async fn deliver(&self, event: &EventNotificationMessage) -> AxResult<()> {
                self.0.lock().push(event.code.clone());
                Ok(())
            }
        }

        let log = Arc::new(InMemoryLog::new(1));
        let payload = serde_json::to_string(&event(code::JOB_STATUS_STARTED, &[])).unwrap();
        log.append(TOPIC_UI, "k", &payload).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let worker = ChannelWorker::new(
            log.clone(),
            ChannelWorkerConfig::new(TOPIC_UI).with_concurrency(2),
            recorder.clone(),
        );
        let task = tokio::spawn(worker.run(cancel.clone()));
        for _ in 0..200 {
            if !recorder.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*recorder.0.lock(), vec![code::JOB_STATUS_STARTED.to_string()]);
    }
}

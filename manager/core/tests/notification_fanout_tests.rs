// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Producer → `axnc` dispatcher → channel worker, over the in-memory log.

use async_trait::async_trait;
use axamm_core::application::notification_center::{
    ChannelSink, ChannelWorker, ChannelWorkerConfig, EventDispatcher, NotificationCenterService,
    StandardNotificationCenter, DISPATCHER_GROUP,
};
use axamm_core::domain::error::{codes, AxError, AxResult};
use axamm_core::domain::notification::{code, EventNotificationMessage, TOPIC_AXNC, TOPIC_EMAIL, TOPIC_SUPPORT};
use axamm_core::infrastructure::axdb::memory::InMemoryDatabase;
use axamm_core::infrastructure::axdb::schema::notification_tables;
use axamm_core::infrastructure::bus::{BusProducer, Consumer, ConsumerConfig, InMemoryLog};
use axamm_core::infrastructure::notification_producer::{EventNotificationProducer, EventNotifier};
use axamm_core::infrastructure::repositories::{AxdbCodeRepository, AxdbEventRepository, AxdbRuleRepository};
use axamm_core::infrastructure::retry::RetryConfig;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Email transport that drops the connection on its first delivery.
#[derive(Default)]
struct FlakyEmail {
    attempts: Mutex<u32>,
    delivered: Mutex<Vec<EventNotificationMessage>>,
}

#[async_trait]
impl ChannelSink for FlakyEmail {
    async fn deliver(&self, event: &EventNotificationMessage) -> AxResult<()> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            *attempts
        };
        if attempt == 1 {
            return Err(AxError::new(codes::ERR_AX_HTTP_CONNECTION, "smtp relay unreachable"));
        }
        self.delivered.lock().push(event.clone());
        Ok(())
    }
}

async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_failed_job_reaches_email_after_transient_error() {
    let db = Arc::new(InMemoryDatabase::with_tables(notification_tables()));
    let rules = Arc::new(AxdbRuleRepository::new(db.clone()));
    let events = Arc::new(AxdbEventRepository::new(db.clone()));
    let log = Arc::new(InMemoryLog::new(2));

    let center = StandardNotificationCenter::new(rules.clone(), events.clone(), Arc::new(AxdbCodeRepository::new(db)));
    center.seed_defaults().await.unwrap();

    let producer = EventNotificationProducer::new("axworkflowadc", log.clone(), Duration::from_secs(1));
    let sent = producer
        .send_message(
            code::JOB_STATUS_FAILED,
            None,
            vec!["dev@example.com".to_string()],
            BTreeMap::from([("job_id".to_string(), "j-1".to_string())]),
        )
        .await
        .unwrap();
    assert_eq!(sent.trace_id, sent.event_id);
    assert_eq!(log.messages(TOPIC_AXNC).len(), 1);

    let cancel = CancellationToken::new();
    let dispatcher = Arc::new(
        EventDispatcher::new(rules, events, BusProducer::new(log.clone()))
            .with_republish_retry(RetryConfig::any_error(Duration::ZERO)),
    );
    let dispatch = tokio::spawn(
        Consumer::new(log.clone(), ConsumerConfig::new(TOPIC_AXNC, DISPATCHER_GROUP, "dispatcher-0"))
            .run(dispatcher, cancel.clone()),
    );

    let email = Arc::new(FlakyEmail::default());
    let retry = RetryConfig::new(
        Duration::from_secs(60),
        Duration::from_secs(1),
        Duration::from_secs(60),
        2.0,
        [codes::ERR_AX_HTTP_CONNECTION],
    );
    let worker = ChannelWorker::new(
        log.clone(),
        ChannelWorkerConfig::new(TOPIC_EMAIL).with_retry(retry),
        email.clone(),
    );
    let deliver = tokio::spawn(worker.run(cancel.clone()));

    eventually(|| !email.delivered.lock().is_empty()).await;
    cancel.cancel();
    dispatch.await.unwrap();
    deliver.await.unwrap();

    assert_eq!(*email.attempts.lock(), 2);
    let delivered = email.delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event_id, sent.event_id);
    assert_eq!(delivered[0].severity, "critical");
    assert_eq!(delivered[0].channel, "job");
    assert_eq!(delivered[0].recipients, vec!["dev@example.com".to_string()]);

    // Republished once on email, nothing on support for a user-facing code.
    assert_eq!(log.messages(TOPIC_EMAIL).len(), 1);
    assert!(log.messages(TOPIC_SUPPORT).is_empty());
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Login session lifecycle.

use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::ids::now_secs;
use crate::domain::repository::SessionRepository;
use crate::domain::session::Session;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create(&self, user_id: &str, username: &str, scheme: &str) -> AxResult<Session>;

    /// Return the live session `id`, extending it when it is close to expiry.
    async fn validate(&self, id: &str) -> AxResult<Session>;

    async fn delete(&self, id: &str) -> AxResult<()>;
}

pub struct StandardSessionService {
    repository: Arc<dyn SessionRepository>,
    sliding: bool,
}

impl StandardSessionService {
    pub fn new(repository: Arc<dyn SessionRepository>) -> Self {
        Self {
            repository,
            sliding: true,
        }
    }

    /// Disable the sliding extension; sessions then end exactly at expiry.
    pub fn fixed_expiry(mut self) -> Self {
        self.sliding = false;
        self
    }

    async fn validate_at(&self, id: &str, now: i64) -> AxResult<Session> {
        let mut session = self
            .repository
            .find(id)
            .await?
            .ok_or_else(|| AxError::unauthorized("Session is not found"))?;
        if session.is_expired(now) {
            return Err(AxError::new(codes::ERR_API_EXPIRED_SESSION, "Session has expired"));
        }
        if self.sliding && session.needs_extension(now) {
            session.extend(now);
            self.repository.save(&session).await?;
            debug!("Extended session of {} to {}", session.username, session.expiry);
        }
        Ok(session)
    }
}

#[async_trait]
impl SessionService for StandardSessionService {
    async fn create(&self, user_id: &str, username: &str, scheme: &str) -> AxResult<Session> {
        let session = Session::new(user_id, username, scheme, now_secs());
        self.repository.save(&session).await?;
        info!("Created session for {}", username);
        Ok(session)
    }

    async fn validate(&self, id: &str) -> AxResult<Session> {
        self.validate_at(id, now_secs()).await
    }

    async fn delete(&self, id: &str) -> AxResult<()> {
        self.repository.delete(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SESSION_RETENTION;
    use crate::infrastructure::axdb::memory::InMemoryDatabase;
    use crate::infrastructure::axdb::schema::manager_tables;
    use crate::infrastructure::repositories::AxdbSessionRepository;

    fn repository() -> Arc<AxdbSessionRepository> {
        let db = Arc::new(InMemoryDatabase::with_tables(manager_tables()));
        Arc::new(AxdbSessionRepository::new(db))
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let svc = StandardSessionService::new(repository());
        let session = svc.create("u1", "alice", "native").await.unwrap();
        assert_eq!(svc.validate(&session.id).await.unwrap().id, session.id);

        let err = svc.validate_at(&session.id, session.expiry).await.unwrap_err();
        assert!(err.is_code(codes::ERR_API_EXPIRED_SESSION));
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn test_sliding_extension_in_final_day() {
        let repo = repository();
        let svc = StandardSessionService::new(repo.clone());
        let session = svc.create("u1", "alice", "native").await.unwrap();
        let late = session.expiry - 60;

        let extended = svc.validate_at(&session.id, late).await.unwrap();
        assert_eq!(extended.expiry, late + SESSION_RETENTION.as_secs() as i64);
        assert_eq!(repo.find(&session.id).await.unwrap().unwrap().expiry, extended.expiry);

        let fixed = StandardSessionService::new(repo).fixed_expiry();
        let other = fixed.create("u2", "bob", "native").await.unwrap();
        let kept = fixed.validate_at(&other.id, other.expiry - 60).await.unwrap();
        assert_eq!(kept.expiry, other.expiry);
    }

    #[tokio::test]
    async fn test_deleted_session_is_unknown() {
        let svc = StandardSessionService::new(repository());
        let session = svc.create("u1", "alice", "native").await.unwrap();
        svc.delete(&session.id).await.unwrap();
        assert!(svc.validate(&session.id).await.unwrap_err().is_code(codes::ERR_UNAUTHORIZED));
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Label catalogue used to tag users, services, policies and deployments.

use crate::domain::error::{codes, AxError, AxResult};
use crate::domain::label::Label;
use crate::domain::repository::LabelRepository;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait LabelService: Send + Sync {
    /// Store a new label. Fails with `ERR_API_DUP_LABEL` when the
    /// `(type, key, value)` triple exists.
    async fn create(&self, label: Label) -> AxResult<Label>;

    async fn list(&self, label_type: Option<&str>) -> AxResult<Vec<Label>>;

    async fn delete(&self, label_type: &str, key: &str, value: &str) -> AxResult<()>;
}

pub struct StandardLabelService {
    repository: Arc<dyn LabelRepository>,
}

impl StandardLabelService {
    pub fn new(repository: Arc<dyn LabelRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl LabelService for StandardLabelService {
    async fn create(&self, label: Label) -> AxResult<Label> {
        label.validate()?;
        if self
            .repository
            .find(&label.label_type, &label.key, &label.value)
            .await?
            .is_some()
        {
            return Err(AxError::new(
                codes::ERR_API_DUP_LABEL,
                format!("Label {}:{}={} already exists", label.label_type, label.key, label.value),
            ));
        }
        self.repository.save(&label).await?;
        info!("Created label {}:{}={}", label.label_type, label.key, label.value);
        Ok(label)
    }

    async fn list(&self, label_type: Option<&str>) -> AxResult<Vec<Label>> {
        Ok(self.repository.list(label_type).await?)
    }

    async fn delete(&self, label_type: &str, key: &str, value: &str) -> AxResult<()> {
        let Some(label) = self.repository.find(label_type, key, value).await? else {
            return Err(AxError::not_found(format!("Label {}:{}={} is not found", label_type, key, value)));
        };
        if label.reserved {
            return Err(AxError::new(
                codes::ERR_FORBIDDEN,
                format!("Label {}:{} is reserved", label.label_type, label.key),
            ));
        }
        self.repository.delete(&label).await?;
        info!("Deleted label {}:{}={}", label_type, key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::axdb::memory::InMemoryDatabase;
    use crate::infrastructure::axdb::schema::manager_tables;
    use crate::infrastructure::repositories::AxdbLabelRepository;

    fn service() -> StandardLabelService {
        let db = Arc::new(InMemoryDatabase::with_tables(manager_tables()));
        StandardLabelService::new(Arc::new(AxdbLabelRepository::new(db)))
    }

    #[tokio::test]
    async fn test_duplicate_label_is_rejected() {
        let svc = service();
        svc.create(Label::new("deployment", "tier", "web")).await.unwrap();
        svc.create(Label::new("deployment", "tier", "db")).await.unwrap();

        let err = svc.create(Label::new("deployment", "tier", "web")).await.unwrap_err();
        assert!(err.is_code(codes::ERR_API_DUP_LABEL));
        assert_eq!(err.http_status(), 409);
        assert_eq!(svc.list(Some("deployment")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reserved_label_cannot_be_deleted() {
        let svc = service();
        let mut reserved = Label::new("user", "role", "admin");
        reserved.reserved = true;
        svc.create(reserved).await.unwrap();

        let err = svc.delete("user", "role", "admin").await.unwrap_err();
        assert!(err.is_code(codes::ERR_FORBIDDEN));

        svc.create(Label::new("user", "team", "infra")).await.unwrap();
        svc.delete("user", "team", "infra").await.unwrap();
        assert!(svc.delete("user", "team", "infra").await.unwrap_err().is_code(codes::ERR_NOT_FOUND));
    }
}

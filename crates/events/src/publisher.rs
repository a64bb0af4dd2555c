//! Producer-side entry point: create notifications and kick off delivery.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::error::CoreError;
use beacon_core::notification::{Notification, NotificationDraft};
use beacon_core::store::{RecordStore, StoreError};
use beacon_core::types::DbId;
use tokio::task::JoinHandle;

use crate::orchestrator::{DeliveryOrchestrator, DeliveryReport};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Company {0} has no members")]
    NoRecipients(DbId),
}

/// Rows created by [`Publisher::publish`] and their in-flight dispatches.
pub struct PublishReceipt {
    pub notifications: Vec<Notification>,
    dispatches: Vec<JoinHandle<Option<DeliveryReport>>>,
}

impl PublishReceipt {
    /// Wait for every dispatch to settle. Dispatches that failed outright
    /// are logged and omitted.
    pub async fn wait(self) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(self.dispatches.len());
        for handle in self.dispatches {
            match handle.await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Dispatch task panicked"),
            }
        }
        reports
    }
}

pub struct Publisher {
    store: Arc<dyn RecordStore>,
    orchestrator: Arc<DeliveryOrchestrator>,
}

impl Publisher {
    pub fn new(store: Arc<dyn RecordStore>, orchestrator: Arc<DeliveryOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Validate `draft` and insert one row per recipient, each with its
    /// pending delivery rows. Company-wide drafts fan out to every member.
    #[tracing::instrument(skip_all, fields(company_wide = draft.company_wide))]
    pub async fn create(&self, draft: &NotificationDraft) -> Result<Vec<Notification>, PublishError> {
        draft.check()?;
        let recipients = self.recipients(draft).await?;

        let mut created = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            let (notification, _) = self.store.insert_notification(user_id, draft).await?;
            created.push(notification);
        }
        tracing::info!(count = created.len(), "Notifications created");
        Ok(created)
    }

    /// [`create`](Self::create), then dispatch every row independently.
    pub async fn publish(&self, draft: &NotificationDraft) -> Result<PublishReceipt, PublishError> {
        let notifications = self.create(draft).await?;
        let dispatches = notifications
            .iter()
            .cloned()
            .map(|notification| {
                let orchestrator = Arc::clone(&self.orchestrator);
                tokio::spawn(async move {
                    match orchestrator.dispatch(&notification).await {
                        Ok(report) => Some(report),
                        Err(e) => {
                            tracing::error!(
                                notification_id = notification.id,
                                error = %e,
                                "Dispatch failed",
                            );
                            None
                        }
                    }
                })
            })
            .collect();
        Ok(PublishReceipt {
            notifications,
            dispatches,
        })
    }

    /// Render the stored template `key` into a draft for `user_id`.
    pub async fn render_template(
        &self,
        key: &str,
        user_id: DbId,
        vars: &HashMap<String, String>,
    ) -> Result<NotificationDraft, PublishError> {
        let template = self
            .store
            .template(key)
            .await?
            .ok_or_else(|| PublishError::TemplateNotFound(key.to_string()))?;
        Ok(template.render(user_id, vars)?)
    }

    pub async fn create_from_template(
        &self,
        key: &str,
        user_id: DbId,
        vars: &HashMap<String, String>,
    ) -> Result<Vec<Notification>, PublishError> {
        let draft = self.render_template(key, user_id, vars).await?;
        self.create(&draft).await
    }

    // ---- private helpers ----

    async fn recipients(&self, draft: &NotificationDraft) -> Result<Vec<DbId>, PublishError> {
        match (draft.company_wide, draft.company_id, draft.user_id) {
            (true, Some(company_id), _) => {
                let members = self.store.company_members(company_id).await?;
                if members.is_empty() {
                    return Err(PublishError::NoRecipients(company_id));
                }
                Ok(members)
            }
            (false, _, Some(user_id)) => Ok(vec![user_id]),
            _ => Err(CoreError::Validation("draft has no recipient".into()).into()),
        }
    }
}

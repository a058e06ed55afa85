//! In-process store used by the workflow tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{MarketStore, Page, ServiceCatalog, ServiceListing};
use crate::domain::budgets::{AttachmentContent, Budget, BudgetAttachment, BudgetFilter};
use crate::domain::milestones::Milestone;
use crate::error::{ApiError, ApiResult};

#[derive(Default)]
struct Inner {
    budgets: HashMap<Uuid, Budget>,
    attachments: HashMap<Uuid, AttachmentContent>,
    milestones: HashMap<Uuid, Milestone>,
    services: HashMap<Uuid, ServiceListing>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, listing: ServiceListing) {
        self.inner.write().services.insert(listing.service_id, listing);
    }

    pub fn milestone_count(&self) -> usize {
        self.inner.read().milestones.len()
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn insert_budget(&self, budget: &Budget) -> ApiResult<()> {
        let mut inner = self.inner.write();
        if inner.budgets.contains_key(&budget.id) {
            return Err(ApiError::internal(format!("duplicate budget id {}", budget.id)));
        }
        inner.budgets.insert(budget.id, budget.clone());
        Ok(())
    }

    async fn fetch_budget(&self, id: Uuid) -> ApiResult<Option<Budget>> {
        Ok(self.inner.read().budgets.get(&id).cloned())
    }

    async fn list_budgets(&self, filter: &BudgetFilter, page: Page) -> ApiResult<(Vec<Budget>, u64)> {
        let inner = self.inner.read();
        let mut matching: Vec<Budget> = inner
            .budgets
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok((data, total))
    }

    async fn update_budget(&self, budget: &Budget) -> ApiResult<bool> {
        let mut inner = self.inner.write();
        match inner.budgets.get_mut(&budget.id) {
            Some(stored) if stored.version == budget.version => {
                *stored = budget.clone();
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_budget(&self, budget: &Budget) -> ApiResult<bool> {
        let mut inner = self.inner.write();
        let current = inner.budgets.get(&budget.id).map(|b| b.version);
        if current != Some(budget.version) {
            return Ok(false);
        }
        inner.budgets.remove(&budget.id);
        inner
            .attachments
            .retain(|_, a| a.attachment.budget_id != budget.id);
        Ok(true)
    }

    async fn commit_approval(&self, budget: &Budget, milestones: &[Milestone]) -> ApiResult<bool> {
        let mut inner = self.inner.write();
        match inner.budgets.get(&budget.id) {
            Some(stored) if stored.version == budget.version => {}
            _ => return Ok(false),
        }

        let mut approved = budget.clone();
        approved.version += 1;
        inner.budgets.insert(budget.id, approved);
        for m in milestones {
            inner.milestones.insert(m.id, m.clone());
        }
        Ok(true)
    }

    async fn insert_attachment(&self, attachment: &AttachmentContent) -> ApiResult<()> {
        self.inner
            .write()
            .attachments
            .insert(attachment.attachment.id, attachment.clone());
        Ok(())
    }

    async fn list_attachments(&self, budget_id: Uuid) -> ApiResult<Vec<BudgetAttachment>> {
        let inner = self.inner.read();
        let mut list: Vec<BudgetAttachment> = inner
            .attachments
            .values()
            .filter(|a| a.attachment.budget_id == budget_id)
            .map(|a| a.attachment.clone())
            .collect();
        list.sort_by_key(|a| a.uploaded_at);
        Ok(list)
    }

    async fn fetch_attachment(&self, id: Uuid) -> ApiResult<Option<AttachmentContent>> {
        Ok(self.inner.read().attachments.get(&id).cloned())
    }

    async fn delete_attachment(&self, id: Uuid) -> ApiResult<bool> {
        Ok(self.inner.write().attachments.remove(&id).is_some())
    }

    async fn fetch_milestone(&self, id: Uuid) -> ApiResult<Option<Milestone>> {
        Ok(self.inner.read().milestones.get(&id).cloned())
    }

    async fn list_milestones_by_budget(&self, budget_id: Uuid) -> ApiResult<Vec<Milestone>> {
        let inner = self.inner.read();
        let mut list: Vec<Milestone> = inner
            .milestones
            .values()
            .filter(|m| m.budget_id == budget_id)
            .cloned()
            .collect();
        list.sort_by_key(|m| m.sequence_number);
        Ok(list)
    }

    async fn list_milestones_by_client(&self, client_id: Uuid) -> ApiResult<Vec<Milestone>> {
        let inner = self.inner.read();
        let mut list: Vec<Milestone> = inner
            .milestones
            .values()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect();
        list.sort_by_key(|m| {
            let budget_created = inner.budgets.get(&m.budget_id).map(|b| b.created_at);
            (budget_created, m.budget_id, m.sequence_number)
        });
        Ok(list)
    }

    async fn update_milestone(&self, milestone: &Milestone) -> ApiResult<bool> {
        let mut inner = self.inner.write();
        match inner.milestones.get_mut(&milestone.id) {
            Some(stored) if stored.version == milestone.version => {
                *stored = milestone.clone();
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ServiceCatalog for MemoryStore {
    async fn service(&self, service_id: Uuid) -> ApiResult<Option<ServiceListing>> {
        Ok(self.inner.read().services.get(&service_id).cloned())
    }
}

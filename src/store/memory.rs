//! In-memory store backed by `DashMap`.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{NewPlan, Plan, Store, StoreError, User};

/// Process-local store. Data is lost on restart.
#[derive(Default)]
pub struct InMemoryStore {
    /// Users by external id
    users: DashMap<String, User>,
    /// Plans by owner, oldest first
    plans: DashMap<Uuid, Vec<Plan>>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn find_or_create_user(
        &self,
        external_id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<User, StoreError> {
        let mut user = self
            .users
            .entry(external_id.to_string())
            .or_insert_with(|| User {
                id: Uuid::new_v4(),
                external_id: external_id.to_string(),
                email: None,
                name: None,
                created_at: Utc::now(),
            });
        if user.email.is_none() {
            user.email = email.map(str::to_string);
        }
        if user.name.is_none() {
            user.name = name.map(str::to_string);
        }
        Ok(user.clone())
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(external_id).map(|u| u.clone()))
    }

    async fn insert_plan(&self, plan: NewPlan) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.plans.entry(plan.user_id).or_default().push(Plan {
            id,
            user_id: plan.user_id,
            title: plan.title,
            goal: plan.goal,
            tasks: plan.tasks,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn list_plans(&self, user_id: Uuid, limit: usize) -> Result<Vec<Plan>, StoreError> {
        Ok(self
            .plans
            .get(&user_id)
            .map(|plans| plans.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

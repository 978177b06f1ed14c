//! Lookups the ledger consumes but does not own.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::ledger::ValidationError;
use crate::model::{Brand, BrandId, User, UserId};

/// Source of brand configuration and user status.
pub trait Directory: Send + Sync {
    fn brand(&self, id: BrandId) -> Option<Brand>;
    fn user(&self, id: UserId) -> Option<User>;
}

/// Directory held in memory, filled by the replay tool and by tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    brands: RwLock<HashMap<BrandId, Brand>>,
    users: RwLock<HashMap<UserId, User>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a brand; misconfigured brands are refused.
    pub fn upsert_brand(&self, brand: Brand) -> Result<(), ValidationError> {
        brand.validate()?;
        self.brands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(brand.id, brand);
        Ok(())
    }

    pub fn upsert_user(&self, user: User) {
        self.users
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.id, user);
    }
}

impl Directory for InMemoryDirectory {
    fn brand(&self, id: BrandId) -> Option<Brand> {
        self.brands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn user(&self, id: UserId) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::amount::Percentage;
    use crate::model::UserStatus;

    #[test]
    fn upsert_and_lookup() {
        let dir = InMemoryDirectory::new();
        dir.upsert_user(User {
            id: 1,
            status: UserStatus::Active,
        });
        assert!(dir.user(1).unwrap().is_active());
        assert!(dir.user(2).is_none());
    }

    #[test]
    fn misconfigured_brand_is_refused() {
        let dir = InMemoryDirectory::new();
        let brand = Brand {
            id: 3,
            name: "Broken".to_string(),
            earning_percentage: Percentage::ZERO,
            redemption_percentage: Percentage::ZERO,
            min_redemption_amount: Some(Amount::whole(500)),
            brandwise_max_cap: Some(Amount::whole(100)),
            overall_max_cap: None,
            active: true,
        };
        assert!(dir.upsert_brand(brand).is_err());
        assert!(dir.brand(3).is_none());
    }
}

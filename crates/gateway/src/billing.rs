//! Billing sync: turns subscription lifecycle events into plan directory rows.
//!
//! Webhook signature checks and payload parsing happen upstream; this module
//! receives the three fields it needs and writes the resulting `(plan, active)`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::directory::{DirectoryError, SqlitePlanDirectory};
use crate::quota::FREE;

/// Subscription status that keeps keys active.
pub const ACTIVE_STATUS: &str = "active";

/// Billing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillingConfig {
    /// Stripe price id -> internal plan tier.
    #[serde(default)]
    pub prices: HashMap<String, String>,
}

/// The fields of a `customer.subscription.updated` event the directory needs.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub customer_id: String,
    pub price_id: String,
    pub status: String,
}

/// Resulting directory change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChange {
    pub plan: String,
    pub active: bool,
}

impl BillingConfig {
    /// Map an update to a plan change. Unknown prices fall back to the free plan.
    pub fn plan_change(&self, update: &SubscriptionUpdate) -> PlanChange {
        let plan = match self.prices.get(&update.price_id) {
            Some(plan) => plan.clone(),
            None => {
                log::warn!(
                    "Unmapped price {} for customer {}, using {}",
                    update.price_id,
                    update.customer_id,
                    FREE
                );
                FREE.to_string()
            }
        };
        PlanChange {
            plan,
            active: update.status == ACTIVE_STATUS,
        }
    }
}

/// Apply a subscription update to every key of the customer.
pub fn apply_subscription(
    directory: &SqlitePlanDirectory,
    billing: &BillingConfig,
    update: &SubscriptionUpdate,
) -> Result<PlanChange, DirectoryError> {
    let change = billing.plan_change(update);
    directory.set_plan_for_customer(&update.customer_id, &change.plan, change.active)?;
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{PRO_ANNUAL, PRO_MONTHLY};

    fn billing() -> BillingConfig {
        serde_yaml::from_str(
            r#"
prices:
  price_monthly: pro_monthly
  price_annual: pro_annual
"#,
        )
        .unwrap()
    }

    fn update(price: &str, status: &str) -> SubscriptionUpdate {
        SubscriptionUpdate {
            customer_id: "cus_1".to_string(),
            price_id: price.to_string(),
            status: status.to_string(),
        }
    }

    #[test]
    fn maps_known_prices() {
        let billing = billing();
        assert_eq!(
            billing.plan_change(&update("price_annual", "active")),
            PlanChange {
                plan: PRO_ANNUAL.to_string(),
                active: true
            }
        );
        assert_eq!(
            billing.plan_change(&update("price_monthly", "past_due")),
            PlanChange {
                plan: PRO_MONTHLY.to_string(),
                active: false
            }
        );
    }

    #[test]
    fn unknown_price_falls_back_to_free() {
        let change = billing().plan_change(&update("price_other", "active"));
        assert_eq!(change.plan, FREE);
        assert!(change.active);
    }

    #[test]
    fn apply_updates_directory() {
        let dir = SqlitePlanDirectory::open_in_memory().unwrap();
        let issued = dir.issue_key("a@example.com", "cus_1").unwrap();

        let change = apply_subscription(&dir, &billing(), &update("price_monthly", "canceled"))
            .unwrap();
        assert_eq!(change.plan, PRO_MONTHLY);

        let record = dir.lookup_blocking(&issued.key).unwrap().unwrap();
        assert_eq!(record.plan, PRO_MONTHLY);
        assert!(!record.active);
    }

    #[test]
    fn apply_for_unknown_customer_errors() {
        let dir = SqlitePlanDirectory::open_in_memory().unwrap();
        let result = apply_subscription(&dir, &billing(), &update("price_monthly", "active"));
        assert!(matches!(result, Err(DirectoryError::UserNotFound(_))));
    }
}

//! Static plan/pack configuration, loaded once at startup.
//!
//! Maps plan tiers to their monthly allotment and rollover cap, and maps
//! provider price (Stripe) / variant (LemonSqueezy) identifiers back to a plan or pack.

use crate::config::CatalogSettings;
use crate::models::account::BillingProvider;
use crate::models::plan::{BillingInterval, PlanTier};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderPriceIds {
    pub monthly: Option<String>,
    pub annual: Option<String>,
}

impl ProviderPriceIds {
    pub fn new(monthly: Option<String>, annual: Option<String>) -> Self {
        Self {
            monthly: non_empty(monthly),
            annual: non_empty(annual),
        }
    }

    fn interval_of(&self, price_id: &str) -> Option<BillingInterval> {
        if self.monthly.as_deref() == Some(price_id) {
            Some(BillingInterval::Monthly)
        } else if self.annual.as_deref() == Some(price_id) {
            Some(BillingInterval::Annual)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalogEntry {
    pub plan: PlanTier,
    pub monthly_credits: i64,
    /// `None` means no rollover: the balance is capped at one month's allotment.
    pub max_rollover: Option<i64>,
    pub stripe: ProviderPriceIds,
    pub lemonsqueezy: ProviderPriceIds,
}

impl PlanCatalogEntry {
    pub fn rollover_cap(&self) -> i64 {
        self.max_rollover.unwrap_or(self.monthly_credits)
    }

    fn prices_for(&self, provider: BillingProvider) -> Option<&ProviderPriceIds> {
        match provider {
            BillingProvider::Stripe => Some(&self.stripe),
            BillingProvider::LemonSqueezy => Some(&self.lemonsqueezy),
            BillingProvider::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditPack {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub price_minor_units: i64,
    pub currency: String,
    pub stripe_price_id: Option<String>,
    pub lemonsqueezy_variant_id: Option<String>,
}

impl CreditPack {
    fn matches(&self, provider: BillingProvider, price_id: &str) -> bool {
        let id = match provider {
            BillingProvider::Stripe => self.stripe_price_id.as_deref(),
            BillingProvider::LemonSqueezy => self.lemonsqueezy_variant_id.as_deref(),
            BillingProvider::None => None,
        };
        id == Some(price_id)
    }
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    entries: Vec<PlanCatalogEntry>,
    packs: Vec<CreditPack>,
}

impl PlanCatalog {
    pub fn new(entries: Vec<PlanCatalogEntry>, packs: Vec<CreditPack>) -> Self {
        Self { entries, packs }
    }

    pub fn from_settings(settings: &CatalogSettings) -> Self {
        let entries = vec![
            PlanCatalogEntry {
                plan: PlanTier::Free,
                monthly_credits: settings.free_monthly_credits,
                max_rollover: None,
                stripe: ProviderPriceIds::default(),
                lemonsqueezy: ProviderPriceIds::default(),
            },
            PlanCatalogEntry {
                plan: PlanTier::Pro,
                monthly_credits: settings.pro_monthly_credits,
                max_rollover: Some(settings.pro_max_rollover),
                stripe: settings.pro_stripe.clone(),
                lemonsqueezy: settings.pro_lemonsqueezy.clone(),
            },
            PlanCatalogEntry {
                plan: PlanTier::Business,
                monthly_credits: settings.business_monthly_credits,
                max_rollover: Some(settings.business_max_rollover),
                stripe: settings.business_stripe.clone(),
                lemonsqueezy: settings.business_lemonsqueezy.clone(),
            },
        ];
        let packs = vec![CreditPack {
            id: "basic".to_string(),
            name: settings.pack_name.clone(),
            credits: settings.pack_credits,
            price_minor_units: settings.pack_price_minor_units,
            currency: "usd".to_string(),
            stripe_price_id: non_empty(settings.pack_stripe_price_id.clone()),
            lemonsqueezy_variant_id: non_empty(settings.pack_lemonsqueezy_variant_id.clone()),
        }];
        Self::new(entries, packs)
    }

    pub fn entry(&self, plan: PlanTier) -> Option<&PlanCatalogEntry> {
        self.entries.iter().find(|e| e.plan == plan)
    }

    pub fn resolve_plan(
        &self,
        provider: BillingProvider,
        price_id: &str,
    ) -> Option<(PlanTier, BillingInterval)> {
        if price_id.is_empty() {
            return None;
        }
        self.entries.iter().find_map(|entry| {
            entry
                .prices_for(provider)
                .and_then(|prices| prices.interval_of(price_id))
                .map(|interval| (entry.plan, interval))
        })
    }

    pub fn resolve_pack(&self, provider: BillingProvider, price_id: &str) -> Option<&CreditPack> {
        if price_id.is_empty() {
            return None;
        }
        self.packs.iter().find(|p| p.matches(provider, price_id))
    }

    pub fn pack_by_id(&self, pack_id: &str) -> Option<&CreditPack> {
        self.packs.iter().find(|p| p.id == pack_id)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        let settings = CatalogSettings {
            pro_stripe: ProviderPriceIds::new(
                Some("price_pro_m".into()),
                Some("price_pro_y".into()),
            ),
            business_lemonsqueezy: ProviderPriceIds::new(Some("4410".into()), None),
            pack_stripe_price_id: Some("price_pack".into()),
            ..CatalogSettings::default()
        };
        PlanCatalog::from_settings(&settings)
    }

    #[test]
    fn resolves_plan_and_interval_per_provider() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_plan(BillingProvider::Stripe, "price_pro_y"),
            Some((PlanTier::Pro, BillingInterval::Annual))
        );
        assert_eq!(
            catalog.resolve_plan(BillingProvider::LemonSqueezy, "4410"),
            Some((PlanTier::Business, BillingInterval::Monthly))
        );
        // a Stripe price id means nothing to LemonSqueezy
        assert_eq!(
            catalog.resolve_plan(BillingProvider::LemonSqueezy, "price_pro_m"),
            None
        );
    }

    #[test]
    fn unset_ids_never_match_empty_input() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_plan(BillingProvider::Stripe, ""), None);
        assert!(catalog.resolve_pack(BillingProvider::LemonSqueezy, "").is_none());
    }

    #[test]
    fn default_allotments_and_caps() {
        let catalog = catalog();
        let pro = catalog.entry(PlanTier::Pro).unwrap();
        assert_eq!((pro.monthly_credits, pro.rollover_cap()), (200, 400));
        let business = catalog.entry(PlanTier::Business).unwrap();
        assert_eq!((business.monthly_credits, business.rollover_cap()), (600, 1200));
        let free = catalog.entry(PlanTier::Free).unwrap();
        assert_eq!(free.rollover_cap(), free.monthly_credits);
        let pack = catalog.resolve_pack(BillingProvider::Stripe, "price_pack").unwrap();
        assert_eq!(pack.credits, 30);
        assert_eq!(catalog.pack_by_id("basic").map(|p| p.credits), Some(30));
    }
}

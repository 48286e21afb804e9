use std::env;
use std::net::SocketAddr;

use anyhow::Context;

use crate::catalog::ProviderPriceIds;

pub const DEFAULT_STRIPE_WEBHOOK_TOLERANCE_SECONDS: i64 = 300;

#[derive(Clone, Debug)]
pub struct StripeSettings {
    /// Only needed for payment-instrument lookups; webhooks verify with `webhook_secret` alone.
    pub secret_key: Option<String>,
    pub webhook_secret: String,
    pub webhook_tolerance_seconds: i64,
}

#[derive(Clone, Debug)]
pub struct LemonSqueezySettings {
    pub webhook_secret: String,
}

/// Allotments and provider ids for the plan catalog. Defaults match the published pricing page.
#[derive(Clone, Debug)]
pub struct CatalogSettings {
    pub free_monthly_credits: i64,
    pub pro_monthly_credits: i64,
    pub pro_max_rollover: i64,
    pub business_monthly_credits: i64,
    pub business_max_rollover: i64,
    pub pro_stripe: ProviderPriceIds,
    pub pro_lemonsqueezy: ProviderPriceIds,
    pub business_stripe: ProviderPriceIds,
    pub business_lemonsqueezy: ProviderPriceIds,
    pub pack_name: String,
    pub pack_credits: i64,
    pub pack_price_minor_units: i64,
    pub pack_stripe_price_id: Option<String>,
    pub pack_lemonsqueezy_variant_id: Option<String>,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            free_monthly_credits: 20,
            pro_monthly_credits: 200,
            pro_max_rollover: 400,
            business_monthly_credits: 600,
            business_max_rollover: 1200,
            pro_stripe: ProviderPriceIds::default(),
            pro_lemonsqueezy: ProviderPriceIds::default(),
            business_stripe: ProviderPriceIds::default(),
            business_lemonsqueezy: ProviderPriceIds::default(),
            pack_name: "Credit Pack".to_string(),
            pack_credits: 30,
            pack_price_minor_units: 500,
            pack_stripe_price_id: None,
            pack_lemonsqueezy_variant_id: None,
        }
    }
}

impl CatalogSettings {
    fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            free_monthly_credits: env_i64("FREE_CREDITS_MONTHLY", defaults.free_monthly_credits)?,
            pro_monthly_credits: env_i64("PRO_CREDITS_MONTHLY", defaults.pro_monthly_credits)?,
            pro_max_rollover: env_i64("PRO_CREDITS_MAX_ROLLOVER", defaults.pro_max_rollover)?,
            business_monthly_credits: env_i64(
                "BUSINESS_CREDITS_MONTHLY",
                defaults.business_monthly_credits,
            )?,
            business_max_rollover: env_i64(
                "BUSINESS_CREDITS_MAX_ROLLOVER",
                defaults.business_max_rollover,
            )?,
            pro_stripe: price_ids("STRIPE_PRICE_ID_PRO"),
            pro_lemonsqueezy: price_ids("LS_VARIANT_ID_PRO"),
            business_stripe: price_ids("STRIPE_PRICE_ID_BUSINESS"),
            business_lemonsqueezy: price_ids("LS_VARIANT_ID_BUSINESS"),
            pack_name: env::var("PACK_NAME").unwrap_or(defaults.pack_name),
            pack_credits: env_i64("PACK_CREDITS", defaults.pack_credits)?,
            pack_price_minor_units: env_i64(
                "PACK_PRICE_MINOR_UNITS",
                defaults.pack_price_minor_units,
            )?,
            pack_stripe_price_id: env::var("STRIPE_PRICE_ID_PACK").ok(),
            pack_lemonsqueezy_variant_id: env::var("LS_VARIANT_ID_PACK").ok(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub stripe: StripeSettings,
    pub lemonsqueezy: LemonSqueezySettings,
    pub catalog: CatalogSettings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse::<SocketAddr>()
            .context("BIND_ADDR must be a socket address")?;

        let stripe = StripeSettings {
            secret_key: env::var("STRIPE_SECRET_KEY").ok().filter(|v| !v.is_empty()),
            webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .context("STRIPE_WEBHOOK_SECRET must be set")?,
            webhook_tolerance_seconds: env_i64(
                "STRIPE_WEBHOOK_TOLERANCE_SECONDS",
                DEFAULT_STRIPE_WEBHOOK_TOLERANCE_SECONDS,
            )?,
        };
        let lemonsqueezy = LemonSqueezySettings {
            webhook_secret: env::var("LEMONSQUEEZY_WEBHOOK_SECRET")
                .context("LEMONSQUEEZY_WEBHOOK_SECRET must be set")?,
        };

        Ok(Config {
            database_url,
            bind_addr,
            stripe,
            lemonsqueezy,
            catalog: CatalogSettings::from_env()?,
        })
    }
}

fn env_i64(key: &str, default: i64) -> anyhow::Result<i64> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<i64>()
            .with_context(|| format!("{key} must be an integer")),
        _ => Ok(default),
    }
}

fn price_ids(prefix: &str) -> ProviderPriceIds {
    ProviderPriceIds::new(
        env::var(format!("{prefix}_MONTHLY")).ok(),
        env::var(format!("{prefix}_ANNUAL")).ok(),
    )
}

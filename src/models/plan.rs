use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanTier {
    Free,
    Pro,
    Business,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "FREE",
            PlanTier::Pro => "PRO",
            PlanTier::Business => "BUSINESS",
        }
    }

    pub fn is_paid(self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

impl FromStr for PlanTier {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(PlanTier::Free),
            "PRO" => Ok(PlanTier::Pro),
            "BUSINESS" => Ok(PlanTier::Business),
            _ => Err(ParseEnumError::new("plan", raw)),
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("pro".parse::<PlanTier>().unwrap(), PlanTier::Pro);
        assert_eq!(" Business ".parse::<PlanTier>().unwrap(), PlanTier::Business);
        assert!("enterprise".parse::<PlanTier>().is_err());
    }

    #[test]
    fn only_free_is_unpaid() {
        assert!(!PlanTier::Free.is_paid());
        assert!(PlanTier::Pro.is_paid());
        assert!(PlanTier::Business.is_paid());
    }
}

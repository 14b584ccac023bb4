use serde::{Deserialize, Serialize};

/// Priority tier of a job; each tier owns one scheduler lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    /// Served first, largest round-robin share
    High,

    /// Default tier
    Medium,

    /// Served last, but never starved for more than one round
    Low,
}

impl Default for PriorityTier {
    fn default() -> Self {
        Self::Medium
    }
}

impl PriorityTier {
    /// All tiers in priority order (high to low)
    pub fn all() -> &'static [PriorityTier] {
        &[Self::High, Self::Medium, Self::Low]
    }

    /// Lane index, 0 for the highest tier
    pub fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    /// Inverse of [`PriorityTier::index`]
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::High),
            1 => Some(Self::Medium),
            2 => Some(Self::Low),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" | "normal" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid priority tier: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for tier in PriorityTier::all() {
            assert_eq!(PriorityTier::from_index(tier.index()), Some(*tier));
        }
        assert_eq!(PriorityTier::from_index(3), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!("HIGH".parse::<PriorityTier>(), Ok(PriorityTier::High));
        assert_eq!("normal".parse::<PriorityTier>(), Ok(PriorityTier::Medium));
        assert!("urgent".parse::<PriorityTier>().is_err());
    }
}

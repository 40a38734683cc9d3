use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier attached to one scrape so its log lines can be correlated
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScrapeId(ulid::Ulid);

impl ScrapeId {
    /// Generate a new ID
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for ScrapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScrapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ScrapeId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_ids_are_unique_and_parse_back() {
        let a = ScrapeId::new();
        let b = ScrapeId::new();
        assert_ne!(a, b);

        let parsed: ScrapeId = a.to_string().parse().unwrap();
        assert_eq!(a, parsed);
    }
}

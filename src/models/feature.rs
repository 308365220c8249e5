use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::PointType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCost {
    pub point_type: PointType,
    pub cost: u32,
}

impl FeatureCost {
    pub const fn new(point_type: PointType, cost: u32) -> Self {
        Self { point_type, cost }
    }
}

/// Static table of what each gated feature charges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCatalog {
    features: HashMap<String, FeatureCost>,
}

impl FeatureCatalog {
    /// Builds a catalog, rejecting zero costs and empty ids.
    pub fn new(features: HashMap<String, FeatureCost>) -> Result<Self, String> {
        let mut normalized = HashMap::with_capacity(features.len());
        for (id, cost) in features {
            let id = normalize_feature_id(&id);
            if id.is_empty() {
                return Err("Feature id must not be empty".to_string());
            }
            if cost.cost == 0 {
                return Err(format!("Feature '{}' must cost at least 1 point", id));
            }
            normalized.insert(id, cost);
        }

        Ok(Self {
            features: normalized,
        })
    }

    /// Looks up a feature by id. `grade_essay` and `grade-essay` are the
    /// same feature.
    pub fn resolve(&self, feature_id: &str) -> Option<FeatureCost> {
        self.features.get(&normalize_feature_id(feature_id)).copied()
    }

    pub fn feature_ids(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl Default for FeatureCatalog {
    fn default() -> Self {
        let ticket = FeatureCost::new(PointType::Ticket, 1);
        let diamond = FeatureCost::new(PointType::Diamond, 1);

        let features = [
            ("teach_me_this", ticket),
            ("grade_essay", ticket),
            ("find_mistake", ticket),
            ("create_flashcards", ticket),
            ("find_video", ticket),
            ("generate_audio", ticket),
            ("deeply_research", diamond),
            ("predicted_test", diamond),
        ]
        .into_iter()
        .map(|(id, cost)| (id.to_string(), cost))
        .collect();

        Self { features }
    }
}

pub fn normalize_feature_id(feature_id: &str) -> String {
    feature_id.trim().to_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = FeatureCatalog::default();
        assert_eq!(catalog.len(), 8);
        assert_eq!(
            catalog.resolve("grade_essay"),
            Some(FeatureCost::new(PointType::Ticket, 1))
        );
        assert_eq!(
            catalog.resolve("deeply-research"),
            Some(FeatureCost::new(PointType::Diamond, 1))
        );
        assert_eq!(catalog.resolve("make_coffee"), None);
    }

    #[test]
    fn test_zero_cost_rejected() {
        let mut features = HashMap::new();
        features.insert("free".to_string(), FeatureCost::new(PointType::Ticket, 0));
        assert!(FeatureCatalog::new(features).is_err());
    }

    #[test]
    fn test_custom_costs_are_kept() {
        let mut features = HashMap::new();
        features.insert("Grade-Essay".to_string(), FeatureCost::new(PointType::Diamond, 3));
        let catalog = FeatureCatalog::new(features).unwrap();
        assert_eq!(
            catalog.resolve("grade_essay"),
            Some(FeatureCost::new(PointType::Diamond, 3))
        );
    }
}

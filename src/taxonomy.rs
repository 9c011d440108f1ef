//! Fixed observation taxonomy for zero-shot patient monitoring.
//!
//! Each category holds a list of natural-language label prompts. The
//! category order and the label order within a category are significant:
//! they determine the on-disk layout of the packed embeddings artifact,
//! and the downstream client indexes label scores by position.

use anyhow::{bail, Result};
use std::collections::HashSet;

/// Built-in observation categories with descriptive text prompts.
const NURSING_LABELS: &[(&str, &[&str])] = &[
    (
        "position",
        &[
            "a patient lying flat on their back in a hospital bed",
            "a patient lying on their left side in a hospital bed",
            "a patient lying on their right side in a hospital bed",
            "a patient lying face down on their stomach in a hospital bed",
            "a patient sitting up in a hospital bed",
            "a patient sitting in a chair or wheelchair",
            "a patient standing upright",
            "a person lying on the floor, possibly fallen",
        ],
    ),
    (
        "alertness",
        &[
            "a patient who is awake and alert, eyes open, looking around",
            "a patient who appears drowsy or sleepy, eyes half-closed",
            "a patient who is sleeping peacefully with eyes closed",
            "a patient with eyes closed, resting",
            "an unresponsive patient, not reacting to surroundings",
        ],
    ),
    (
        "activity",
        &[
            "a patient lying completely still with no movement",
            "a patient with slight movement, small gestures",
            "a patient moving moderately, shifting position",
            "a patient moving actively, gesturing or repositioning",
            "a patient who appears restless or agitated",
        ],
    ),
    (
        "comfort",
        &[
            "a patient who appears comfortable and relaxed",
            "a patient showing signs of mild discomfort",
            "a patient showing moderate discomfort or pain",
            "a patient who appears distressed or in significant pain",
            "a patient with facial expressions indicating pain",
        ],
    ),
    (
        "safety",
        &[
            "a patient in a safe, normal hospital room setting",
            "a patient at risk of falling, near edge of bed",
            "a patient who has fallen on the floor",
            "a patient attempting to get out of bed",
            "medical equipment that appears disconnected or problematic",
        ],
    ),
];

/// One category and its candidate label prompts
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub labels: Vec<String>,
}

/// Ordered set of categories, validated at construction
#[derive(Debug, Clone)]
pub struct Taxonomy {
    categories: Vec<Category>,
}

impl Taxonomy {
    /// Build a taxonomy, rejecting empty label lists and duplicate names.
    pub fn new(categories: Vec<Category>) -> Result<Self> {
        let mut seen = HashSet::new();
        for category in &categories {
            if category.name.is_empty() {
                bail!("taxonomy contains a category with an empty name");
            }
            if category.labels.is_empty() {
                bail!("category '{}' has no labels", category.name);
            }
            if !seen.insert(category.name.as_str()) {
                bail!("duplicate category name '{}'", category.name);
            }
        }
        Ok(Self { categories })
    }

    /// The built-in nursing observation taxonomy.
    pub fn nursing() -> Self {
        let categories = NURSING_LABELS
            .iter()
            .map(|(name, labels)| Category {
                name: (*name).to_string(),
                labels: labels.iter().map(|l| (*l).to_string()).collect(),
            })
            .collect();
        Self::new(categories).expect("built-in nursing taxonomy is valid")
    }

    /// Categories in declaration order.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Total number of labels across all categories.
    pub fn label_count(&self) -> usize {
        self.categories.iter().map(|c| c.labels.len()).sum()
    }
}

//! Product identity allow-list
//!
//! Only current product identifiers are trustworthy. Legacy identifiers are
//! tracked separately so they can be logged, but they are never valid.

use std::collections::HashSet;

/// Products sold today
pub const DEFAULT_VALID_PRODUCTS: &[&str] = &["premium_monthly", "premium_yearly"];

/// Catalog of product identifiers the engine recognises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductCatalog {
    valid: HashSet<String>,
    legacy: HashSet<String>,
}

impl ProductCatalog {
    pub fn new<V, L>(valid: V, legacy: L) -> Self
    where
        V: IntoIterator,
        V::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            valid: valid.into_iter().map(Into::into).collect(),
            legacy: legacy.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse comma-separated lists, as they arrive from the environment
    pub fn from_lists(valid: &str, legacy: &str) -> Self {
        Self::new(split_list(valid), split_list(legacy))
    }

    pub fn is_valid(&self, product_id: &str) -> bool {
        self.valid.contains(product_id)
    }

    pub fn is_legacy(&self, product_id: &str) -> bool {
        self.legacy.contains(product_id)
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn valid_ids(&self) -> impl Iterator<Item = &str> {
        self.valid.iter().map(String::as_str)
    }
}

impl Default for ProductCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_VALID_PRODUCTS.iter().copied(), Vec::<String>::new())
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lists_trims_and_skips_empty() {
        let catalog = ProductCatalog::from_lists(" premium_monthly, ,premium_yearly ", "pro_v1");
        assert!(catalog.is_valid("premium_monthly"));
        assert!(catalog.is_valid("premium_yearly"));
        assert!(!catalog.is_valid(""));
        assert!(catalog.is_legacy("pro_v1"));
        assert!(!catalog.is_valid("pro_v1"));
    }

    #[test]
    fn test_default_catalog() {
        let catalog = ProductCatalog::default();
        assert!(!catalog.is_empty());
        assert!(catalog.is_valid("premium_monthly"));
    }
}

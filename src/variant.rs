//! Lazily built program variants keyed by the feature flags they were
//! compiled with.

use std::collections::HashMap;
use std::hash::Hash;

/// Feature flags the display program is specialized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DisplayKeywords {
    pub shading: bool,
}

impl DisplayKeywords {
    /// Pipeline-overridable constants for this variant.
    pub fn constants(&self) -> HashMap<String, f64> {
        let mut constants = HashMap::new();
        constants.insert("SHADING".to_string(), if self.shading { 1.0 } else { 0.0 });
        constants
    }
}

pub struct VariantCache<K, V> {
    variants: HashMap<K, V>,
    builds: usize,
}

impl<K: Eq + Hash + Copy, V> Default for VariantCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Copy, V> VariantCache<K, V> {
    pub fn new() -> Self {
        Self { variants: HashMap::new(), builds: 0 }
    }

    /// Return the variant for `key`, building it on first use.
    pub fn get_or_build(&mut self, key: K, build: impl FnOnce(K) -> V) -> &V {
        let builds = &mut self.builds;
        self.variants.entry(key).or_insert_with(|| {
            *builds += 1;
            build(key)
        })
    }

    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

//! Producer capability map (§9 "Hierarchical producer families").
//!
//! `source_id -> set<capability_tag>`. No inheritance; dispatch by tag
//! lookup. New producers register by appending to the map — this is a
//! plain in-memory registry behind a lock, not a database table, since it
//! is operator-configured rather than derived from strand history.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Producer family tags named in spec §9: raw data, indicator, pattern,
/// system-control, central-intelligence, plus fine-grained capability tags
/// the Orchestrator's target-source selection (§4.8 step 4) dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    RawData,
    Indicator,
    Pattern,
    SystemControl,
    CentralIntelligence,
    Divergence,
    Volume,
    IndicatorComposite,
    Microstructure,
    Regime,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::RawData => "raw_data",
            Capability::Indicator => "indicator",
            Capability::Pattern => "pattern",
            Capability::SystemControl => "system_control",
            Capability::CentralIntelligence => "central_intelligence",
            Capability::Divergence => "divergence",
            Capability::Volume => "volume",
            Capability::IndicatorComposite => "indicator_composite",
            Capability::Microstructure => "microstructure",
            Capability::Regime => "regime",
        }
    }
}

#[derive(Default)]
pub struct CapabilityMap {
    inner: RwLock<HashMap<String, HashSet<Capability>>>,
}

impl CapabilityMap {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, source_id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) {
        self.inner
            .write()
            .entry(source_id.into())
            .or_default()
            .extend(capabilities);
    }

    pub fn has(&self, source_id: &str, capability: Capability) -> bool {
        self.inner
            .read()
            .get(source_id)
            .is_some_and(|caps| caps.contains(&capability))
    }

    /// All registered sources carrying a given capability, used by the
    /// Orchestrator's target-source selection (§4.8 step 4).
    pub fn sources_with(&self, capability: Capability) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(_, caps)| caps.contains(&capability))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let map = CapabilityMap::new();
        map.register("raw_data_intel", [Capability::RawData, Capability::Divergence, Capability::Volume]);
        map.register("indicator_producer", [Capability::Indicator, Capability::IndicatorComposite]);

        assert!(map.has("raw_data_intel", Capability::Divergence));
        assert!(!map.has("indicator_producer", Capability::Divergence));
        let sources = map.sources_with(Capability::Indicator);
        assert_eq!(sources, vec!["indicator_producer".to_string()]);
    }
}

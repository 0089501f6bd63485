//! # Fallback Chain
//!
//! Orders the available rendering backends from highest to lowest fidelity
//! and answers "what do we try next". Every chain ends in a backend that is
//! always available, so a cascade of fallbacks always terminates on
//! something that can render.
//!
//! The chain is built once per session from a capability probe and rebuilt
//! only when the probe reports different capabilities.
//!
//! This module also tracks the capabilities degraded in place by recovery
//! strategies ([`DegradedFeatures`]), the lighter-weight form of fallback.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Error, Result};

/// Capabilities reported by the device probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    /// Hardware accelerated rendering is available
    pub gpu_acceleration: bool,
    /// Coarse GPU performance tier, 0 when unknown
    pub gpu_tier: u8,
    /// Largest texture dimension the device accepts
    pub max_texture_size: u32,
    /// Named optional features (e.g. "float-textures", "instancing")
    pub features: BTreeSet<String>,
}

impl DeviceCapabilities {
    pub fn with_feature<S: Into<String>>(mut self, feature: S) -> Self {
        self.features.insert(feature.into());
        self
    }
}

/// Source of device capabilities
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> DeviceCapabilities;
}

/// A probe that always reports the same capabilities
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub DeviceCapabilities);

impl CapabilityProbe for StaticProbe {
    fn probe(&self) -> DeviceCapabilities {
        self.0.clone()
    }
}

/// What a backend needs from the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendRequirements {
    pub gpu_acceleration: bool,
    pub min_gpu_tier: u8,
    pub min_texture_size: u32,
    pub features: BTreeSet<String>,
}

impl BackendRequirements {
    /// Whether `caps` satisfies every requirement
    pub fn satisfied_by(&self, caps: &DeviceCapabilities) -> bool {
        (!self.gpu_acceleration || caps.gpu_acceleration)
            && caps.gpu_tier >= self.min_gpu_tier
            && caps.max_texture_size >= self.min_texture_size
            && self.features.is_subset(&caps.features)
    }
}

/// One interchangeable rendering backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    /// Higher tiers render with more fidelity
    pub capability_tier: u8,
    /// Can render on any device; a chain always ends in one of these
    pub is_always_available: bool,
    #[serde(default)]
    pub requirements: BackendRequirements,
}

impl BackendDescriptor {
    pub fn new<S: Into<String>>(id: S, capability_tier: u8) -> Self {
        Self {
            id: id.into(),
            capability_tier,
            is_always_available: false,
            requirements: BackendRequirements::default(),
        }
    }

    /// Marks the backend as renderable on any device
    pub fn always_available(mut self) -> Self {
        self.is_always_available = true;
        self
    }

    pub fn requires(mut self, requirements: BackendRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Whether the backend can run on a device with `caps`
    pub fn is_supported(&self, caps: &DeviceCapabilities) -> bool {
        self.is_always_available || self.requirements.satisfied_by(caps)
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tier {})", self.id, self.capability_tier)
    }
}

/// Backends ordered by fidelity, ending in an always-available one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackChain {
    backends: Vec<BackendDescriptor>,
}

impl FallbackChain {
    /// Builds a chain from candidates the device supports
    ///
    /// Candidates are sorted by tier, highest first; equal tiers keep their
    /// given order. Anything ranked below the last always-available backend
    /// is dropped, since it could never be reached as a terminal.
    pub fn build(candidates: &[BackendDescriptor], caps: &DeviceCapabilities) -> Result<Self> {
        if let Some(backend) = candidates.iter().find(|backend| backend.id.contains('@')) {
            return Err(Error::Configuration(format!(
                "backend id '{}' must not contain '@'",
                backend.id
            )));
        }

        let mut backends: Vec<BackendDescriptor> = candidates
            .iter()
            .filter(|backend| {
                let supported = backend.is_supported(caps);
                if !supported {
                    debug!(backend = %backend.id, "Backend unsupported by device, skipped");
                }
                supported
            })
            .cloned()
            .collect();
        backends.sort_by(|a, b| b.capability_tier.cmp(&a.capability_tier));

        let terminal = backends
            .iter()
            .rposition(|backend| backend.is_always_available)
            .ok_or(Error::EmptyChain)?;
        for dropped in backends.drain(terminal + 1..) {
            warn!(backend = %dropped.id, "Backend ranked below the terminal backend, dropped");
        }

        Ok(Self { backends })
    }

    /// Builds a chain using a capability probe
    pub fn from_probe(candidates: &[BackendDescriptor], probe: &dyn CapabilityProbe) -> Result<Self> {
        Self::build(candidates, &probe.probe())
    }

    /// Highest fidelity backend
    pub fn first(&self) -> &BackendDescriptor {
        &self.backends[0]
    }

    /// The always-available backend the chain ends in
    pub fn terminal(&self) -> &BackendDescriptor {
        &self.backends[self.backends.len() - 1]
    }

    pub fn get(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|backend| backend.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.backends.iter().position(|backend| backend.id == id)
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminal().id == id
    }

    /// The backend after `current`, or the terminal if `current` is last or unknown
    pub fn next(&self, current: &str) -> &BackendDescriptor {
        match self.position(current) {
            Some(index) if index + 1 < self.backends.len() => &self.backends[index + 1],
            _ => self.terminal(),
        }
    }

    /// First backend after `current` that `usable` accepts, or the terminal
    pub fn next_where<F>(&self, current: &str, mut usable: F) -> &BackendDescriptor
    where
        F: FnMut(&BackendDescriptor) -> bool,
    {
        let start = self.position(current).map_or(self.backends.len(), |index| index + 1);
        self.backends
            .iter()
            .skip(start)
            .find(|backend| self.is_terminal(&backend.id) || usable(backend))
            .unwrap_or_else(|| self.terminal())
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false; a built chain holds at least its terminal backend
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Owns the session's chain and rebuilds it when capabilities change
pub struct FallbackChainResolver {
    candidates: Vec<BackendDescriptor>,
    probe: Arc<dyn CapabilityProbe>,
    capabilities: RwLock<DeviceCapabilities>,
    chain: RwLock<Arc<FallbackChain>>,
}

impl fmt::Debug for FallbackChainResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChainResolver")
            .field("candidates", &self.candidates.len())
            .field("chain", &self.chain())
            .finish()
    }
}

impl FallbackChainResolver {
    /// Probes the device and builds the initial chain
    pub fn new(candidates: Vec<BackendDescriptor>, probe: Arc<dyn CapabilityProbe>) -> Result<Self> {
        let capabilities = probe.probe();
        let chain = FallbackChain::build(&candidates, &capabilities)?;
        info!(chain = ?chain.ids(), "Fallback chain built");
        Ok(Self {
            candidates,
            probe,
            capabilities: RwLock::new(capabilities),
            chain: RwLock::new(Arc::new(chain)),
        })
    }

    /// Resolver over a fixed chain that never changes
    pub fn fixed(candidates: Vec<BackendDescriptor>) -> Result<Self> {
        let all = DeviceCapabilities {
            gpu_acceleration: true,
            gpu_tier: u8::MAX,
            max_texture_size: u32::MAX,
            features: candidates
                .iter()
                .flat_map(|backend| backend.requirements.features.iter().cloned())
                .collect(),
        };
        Self::new(candidates, Arc::new(StaticProbe(all)))
    }

    /// Current chain
    pub fn chain(&self) -> Arc<FallbackChain> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn next(&self, current: &str) -> BackendDescriptor {
        self.chain().next(current).clone()
    }

    /// Re-probes the device; rebuilds the chain if capabilities changed
    ///
    /// Returns whether the chain was replaced. On error the previous chain
    /// stays in place.
    pub fn rebuild(&self) -> Result<bool> {
        let capabilities = self.probe.probe();
        {
            let current = self.capabilities.read().unwrap_or_else(PoisonError::into_inner);
            if *current == capabilities {
                return Ok(false);
            }
        }

        let chain = FallbackChain::build(&self.candidates, &capabilities)?;
        info!(chain = ?chain.ids(), "Capabilities changed, fallback chain rebuilt");
        *self.capabilities.write().unwrap_or_else(PoisonError::into_inner) = capabilities;
        *self.chain.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(chain);
        Ok(true)
    }
}

/// A capability a recovery strategy can turn off without leaving the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedFeature {
    Animation,
    Materials,
    Textures,
}

impl fmt::Display for DegradedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedFeature::Animation => write!(f, "animation"),
            DegradedFeature::Materials => write!(f, "materials"),
            DegradedFeature::Textures => write!(f, "textures"),
        }
    }
}

/// Why and when a feature was degraded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedEntry {
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Features degraded on a subject's current backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DegradedFeatures {
    entries: BTreeMap<DegradedFeature, DegradedEntry>,
}

impl DegradedFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Degrades a feature; returns false if it already was
    pub fn activate<S: Into<String>>(&mut self, feature: DegradedFeature, reason: S) -> bool {
        if self.entries.contains_key(&feature) {
            return false;
        }
        let reason = reason.into();
        warn!(feature = %feature, reason = %reason, "Feature degraded");
        counter!("renderer_degraded_features_total", 1, "feature" => feature.to_string());
        self.entries.insert(
            feature,
            DegradedEntry {
                reason,
                since: Utc::now(),
            },
        );
        true
    }

    /// Restores a feature
    pub fn deactivate(&mut self, feature: DegradedFeature) -> bool {
        let restored = self.entries.remove(&feature).is_some();
        if restored {
            info!(feature = %feature, "Feature restored");
        }
        restored
    }

    pub fn is_active(&self, feature: DegradedFeature) -> bool {
        self.entries.contains_key(&feature)
    }

    pub fn active(&self) -> Vec<DegradedFeature> {
        self.entries.keys().copied().collect()
    }

    pub fn get(&self, feature: DegradedFeature) -> Option<&DegradedEntry> {
        self.entries.get(&feature)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

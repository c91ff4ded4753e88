//! Geometry attribute requests and the attribute ID map.
//!
//! Shaders read per-vertex and per-object attributes by numeric ID. Standard
//! attributes have fixed IDs equal to their [`AttributeStandard`]
//! discriminant; custom attribute names are interned on first use and keep
//! their ID for the lifetime of the map.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Attributes with a fixed meaning and a fixed ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum AttributeStandard {
    VertexNormal,
    FaceNormal,
    Uv,
    UvTangent,
    UvTangentSign,
    VertexColor,
    PositionUndisplaced,
    Generated,
    GeneratedTransform,
    MotionVertexPosition,
    Pointiness,
    RandomPerIsland,
    CurveIntercept,
    CurveRandom,
    VolumeDensity,
    VolumeColor,
    VolumeFlame,
    VolumeHeat,
    VolumeTemperature,
    VolumeVelocity,
    ShadowTransparency,
}

impl AttributeStandard {
    pub const ALL: [AttributeStandard; 21] = [
        AttributeStandard::VertexNormal,
        AttributeStandard::FaceNormal,
        AttributeStandard::Uv,
        AttributeStandard::UvTangent,
        AttributeStandard::UvTangentSign,
        AttributeStandard::VertexColor,
        AttributeStandard::PositionUndisplaced,
        AttributeStandard::Generated,
        AttributeStandard::GeneratedTransform,
        AttributeStandard::MotionVertexPosition,
        AttributeStandard::Pointiness,
        AttributeStandard::RandomPerIsland,
        AttributeStandard::CurveIntercept,
        AttributeStandard::CurveRandom,
        AttributeStandard::VolumeDensity,
        AttributeStandard::VolumeColor,
        AttributeStandard::VolumeFlame,
        AttributeStandard::VolumeHeat,
        AttributeStandard::VolumeTemperature,
        AttributeStandard::VolumeVelocity,
        AttributeStandard::ShadowTransparency,
    ];

    /// First ID handed out to custom attribute names.
    pub const COUNT: u32 = Self::ALL.len() as u32;

    pub fn name(self) -> &'static str {
        match self {
            AttributeStandard::VertexNormal => "N",
            AttributeStandard::FaceNormal => "Ng",
            AttributeStandard::Uv => "uv",
            AttributeStandard::UvTangent => "tangent",
            AttributeStandard::UvTangentSign => "tangent_sign",
            AttributeStandard::VertexColor => "vertex_color",
            AttributeStandard::PositionUndisplaced => "undisplaced",
            AttributeStandard::Generated => "generated",
            AttributeStandard::GeneratedTransform => "generated_transform",
            AttributeStandard::MotionVertexPosition => "motion_P",
            AttributeStandard::Pointiness => "pointiness",
            AttributeStandard::RandomPerIsland => "random_per_island",
            AttributeStandard::CurveIntercept => "curve_intercept",
            AttributeStandard::CurveRandom => "curve_random",
            AttributeStandard::VolumeDensity => "density",
            AttributeStandard::VolumeColor => "color",
            AttributeStandard::VolumeFlame => "flame",
            AttributeStandard::VolumeHeat => "heat",
            AttributeStandard::VolumeTemperature => "temperature",
            AttributeStandard::VolumeVelocity => "velocity",
            AttributeStandard::ShadowTransparency => "shadow_transparency",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    pub fn id(self) -> u32 {
        self as u32
    }
}

/// Either a standard attribute or a user-named one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKey {
    Standard(AttributeStandard),
    Name(String),
}

impl AttributeKey {
    /// Maps standard attribute names onto their standard key.
    pub fn from_name(name: &str) -> Self {
        match AttributeStandard::from_name(name) {
            Some(std) => AttributeKey::Standard(std),
            None => AttributeKey::Name(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AttributeKey::Standard(std) => std.name(),
            AttributeKey::Name(name) => name,
        }
    }
}

/// Thread-safe map from attribute key to numeric ID.
///
/// Lookups from concurrent shader compiles are safe; the same key always
/// yields the same ID.
#[derive(Debug, Default)]
pub struct AttributeIdMap {
    names: DashMap<String, u32>,
    next: AtomicU32,
}

impl AttributeIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self, key: &AttributeKey) -> u32 {
        match key {
            AttributeKey::Standard(std) => std.id(),
            AttributeKey::Name(name) => self.id_for_name(name),
        }
    }

    /// ID for an attribute name; standard names resolve to their fixed ID.
    pub fn id_for_name(&self, name: &str) -> u32 {
        if let Some(std) = AttributeStandard::from_name(name) {
            return std.id();
        }
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        *self
            .names
            .entry(name.to_string())
            .or_insert_with(|| AttributeStandard::COUNT + self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of custom names interned so far.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Ordered, de-duplicated set of attributes a shader reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRequestSet {
    requests: IndexSet<AttributeKey>,
}

impl AttributeRequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: AttributeKey) {
        self.requests.insert(key);
    }

    pub fn add_standard(&mut self, std: AttributeStandard) {
        self.add(AttributeKey::Standard(std));
    }

    /// Adds by name, resolving standard names.
    pub fn add_name(&mut self, name: &str) {
        self.add(AttributeKey::from_name(name));
    }

    pub fn contains(&self, key: &AttributeKey) -> bool {
        self.requests.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeKey> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn merge(&mut self, other: &AttributeRequestSet) {
        self.requests.extend(other.requests.iter().cloned());
    }

    /// Whether the set differs from `previous`, ignoring order.
    pub fn modified(&self, previous: &AttributeRequestSet) -> bool {
        self.len() != previous.len() || self.iter().any(|key| !previous.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn standard_names_resolve_to_fixed_ids() {
        let map = AttributeIdMap::new();
        assert_eq!(map.id_for_name("uv"), AttributeStandard::Uv.id());
        assert_eq!(map.id(&AttributeKey::Standard(AttributeStandard::Uv)), map.id_for_name("uv"));
        assert!(map.is_empty());
    }

    #[test]
    fn custom_names_get_stable_ids_after_standard_range() {
        let map = AttributeIdMap::new();
        let a = map.id_for_name("wetness");
        let b = map.id_for_name("dirt");
        assert_eq!(a, AttributeStandard::COUNT);
        assert_eq!(b, AttributeStandard::COUNT + 1);
        assert_eq!(map.id_for_name("wetness"), a);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn concurrent_lookups_agree() {
        let map = Arc::new(AttributeIdMap::new());
        let names: Vec<String> = (0..32).map(|i| format!("attr_{i}")).collect();
        let results: Vec<Vec<u32>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let map = Arc::clone(&map);
                    let names = &names;
                    s.spawn(move || names.iter().map(|n| map.id_for_name(n)).collect::<Vec<_>>())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        let mut unique = results[0].clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn request_set_modified_ignores_order() {
        let mut a = AttributeRequestSet::new();
        a.add_name("uv");
        a.add_name("wetness");
        let mut b = AttributeRequestSet::new();
        b.add_name("wetness");
        b.add_standard(AttributeStandard::Uv);
        assert!(!a.modified(&b));
        b.add_standard(AttributeStandard::Generated);
        assert!(b.modified(&a));
    }
}

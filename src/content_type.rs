//! Content-type classification.
//!
//! A package is classified by the path prefixes present in its content listing.
//! Several categories may match; the package takes the first one in
//! declaration order, so compound content (scenes, presets) outranks plugins
//! and raw assets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Asset category of a package. Variants are declared in classification
/// priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Scene,
    Appearance,
    Preset,
    Plugin,
    Pose,
    Clothing,
    Hair,
    Morph,
    Texture,
    Sound,
    Asset,
}

/// Lowercase path fragments that mark a category.
const MARKERS: &[(ContentType, &str)] = &[
    (ContentType::Asset, "custom/assets/"),
    (ContentType::Clothing, "custom/clothing/"),
    (ContentType::Hair, "custom/hair/"),
    (ContentType::Morph, "custom/atom/person/morphs/"),
    (ContentType::Texture, "custom/atom/person/textures/"),
    (ContentType::Preset, "custom/atom/person/appearance/"),
    (ContentType::Plugin, "custom/scripts/"),
    (ContentType::Scene, "saves/scene/"),
    (ContentType::Appearance, "saves/person/appearance/"),
    (ContentType::Sound, "custom/sounds/"),
    (ContentType::Pose, "saves/person/pose/"),
    (ContentType::Pose, "custom/atom/person/pose/"),
];

/// Lookup order for the repair index: foundational assets first.
const REFERENCE_ORDER: [ContentType; 11] = [
    ContentType::Texture,
    ContentType::Morph,
    ContentType::Sound,
    ContentType::Plugin,
    ContentType::Hair,
    ContentType::Clothing,
    ContentType::Asset,
    ContentType::Pose,
    ContentType::Appearance,
    ContentType::Preset,
    ContentType::Scene,
];

impl ContentType {
    /// Collects every category whose marker appears (case-insensitively) in any path.
    pub fn detect<'a>(paths: impl IntoIterator<Item = &'a str>) -> BTreeSet<ContentType> {
        let mut found = BTreeSet::new();
        for path in paths {
            let lower = path.to_lowercase();
            for (kind, marker) in MARKERS {
                if lower.contains(marker) {
                    found.insert(*kind);
                }
            }
        }
        found
    }

    /// Resolves a set of matched categories to the single highest-priority one.
    pub fn classify(contains: &BTreeSet<ContentType>) -> ContentType {
        contains.iter().next().copied().unwrap_or(ContentType::Asset)
    }

    /// Position in the repair-index ordering; lower sorts first.
    pub fn reference_priority(self) -> usize {
        REFERENCE_ORDER
            .iter()
            .position(|kind| *kind == self)
            .unwrap_or(REFERENCE_ORDER.len())
    }

    /// Only types that embed JSON-like content can be repaired.
    pub fn is_repairable(self) -> bool {
        matches!(
            self,
            ContentType::Scene | ContentType::Appearance | ContentType::Preset
        )
    }

    /// Default store sub-directory for this category.
    pub fn subdirectory(self) -> String {
        match self {
            ContentType::Scene | ContentType::Appearance | ContentType::Preset => {
                "scenes".to_string()
            }
            ContentType::Asset => "assets/unity".to_string(),
            other => format!("assets/{}", other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Scene => "scene",
            ContentType::Appearance => "appearance",
            ContentType::Preset => "preset",
            ContentType::Plugin => "plugin",
            ContentType::Pose => "pose",
            ContentType::Clothing => "clothing",
            ContentType::Hair => "hair",
            ContentType::Morph => "morph",
            ContentType::Texture => "texture",
            ContentType::Sound => "sound",
            ContentType::Asset => "asset",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin and unity-asset bundles are never symlinked.
pub fn is_symlink_eligible(contains: &BTreeSet<ContentType>) -> bool {
    !contains.contains(&ContentType::Asset) && !contains.contains(&ContentType::Plugin)
}

//! Reaction system
//!
//! Two kinds of data-driven rules:
//! - pairwise interactions, fired when two different materials touch
//!   (lava + wood → fire)
//! - unary reactions, fired when a tile's own temperature crosses a threshold
//!   (water above 128 → steam)
//!
//! Rules are declared by material name or id and resolved once against the
//! [`MaterialRegistry`] into an N×N table, so runtime lookups never fail.

use crate::error::ConfigError;
use crate::simulation::{MaterialId, MaterialInstance, MaterialRegistry};
use glam::IVec2;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// What a pairwise interaction does to the area around the touched tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionKind {
    /// Tiles of the touched material within the radius become the result
    TransformMaterial,
    /// Air tiles within the radius become the result
    SpawnMaterial,
}

/// Resolved interaction for an ordered material pair
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interaction {
    pub kind: InteractionKind,
    pub result: u16,
    /// Offset from the touched tile to the center of the affected area
    pub offset: IVec2,
    pub radius: i32,
    /// 0 fires on every check, tier t on one check in t + 1
    pub tier: u32,
}

/// Threshold on a tile's own temperature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionCondition {
    TemperatureAbove(i32),
    TemperatureBelow(i32),
}

impl ReactionCondition {
    #[inline]
    pub fn holds(self, temperature: i32) -> bool {
        match self {
            ReactionCondition::TemperatureAbove(threshold) => temperature > threshold,
            ReactionCondition::TemperatureBelow(threshold) => temperature < threshold,
        }
    }
}

/// Resolved single-material reaction
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnaryReaction {
    pub condition: ReactionCondition,
    pub result: u16,
}

/// Material named either by registry id or by name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaterialRef {
    Id(u16),
    Name(String),
}

impl From<u16> for MaterialRef {
    fn from(id: u16) -> Self {
        MaterialRef::Id(id)
    }
}

impl From<&str> for MaterialRef {
    fn from(name: &str) -> Self {
        MaterialRef::Name(name.to_string())
    }
}

/// Declared pairwise interaction, before resolution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractionRule {
    pub name: String,
    /// Tile doing the checking
    pub material: MaterialRef,
    /// Touched neighbor
    pub other: MaterialRef,
    pub kind: InteractionKind,
    pub result: MaterialRef,
    #[serde(default)]
    pub offset: (i32, i32),
    #[serde(default)]
    pub radius: i32,
    #[serde(default)]
    pub tier: u32,
}

/// Declared unary reaction, before resolution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactionRule {
    pub name: String,
    pub material: MaterialRef,
    pub condition: ReactionCondition,
    pub result: MaterialRef,
}

/// Full rule set, loadable from RON
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReactionRules {
    #[serde(default)]
    pub interactions: Vec<InteractionRule>,
    #[serde(default)]
    pub reactions: Vec<ReactionRule>,
}

impl ReactionRules {
    /// Rules for the built-in material catalogue
    pub fn defaults() -> Self {
        let mut rules = Self::default();

        // ===== TEMPERATURE REACTIONS =====

        rules.reaction(
            "water_boil",
            MaterialId::WATER,
            ReactionCondition::TemperatureAbove(128),
            MaterialId::STEAM,
        );
        rules.reaction(
            "lava_solidify",
            MaterialId::LAVA,
            ReactionCondition::TemperatureBelow(512),
            MaterialId::OBSIDIAN,
        );
        rules.reaction(
            "steam_condense",
            MaterialId::STEAM,
            ReactionCondition::TemperatureBelow(48),
            MaterialId::WATER,
        );
        rules.reaction(
            "ice_melt",
            MaterialId::ICE,
            ReactionCondition::TemperatureAbove(16),
            MaterialId::WATER,
        );
        rules.reaction(
            "fire_burn_out",
            MaterialId::FIRE,
            ReactionCondition::TemperatureBelow(64),
            MaterialId::SMOKE,
        );

        // ===== CONTACT INTERACTIONS =====

        rules.interactions.push(InteractionRule {
            name: "lava_ignite_wood".to_string(),
            material: MaterialId::LAVA.into(),
            other: MaterialId::WOOD.into(),
            kind: InteractionKind::TransformMaterial,
            result: MaterialId::FIRE.into(),
            offset: (0, 0),
            radius: 0,
            tier: 2,
        });
        rules.interactions.push(InteractionRule {
            name: "fire_spread_wood".to_string(),
            material: MaterialId::FIRE.into(),
            other: MaterialId::WOOD.into(),
            kind: InteractionKind::TransformMaterial,
            result: MaterialId::FIRE.into(),
            offset: (0, 0),
            radius: 0,
            tier: 4,
        });
        rules.interactions.push(InteractionRule {
            name: "water_douse_fire".to_string(),
            material: MaterialId::WATER.into(),
            other: MaterialId::FIRE.into(),
            kind: InteractionKind::TransformMaterial,
            result: MaterialId::STEAM.into(),
            offset: (0, 0),
            radius: 1,
            tier: 0,
        });
        rules.interactions.push(InteractionRule {
            name: "fire_smoke".to_string(),
            material: MaterialId::FIRE.into(),
            other: MaterialId::AIR.into(),
            kind: InteractionKind::SpawnMaterial,
            result: MaterialId::SMOKE.into(),
            offset: (0, 0),
            radius: 0,
            tier: 8,
        });

        rules
    }

    fn reaction(&mut self, name: &str, material: u16, condition: ReactionCondition, result: u16) {
        self.reactions.push(ReactionRule {
            name: name.to_string(),
            material: material.into(),
            condition,
            result: result.into(),
        });
    }

    pub fn from_ron(source: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(source)
    }
}

/// Resolved rule tables with O(1) lookup by material id
pub struct ReactionEngine {
    material_count: usize,
    /// N×N, index = a * N + b
    interactions: Vec<Vec<Interaction>>,
    reactions: Vec<Vec<UnaryReaction>>,
    /// Drives tier selection; shared by all tick workers
    counter: AtomicU32,
}

impl ReactionEngine {
    /// Resolve `rules` against `registry`, rejecting any unknown material
    pub fn build(registry: &MaterialRegistry, rules: &ReactionRules) -> Result<Self, ConfigError> {
        let n = registry.len();
        if n == 0 {
            return Err(ConfigError::EmptyRegistry);
        }

        let mut interactions = vec![Vec::new(); n * n];
        let mut reactions = vec![Vec::new(); n];

        for rule in &rules.interactions {
            let a = resolve(registry, &rule.name, &rule.material)?;
            let b = resolve(registry, &rule.name, &rule.other)?;
            let result = resolve(registry, &rule.name, &rule.result)?;
            if rule.radius < 0 {
                return Err(ConfigError::NegativeRadius {
                    rule: rule.name.clone(),
                    radius: rule.radius,
                });
            }
            // Selection rolls modulo tier + 1
            if rule.tier == u32::MAX {
                return Err(ConfigError::TierOutOfRange {
                    rule: rule.name.clone(),
                    tier: rule.tier,
                });
            }

            interactions[a as usize * n + b as usize].push(Interaction {
                kind: rule.kind,
                result,
                offset: IVec2::new(rule.offset.0, rule.offset.1),
                radius: rule.radius,
                tier: rule.tier,
            });
        }

        for rule in &rules.reactions {
            let material = resolve(registry, &rule.name, &rule.material)?;
            let result = resolve(registry, &rule.name, &rule.result)?;
            reactions[material as usize].push(UnaryReaction {
                condition: rule.condition,
                result,
            });
        }

        log::debug!(
            "Reaction tables built: {} materials, {} interactions, {} reactions",
            n,
            rules.interactions.len(),
            rules.reactions.len()
        );

        Ok(Self {
            material_count: n,
            interactions,
            reactions,
            counter: AtomicU32::new(0),
        })
    }

    pub fn with_defaults(registry: &MaterialRegistry) -> Result<Self, ConfigError> {
        Self::build(registry, &ReactionRules::defaults())
    }

    /// All interactions for `material` touching `other`, in declaration order
    #[inline]
    pub fn interactions(&self, material: u16, other: u16) -> &[Interaction] {
        let index = material as usize * self.material_count + other as usize;
        self.interactions.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pick at most one interaction for this adjacency check
    pub fn select_interaction(&self, material: u16, other: u16) -> Option<&Interaction> {
        let candidates = self.interactions(material, other);
        if candidates.is_empty() {
            return None;
        }

        let roll = self.counter.fetch_add(1, Ordering::Relaxed);
        candidates
            .iter()
            .find(|interaction| roll % (interaction.tier + 1) == 0)
    }

    #[inline]
    pub fn reactions(&self, material: u16) -> &[UnaryReaction] {
        self.reactions
            .get(material as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Apply the first unary reaction whose condition holds; returns whether one fired
    ///
    /// The temperature is reset to the new material's default only when the
    /// physics class changes.
    pub fn react(&self, registry: &MaterialRegistry, tile: &mut MaterialInstance) -> bool {
        let Some(reaction) = self
            .reactions(tile.material)
            .iter()
            .find(|reaction| reaction.condition.holds(tile.temperature))
        else {
            return false;
        };

        let before = registry.physics_class(tile.material);
        let after = registry.get(reaction.result);
        tile.material = reaction.result;
        tile.color = after.color;
        if after.physics_class != before {
            tile.temperature = after.default_temperature;
        }
        true
    }
}

fn resolve(registry: &MaterialRegistry, rule: &str, material: &MaterialRef) -> Result<u16, ConfigError> {
    match material {
        MaterialRef::Id(id) if registry.contains(*id) => Ok(*id),
        MaterialRef::Id(id) => Err(ConfigError::UnknownMaterialId {
            rule: rule.to_string(),
            id: *id,
        }),
        MaterialRef::Name(name) => {
            registry
                .id_of(name)
                .ok_or_else(|| ConfigError::UnknownMaterialName {
                    rule: rule.to_string(),
                    name: name.clone(),
                })
        }
    }
}

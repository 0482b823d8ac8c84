//! Material definitions, the registry that owns them, and per-tile instances

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Built-in material IDs (registration order of [`MaterialRegistry::with_defaults`])
pub struct MaterialId;

impl MaterialId {
    pub const AIR: u16 = 0;
    pub const STONE: u16 = 1;
    pub const DIRT: u16 = 2;
    pub const SAND: u16 = 3;
    pub const WATER: u16 = 4;
    pub const STEAM: u16 = 5;
    pub const LAVA: u16 = 6;
    pub const OBSIDIAN: u16 = 7;
    pub const BEDROCK: u16 = 8;
    pub const WOOD: u16 = 9;
    pub const LEAVES: u16 = 10;
    pub const FIRE: u16 = 11;
    pub const SMOKE: u16 = 12;
    pub const ICE: u16 = 13;
    pub const COBBLE_STONE: u16 = 14;
    pub const COBBLE_DIRT: u16 = 15;
    pub const IRON_ORE: u16 = 16;
    pub const GOLD_ORE: u16 = 17;
    pub const COAL_ORE: u16 = 18;
    pub const OBJECT: u16 = 19;
}

/// How a material behaves in the automaton
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicsClass {
    /// Empty space
    Air,
    /// Never moves (stone, wood)
    Solid,
    /// Falls and piles up
    Sand,
    /// Falls and flows sideways
    Soup,
    /// Rises
    Gas,
    /// Stamped by a pixel object; the automaton neither moves nor displaces it
    Object,
    /// Decoration that movers may push through (leaves)
    Passable,
}

impl PhysicsClass {
    /// Classes the automaton moves or lets others displace
    pub fn is_movable(self) -> bool {
        matches!(
            self,
            PhysicsClass::Sand | PhysicsClass::Soup | PhysicsClass::Gas | PhysicsClass::Passable
        )
    }

    /// Index into per-class counters
    pub fn index(self) -> usize {
        self as usize
    }

    pub const ALL: [PhysicsClass; 7] = [
        PhysicsClass::Air,
        PhysicsClass::Solid,
        PhysicsClass::Sand,
        PhysicsClass::Soup,
        PhysicsClass::Gas,
        PhysicsClass::Object,
        PhysicsClass::Passable,
    ];
}

/// Light emitted by a material
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub intensity: f32,
    /// RGBA, 0xRRGGBBAA
    pub color: u32,
}

impl Emission {
    pub const NONE: Emission = Emission {
        intensity: 0.0,
        color: 0,
    };
}

/// Definition of a material's properties
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterialDefinition {
    /// Assigned by the registry at registration
    pub id: u16,
    pub name: String,
    pub physics_class: PhysicsClass,

    /// Base color (RGBA, 0xRRGGBBAA)
    pub color: u32,
    pub alpha: u8,

    /// Heavier materials sink through lighter movable ones
    pub density: f32,
    /// Sliding tendency of powders (0.0 - 1.0)
    pub slipperiness: f32,
    /// Sideways steps a liquid may take per tick
    pub iteration_budget: u8,

    pub emission: Emission,

    // Thermal properties
    /// How strongly a tile pulls toward its neighbors' temperature (0.0 - 1.0)
    pub conduction_self: f32,
    /// How strongly a tile pushes its temperature onto neighbors
    pub conduction_other: f32,
    /// Temperature a fresh tile starts at
    pub default_temperature: i32,
    /// Heat added every diffusion step (fire keeps burning hot)
    pub add_temperature: i32,
}

impl Default for MaterialDefinition {
    fn default() -> Self {
        Self {
            id: 0,
            name: "unknown".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0xff00ffff, // Magenta for missing materials
            alpha: 255,
            density: 1.0,
            slipperiness: 0.0,
            iteration_budget: 1,
            emission: Emission::NONE,
            conduction_self: 1.0,
            conduction_other: 1.0,
            default_temperature: 0,
            add_temperature: 0,
        }
    }
}

/// Process-wide tile identity counter
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// One grid cell: a material reference plus per-instance color and temperature
#[derive(Clone, Copy, Debug)]
pub struct MaterialInstance {
    /// Monotonic identity, not persisted
    pub uid: u64,
    pub material: u16,
    /// RGBA, 0xRRGGBBAA
    pub color: u32,
    pub temperature: i32,
}

impl MaterialInstance {
    pub fn new(material: u16, color: u32, temperature: i32) -> Self {
        Self {
            uid: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            material,
            color,
            temperature,
        }
    }

    /// Fresh air tile
    pub fn air() -> Self {
        Self::new(MaterialId::AIR, 0, 0)
    }

    /// Material, color and temperature match (identity ignored)
    pub fn same_contents(&self, other: &MaterialInstance) -> bool {
        self.material == other.material
            && self.color == other.color
            && self.temperature == other.temperature
    }
}

impl PartialEq for MaterialInstance {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for MaterialInstance {}

/// Registry of all materials
///
/// Built once at startup, then shared read-only (`Arc`) by every thread.
pub struct MaterialRegistry {
    materials: Vec<MaterialDefinition>,
    names: HashMap<String, u16>,
}

impl MaterialRegistry {
    /// Registry holding only air at id 0
    pub fn new() -> Self {
        let mut registry = Self {
            materials: Vec::new(),
            names: HashMap::new(),
        };
        registry.register_builtin(MaterialDefinition {
            name: "air".to_string(),
            physics_class: PhysicsClass::Air,
            color: 0x00000000,
            alpha: 0,
            density: 0.0,
            conduction_self: 0.0,
            conduction_other: 0.0,
            ..Default::default()
        });
        registry
    }

    /// Registry with the built-in catalogue
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_defaults();
        debug_assert_eq!(registry.len(), MaterialId::OBJECT as usize + 1);
        registry
    }

    fn register_defaults(&mut self) {
        self.register_builtin(MaterialDefinition {
            name: "stone".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x808080ff,
            density: 2.5,
            conduction_self: 0.6,
            conduction_other: 0.4,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "dirt".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x7a5230ff,
            density: 1.6,
            conduction_self: 0.4,
            conduction_other: 0.3,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "sand".to_string(),
            physics_class: PhysicsClass::Sand,
            color: 0xc2b280ff,
            density: 1.5,
            slipperiness: 0.3,
            conduction_self: 0.5,
            conduction_other: 0.5,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "water".to_string(),
            physics_class: PhysicsClass::Soup,
            color: 0x40a4dfc8,
            alpha: 200,
            density: 1.0,
            iteration_budget: 4,
            conduction_self: 0.9,
            conduction_other: 0.8,
            default_temperature: 20,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "steam".to_string(),
            physics_class: PhysicsClass::Gas,
            color: 0xc8c8c864,
            alpha: 100,
            density: 0.0006,
            conduction_self: 0.5,
            conduction_other: 0.6,
            default_temperature: 160,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "lava".to_string(),
            physics_class: PhysicsClass::Soup,
            color: 0xff5000ff,
            density: 3.0,
            iteration_budget: 1, // Very viscous
            emission: Emission {
                intensity: 1.0,
                color: 0xff7a20ff,
            },
            conduction_self: 0.5,
            conduction_other: 0.7,
            default_temperature: 1000,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "obsidian".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x1e1428ff,
            density: 2.6,
            conduction_self: 0.5,
            conduction_other: 0.5,
            default_temperature: 300,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "bedrock".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x202020ff,
            density: 100.0,
            conduction_self: 0.0,
            conduction_other: 0.0,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "wood".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x8b5a2bff,
            density: 0.6,
            conduction_self: 0.2,
            conduction_other: 0.2,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "leaves".to_string(),
            physics_class: PhysicsClass::Passable,
            color: 0x2f8f2fe0,
            alpha: 224,
            density: 0.3,
            conduction_self: 0.2,
            conduction_other: 0.2,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "fire".to_string(),
            physics_class: PhysicsClass::Gas,
            color: 0xff6400ff,
            density: 0.0001,
            emission: Emission {
                intensity: 0.8,
                color: 0xffa040ff,
            },
            conduction_self: 0.3,
            conduction_other: 0.9,
            default_temperature: 700,
            add_temperature: -8,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "smoke".to_string(),
            physics_class: PhysicsClass::Gas,
            color: 0x3c3c3c96,
            alpha: 150,
            density: 0.001,
            conduction_self: 0.3,
            conduction_other: 0.3,
            default_temperature: 40,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "ice".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0xa5f2f3ff,
            density: 0.92,
            slipperiness: 0.9,
            conduction_self: 0.8,
            conduction_other: 0.6,
            default_temperature: -32,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "cobble_stone".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x6e6e6eff,
            density: 2.4,
            conduction_self: 0.6,
            conduction_other: 0.4,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "cobble_dirt".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x5e3f24ff,
            density: 1.7,
            conduction_self: 0.4,
            conduction_other: 0.3,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "iron_ore".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x9c7a64ff,
            density: 4.0,
            conduction_self: 0.7,
            conduction_other: 0.6,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "gold_ore".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0xd4af37ff,
            density: 5.0,
            conduction_self: 0.7,
            conduction_other: 0.6,
            ..Default::default()
        });

        self.register_builtin(MaterialDefinition {
            name: "coal_ore".to_string(),
            physics_class: PhysicsClass::Solid,
            color: 0x2a2a2aff,
            density: 1.4,
            conduction_self: 0.3,
            conduction_other: 0.3,
            ..Default::default()
        });

        // Per-pixel color comes from the object
        self.register_builtin(MaterialDefinition {
            name: "object".to_string(),
            physics_class: PhysicsClass::Object,
            color: 0xb0b0b0ff,
            density: 2.0,
            conduction_self: 0.3,
            conduction_other: 0.3,
            ..Default::default()
        });
    }

    /// Register a material, returning its stable id
    ///
    /// Names are unique; ids run out at `u16::MAX`.
    pub fn register(&mut self, mut material: MaterialDefinition) -> Result<u16, ConfigError> {
        if self.names.contains_key(&material.name) {
            return Err(ConfigError::DuplicateMaterial(material.name));
        }
        let id = u16::try_from(self.materials.len())
            .ok()
            .filter(|id| *id < u16::MAX)
            .ok_or(ConfigError::RegistryFull(self.materials.len()))?;

        material.id = id;
        self.names.insert(material.name.clone(), id);
        self.materials.push(material);
        Ok(id)
    }

    fn register_builtin(&mut self, material: MaterialDefinition) {
        if let Err(e) = self.register(material) {
            log::error!("Built-in material rejected: {}", e);
        }
    }

    /// Get material definition by ID
    #[inline]
    pub fn get(&self, id: u16) -> &MaterialDefinition {
        debug_assert!((id as usize) < self.materials.len(), "unregistered material {}", id);
        self.materials
            .get(id as usize)
            .unwrap_or(&self.materials[MaterialId::AIR as usize])
    }

    pub fn try_get(&self, id: u16) -> Option<&MaterialDefinition> {
        self.materials.get(id as usize)
    }

    pub fn contains(&self, id: u16) -> bool {
        (id as usize) < self.materials.len()
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.names.get(name).copied()
    }

    #[inline]
    pub fn physics_class(&self, id: u16) -> PhysicsClass {
        self.get(id).physics_class
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterialDefinition> {
        self.materials.iter()
    }

    /// New tile of the given material with its base color and default temperature
    pub fn instance(&self, id: u16) -> MaterialInstance {
        let material = self.get(id);
        MaterialInstance::new(id, material.color, material.default_temperature)
    }
}

impl Default for MaterialRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

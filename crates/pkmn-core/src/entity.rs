use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{content_hash, EntityKind, SnapshotDraft, SnapshotTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: u32,
}

impl EntityKey {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.kind.resource(), self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.resource(), self.id)
    }
}

/// Damage relations of an attacking type, each list sorted by type name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DamageRelations {
    pub double_damage_to: Vec<String>,
    pub half_damage_to: Vec<String>,
    pub no_damage_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAttributes {
    pub id: u32,
    pub name: String,
    pub damage_relations: DamageRelations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityAttributes {
    pub id: u32,
    pub slug: String,
    pub name: String,
    pub effect: String,
    pub short_effect: String,
    pub flavor_text: String,
    pub is_main_series: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatValue {
    pub stat_name: String,
    pub base_value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSlot {
    pub slot: u32,
    pub type_id: u32,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilitySlot {
    pub slot: u32,
    pub ability_id: u32,
    pub ability_name: String,
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveLearn {
    pub move_id: u32,
    pub move_name: String,
    pub level_learned_at: u32,
    pub learn_method: String,
    pub version_group: String,
}

/// Canonical Pokémon record. Collections are kept in a fixed order (stats by name,
/// slots by slot number, moves by id) so the content hash does not depend on upstream
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokemonAttributes {
    pub id: u32,
    pub name: String,
    pub height: u32,
    pub weight: u32,
    pub base_experience: Option<u32>,
    pub is_default: bool,
    pub order: Option<i64>,
    pub stats: Vec<StatValue>,
    pub types: Vec<TypeSlot>,
    pub abilities: Vec<AbilitySlot>,
    pub moves: Vec<MoveLearn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityAttributes {
    Type(TypeAttributes),
    Ability(AbilityAttributes),
    Pokemon(PokemonAttributes),
}

impl EntityAttributes {
    pub fn key(&self) -> EntityKey {
        match self {
            EntityAttributes::Type(t) => EntityKey {
                kind: EntityKind::Type,
                id: t.id,
            },
            EntityAttributes::Ability(a) => EntityKey {
                kind: EntityKind::Ability,
                id: a.id,
            },
            EntityAttributes::Pokemon(p) => EntityKey {
                kind: EntityKind::Pokemon,
                id: p.id,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EntityAttributes::Type(t) => &t.name,
            EntityAttributes::Ability(a) => &a.slug,
            EntityAttributes::Pokemon(p) => &p.name,
        }
    }
}

/// Normalized entity plus the digest of its attributes.
///
/// The hash is computed on construction and the attributes are not reachable mutably,
/// so the two cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEntity {
    key: EntityKey,
    attributes: EntityAttributes,
    content_hash: String,
}

impl NormalizedEntity {
    pub fn new(attributes: EntityAttributes) -> Self {
        Self {
            key: attributes.key(),
            content_hash: content_hash(&attributes),
            attributes,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn attributes(&self) -> &EntityAttributes {
        &self.attributes
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn into_attributes(self) -> EntityAttributes {
        self.attributes
    }

    pub fn to_snapshot_draft(&self) -> SnapshotDraft {
        SnapshotDraft {
            table: SnapshotTable::Entities,
            identity: self.key.identity(),
            content_hash: self.content_hash.clone(),
            payload: serde_json::to_value(&self.attributes)
                .expect("entity attributes always serialize to JSON"),
        }
    }
}

/// One cell of the attacking x defending type matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessCell {
    pub attacking: String,
    pub defending: String,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffenseProfile {
    pub avg_effectiveness: f64,
    pub super_effective_count: u32,
    pub no_effect_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseProfile {
    pub avg_effectiveness_against: f64,
    pub weaknesses_count: u32,
    pub resistances_count: u32,
    pub immunities_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeProfile {
    pub type_name: String,
    pub offense: OffenseProfile,
    pub defense: DefenseProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "aggregate", rename_all = "snake_case")]
pub enum AggregatePayload {
    Effectiveness(EffectivenessCell),
    TypeProfile(TypeProfile),
}

impl AggregatePayload {
    /// Stable identity, e.g. `type-effectiveness/fire/grass` or `type-profile/fire`.
    pub fn key(&self) -> String {
        match self {
            AggregatePayload::Effectiveness(cell) => {
                format!("type-effectiveness/{}/{}", cell.attacking, cell.defending)
            }
            AggregatePayload::TypeProfile(profile) => format!("type-profile/{}", profile.type_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAggregate {
    key: String,
    payload: AggregatePayload,
    content_hash: String,
}

impl DerivedAggregate {
    pub fn new(payload: AggregatePayload) -> Self {
        Self {
            key: payload.key(),
            content_hash: content_hash(&payload),
            payload,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &AggregatePayload {
        &self.payload
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn to_snapshot_draft(&self) -> SnapshotDraft {
        SnapshotDraft {
            table: SnapshotTable::Aggregates,
            identity: self.key.clone(),
            content_hash: self.content_hash.clone(),
            payload: serde_json::to_value(&self.payload)
                .expect("aggregate payloads always serialize to JSON"),
        }
    }
}

use pkmn_core::{
    AbilityAttributes, AbilitySlot, DamageRelations, EntityAttributes, EntityKind, MoveLearn,
    NormalizedEntity, PokemonAttributes, RawRecord, StatValue, TypeAttributes,
    TypeSlot, WorkTarget,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::{id_from_resource_url, MalformedRecordError};

/// Version groups whose learnsets are kept, newest first. The first matching detail of
/// each move wins.
pub const PREFERRED_VERSION_GROUPS: [&str; 3] = ["sword-shield", "sun-moon", "x-y"];

const ENGLISH: &str = "en";

pub fn normalize(record: &RawRecord) -> Result<NormalizedEntity, MalformedRecordError> {
    let expected = match record.work_item.target() {
        WorkTarget::Entity(key) => *key,
        WorkTarget::Page { .. } => {
            return Err(MalformedRecordError::NotAnEntity(record.work_item.label()))
        }
    };

    let attributes = match expected.kind {
        EntityKind::Type => EntityAttributes::Type(normalize_type(parse(&record.body)?)?),
        EntityKind::Ability => EntityAttributes::Ability(normalize_ability(parse(&record.body)?)?),
        EntityKind::Pokemon => EntityAttributes::Pokemon(normalize_pokemon(parse(&record.body)?)?),
    };

    let found = attributes.key();
    if found != expected {
        return Err(MalformedRecordError::IdentityMismatch { expected, found });
    }

    let entity = NormalizedEntity::new(attributes);
    debug!(entity = %entity.key(), name = entity.attributes().name(), "normalized");
    Ok(entity)
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, MalformedRecordError> {
    Ok(serde_json::from_slice(body)?)
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, MalformedRecordError> {
    value.ok_or_else(|| MalformedRecordError::MissingField(field.to_string()))
}

fn positive_id(value: Option<i64>, field: &str) -> Result<u32, MalformedRecordError> {
    let value = required(value, field)?;
    match u32::try_from(value) {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(MalformedRecordError::OutOfRange {
            field: field.to_string(),
            value,
        }),
    }
}

fn non_negative(value: i64, field: &str) -> Result<u32, MalformedRecordError> {
    u32::try_from(value).map_err(|_| MalformedRecordError::OutOfRange {
        field: field.to_string(),
        value,
    })
}

fn slot(value: i64, field: &str) -> Result<u32, MalformedRecordError> {
    match u32::try_from(value) {
        Ok(slot) if slot >= 1 => Ok(slot),
        _ => Err(MalformedRecordError::OutOfRange {
            field: field.to_string(),
            value,
        }),
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, MalformedRecordError> {
    let value = required(value, field)?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MalformedRecordError::MissingField(field.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Flavor text arrives with hard line breaks and form feeds from the game cartridges.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Deserialize)]
struct NamedResource {
    name: Option<String>,
    url: Option<String>,
}

impl NamedResource {
    fn name(&self, field: &str) -> Result<String, MalformedRecordError> {
        required(self.name.clone(), field)
    }

    fn id(&self, field: &str) -> Result<u32, MalformedRecordError> {
        id_from_resource_url(self.url.as_deref().ok_or_else(|| {
            MalformedRecordError::MissingField(format!("{field}.url"))
        })?)
    }

    fn is_language(&self, code: &str) -> bool {
        self.name.as_deref() == Some(code)
    }
}

#[derive(Deserialize)]
struct RawType {
    id: Option<i64>,
    name: Option<String>,
    damage_relations: Option<RawDamageRelations>,
}

#[derive(Deserialize)]
struct RawDamageRelations {
    #[serde(default)]
    double_damage_to: Vec<NamedResource>,
    #[serde(default)]
    half_damage_to: Vec<NamedResource>,
    #[serde(default)]
    no_damage_to: Vec<NamedResource>,
}

fn type_names(targets: &[NamedResource], field: &str) -> Result<Vec<String>, MalformedRecordError> {
    let mut names = targets
        .iter()
        .map(|t| t.name(field))
        .collect::<Result<Vec<_>, _>>()?;
    names.sort();
    names.dedup();
    Ok(names)
}

fn normalize_type(raw: RawType) -> Result<TypeAttributes, MalformedRecordError> {
    let relations = required(raw.damage_relations, "damage_relations")?;
    Ok(TypeAttributes {
        id: positive_id(raw.id, "id")?,
        name: non_empty(raw.name, "name")?,
        damage_relations: DamageRelations {
            double_damage_to: type_names(&relations.double_damage_to, "double_damage_to")?,
            half_damage_to: type_names(&relations.half_damage_to, "half_damage_to")?,
            no_damage_to: type_names(&relations.no_damage_to, "no_damage_to")?,
        },
    })
}

#[derive(Deserialize)]
struct RawAbility {
    id: Option<i64>,
    name: Option<String>,
    is_main_series: Option<bool>,
    #[serde(default)]
    names: Vec<RawLocalizedName>,
    #[serde(default)]
    effect_entries: Vec<RawEffectEntry>,
    #[serde(default)]
    flavor_text_entries: Vec<RawFlavorText>,
}

#[derive(Deserialize)]
struct RawLocalizedName {
    name: String,
    language: NamedResource,
}

#[derive(Deserialize)]
struct RawEffectEntry {
    effect: String,
    #[serde(default)]
    short_effect: String,
    language: NamedResource,
}

#[derive(Deserialize)]
struct RawFlavorText {
    flavor_text: String,
    language: NamedResource,
}

fn normalize_ability(raw: RawAbility) -> Result<AbilityAttributes, MalformedRecordError> {
    let slug = non_empty(raw.name, "name")?;
    let name = raw
        .names
        .iter()
        .find(|n| n.language.is_language(ENGLISH))
        .map(|n| n.name.clone())
        .unwrap_or_else(|| slug.clone());
    let effect = raw
        .effect_entries
        .iter()
        .find(|e| e.language.is_language(ENGLISH));
    let flavor_text = raw
        .flavor_text_entries
        .iter()
        .find(|f| f.language.is_language(ENGLISH))
        .map(|f| collapse_whitespace(&f.flavor_text))
        .unwrap_or_default();

    Ok(AbilityAttributes {
        id: positive_id(raw.id, "id")?,
        slug,
        name,
        effect: effect.map(|e| collapse_whitespace(&e.effect)).unwrap_or_default(),
        short_effect: effect
            .map(|e| collapse_whitespace(&e.short_effect))
            .unwrap_or_default(),
        flavor_text,
        is_main_series: required(raw.is_main_series, "is_main_series")?,
    })
}

#[derive(Deserialize)]
struct RawPokemon {
    id: Option<i64>,
    name: Option<String>,
    height: Option<i64>,
    weight: Option<i64>,
    base_experience: Option<i64>,
    is_default: Option<bool>,
    order: Option<i64>,
    #[serde(default)]
    stats: Vec<RawStat>,
    #[serde(default)]
    types: Vec<RawTypeSlot>,
    #[serde(default)]
    abilities: Vec<RawAbilitySlot>,
    #[serde(default)]
    moves: Vec<RawMove>,
}

#[derive(Deserialize)]
struct RawStat {
    base_stat: i64,
    stat: NamedResource,
}

#[derive(Deserialize)]
struct RawTypeSlot {
    slot: i64,
    #[serde(rename = "type")]
    type_: NamedResource,
}

#[derive(Deserialize)]
struct RawAbilitySlot {
    slot: i64,
    #[serde(default)]
    is_hidden: bool,
    ability: NamedResource,
}

#[derive(Deserialize)]
struct RawMove {
    #[serde(rename = "move")]
    move_: NamedResource,
    #[serde(default)]
    version_group_details: Vec<RawVersionGroupDetail>,
}

#[derive(Deserialize)]
struct RawVersionGroupDetail {
    level_learned_at: i64,
    move_learn_method: NamedResource,
    version_group: NamedResource,
}

fn normalize_pokemon(raw: RawPokemon) -> Result<PokemonAttributes, MalformedRecordError> {
    let mut stats = raw
        .stats
        .iter()
        .map(|s| {
            Ok(StatValue {
                stat_name: s.stat.name("stats[].stat.name")?,
                base_value: non_negative(s.base_stat, "stats[].base_stat")?,
            })
        })
        .collect::<Result<Vec<_>, MalformedRecordError>>()?;
    stats.sort_by(|a, b| a.stat_name.cmp(&b.stat_name));

    let mut types = raw
        .types
        .iter()
        .map(|t| {
            Ok(TypeSlot {
                slot: slot(t.slot, "types[].slot")?,
                type_id: t.type_.id("types[].type")?,
                type_name: t.type_.name("types[].type.name")?,
            })
        })
        .collect::<Result<Vec<_>, MalformedRecordError>>()?;
    types.sort_by_key(|t| t.slot);

    let mut abilities = raw
        .abilities
        .iter()
        .map(|a| {
            Ok(AbilitySlot {
                slot: slot(a.slot, "abilities[].slot")?,
                ability_id: a.ability.id("abilities[].ability")?,
                ability_name: a.ability.name("abilities[].ability.name")?,
                is_hidden: a.is_hidden,
            })
        })
        .collect::<Result<Vec<_>, MalformedRecordError>>()?;
    abilities.sort_by_key(|a| a.slot);

    let mut moves = Vec::new();
    for entry in &raw.moves {
        let Some(detail) = entry.version_group_details.iter().find(|d| {
            d.version_group
                .name
                .as_deref()
                .is_some_and(|vg| PREFERRED_VERSION_GROUPS.contains(&vg))
        }) else {
            continue;
        };
        moves.push(MoveLearn {
            move_id: entry.move_.id("moves[].move")?,
            move_name: entry.move_.name("moves[].move.name")?,
            level_learned_at: non_negative(detail.level_learned_at, "moves[].level_learned_at")?,
            learn_method: detail.move_learn_method.name("moves[].move_learn_method.name")?,
            version_group: detail.version_group.name("moves[].version_group.name")?,
        });
    }
    moves.sort_by_key(|m| m.move_id);

    Ok(PokemonAttributes {
        id: positive_id(raw.id, "id")?,
        name: non_empty(raw.name, "name")?,
        height: non_negative(required(raw.height, "height")?, "height")?,
        weight: non_negative(required(raw.weight, "weight")?, "weight")?,
        base_experience: raw
            .base_experience
            .map(|xp| non_negative(xp, "base_experience"))
            .transpose()?,
        is_default: required(raw.is_default, "is_default")?,
        order: raw.order,
        stats,
        types,
        abilities,
        moves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pkmn_core::{FetchSource, WorkItem};

    const PIKACHU: &str = include_str!("../../../fixtures/pokeapi/pokemon-pikachu.json");
    const FIRE: &str = include_str!("../../../fixtures/pokeapi/type-fire.json");
    const STATIC: &str = include_str!("../../../fixtures/pokeapi/ability-static.json");

    fn record(kind: EntityKind, id: u32, body: &str) -> RawRecord {
        RawRecord {
            work_item: WorkItem::entity(kind, id),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
            source: FetchSource::Network,
        }
    }

    fn with_field(body: &str, field: &str, value: serde_json::Value) -> String {
        let mut json: serde_json::Value = serde_json::from_str(body).unwrap();
        json[field] = value;
        json.to_string()
    }

    fn without_field(body: &str, field: &str) -> String {
        let mut json: serde_json::Value = serde_json::from_str(body).unwrap();
        json.as_object_mut().unwrap().remove(field);
        json.to_string()
    }

    #[test]
    fn pokemon_payload_is_normalized_in_canonical_order() {
        let entity = normalize(&record(EntityKind::Pokemon, 25, PIKACHU)).expect("valid pokemon");
        let EntityAttributes::Pokemon(p) = entity.attributes() else {
            panic!("expected pokemon attributes");
        };

        assert_eq!(p.name, "pikachu");
        assert_eq!((p.height, p.weight, p.base_experience), (4, 60, Some(112)));
        assert_eq!(
            p.stats.iter().map(|s| s.stat_name.as_str()).collect::<Vec<_>>(),
            vec!["attack", "hp", "speed"]
        );
        assert_eq!(p.types[0].type_id, 13);
        assert_eq!(
            p.abilities.iter().map(|a| (a.slot, a.ability_id)).collect::<Vec<_>>(),
            vec![(1, 9), (3, 31)]
        );
        assert_eq!(
            p.moves
                .iter()
                .map(|m| (m.move_id, m.version_group.as_str()))
                .collect::<Vec<_>>(),
            vec![(84, "sun-moon"), (85, "x-y")]
        );
    }

    #[test]
    fn type_relations_are_sorted_names() {
        let entity = normalize(&record(EntityKind::Type, 10, FIRE)).expect("valid type");
        let EntityAttributes::Type(t) = entity.attributes() else {
            panic!("expected type attributes");
        };
        assert_eq!(t.damage_relations.double_damage_to, vec!["bug", "grass", "ice", "steel"]);
        assert_eq!(t.damage_relations.half_damage_to, vec!["dragon", "fire", "rock", "water"]);
        assert!(t.damage_relations.no_damage_to.is_empty());
    }

    #[test]
    fn ability_prefers_english_texts() {
        let entity = normalize(&record(EntityKind::Ability, 9, STATIC)).expect("valid ability");
        let EntityAttributes::Ability(a) = entity.attributes() else {
            panic!("expected ability attributes");
        };
        assert_eq!(a.slug, "static");
        assert_eq!(a.name, "Static");
        assert_eq!(a.flavor_text, "Paralyzes on contact in some cases.");
        assert!(a.short_effect.starts_with("Has a 30% chance"));
        assert!(a.is_main_series);
    }

    #[test]
    fn ability_name_falls_back_to_slug() {
        let body = with_field(STATIC, "names", serde_json::json!([]));
        let entity = normalize(&record(EntityKind::Ability, 9, &body)).expect("valid ability");
        assert_eq!(entity.attributes().name(), "static");
        let EntityAttributes::Ability(a) = entity.attributes() else {
            panic!("expected ability attributes");
        };
        assert_eq!(a.name, "static");
    }

    #[test]
    fn same_payload_normalizes_to_the_same_hash() {
        let a = normalize(&record(EntityKind::Pokemon, 25, PIKACHU)).unwrap();
        let b = normalize(&record(EntityKind::Pokemon, 25, PIKACHU)).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let heavier = with_field(PIKACHU, "weight", serde_json::json!(61));
        let c = normalize(&record(EntityKind::Pokemon, 25, &heavier)).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        for field in ["id", "name", "height", "weight", "is_default"] {
            let body = without_field(PIKACHU, field);
            assert_eq!(
                normalize(&record(EntityKind::Pokemon, 25, &body)),
                Err(MalformedRecordError::MissingField(field.to_string())),
                "{field}"
            );
        }
        let body = without_field(FIRE, "damage_relations");
        assert!(normalize(&record(EntityKind::Type, 10, &body)).is_err());
    }

    #[test]
    fn negative_magnitudes_are_out_of_range() {
        let body = with_field(PIKACHU, "height", serde_json::json!(-4));
        assert_eq!(
            normalize(&record(EntityKind::Pokemon, 25, &body)),
            Err(MalformedRecordError::OutOfRange {
                field: "height".into(),
                value: -4
            })
        );

        let mut json: serde_json::Value = serde_json::from_str(PIKACHU).unwrap();
        json["stats"][0]["base_stat"] = serde_json::json!(-1);
        assert!(matches!(
            normalize(&record(EntityKind::Pokemon, 25, &json.to_string())),
            Err(MalformedRecordError::OutOfRange { .. })
        ));

        let body = with_field(PIKACHU, "id", serde_json::json!(0));
        assert!(matches!(
            normalize(&record(EntityKind::Pokemon, 25, &body)),
            Err(MalformedRecordError::OutOfRange { .. })
        ));
    }

    #[test]
    fn payload_for_another_entity_is_rejected() {
        let err = normalize(&record(EntityKind::Pokemon, 26, PIKACHU)).unwrap_err();
        assert!(matches!(err, MalformedRecordError::IdentityMismatch { .. }));
    }

    #[test]
    fn page_items_are_not_entities() {
        let mut raw = record(EntityKind::Type, 1, FIRE);
        raw.work_item = WorkItem::first_page(EntityKind::Type, 20);
        assert!(matches!(normalize(&raw), Err(MalformedRecordError::NotAnEntity(_))));
    }
}

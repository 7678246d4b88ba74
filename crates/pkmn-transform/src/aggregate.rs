use std::collections::BTreeMap;

use pkmn_core::{
    AggregatePayload, DamageRelations, DefenseProfile, DerivedAggregate, EffectivenessCell,
    EntityAttributes, NormalizedEntity, OffenseProfile, TypeProfile,
};

pub type EffectivenessMatrix = BTreeMap<(String, String), f64>;

/// Full attacking x defending matrix over the given types.
///
/// Pairs without a relation are neutral (1.0). Relations are applied as no damage, then
/// half, then double, so a later list wins when the upstream lists a pair twice.
/// Relations naming a type outside `types` are ignored.
pub fn effectiveness_matrix(types: &BTreeMap<String, DamageRelations>) -> EffectivenessMatrix {
    let mut matrix = EffectivenessMatrix::new();
    for attacking in types.keys() {
        for defending in types.keys() {
            matrix.insert((attacking.clone(), defending.clone()), 1.0);
        }
    }

    for (attacking, relations) in types {
        let tiers = [
            (&relations.no_damage_to, 0.0),
            (&relations.half_damage_to, 0.5),
            (&relations.double_damage_to, 2.0),
        ];
        for (targets, multiplier) in tiers {
            for defending in targets {
                if let Some(cell) = matrix.get_mut(&(attacking.clone(), defending.clone())) {
                    *cell = multiplier;
                }
            }
        }
    }
    matrix
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn count(values: &[f64], pred: impl Fn(f64) -> bool) -> u32 {
    values.iter().filter(|v| pred(**v)).count() as u32
}

fn profile(name: &str, matrix: &EffectivenessMatrix) -> TypeProfile {
    let dealt: Vec<f64> = matrix
        .iter()
        .filter(|((attacking, _), _)| attacking == name)
        .map(|(_, m)| *m)
        .collect();
    let taken: Vec<f64> = matrix
        .iter()
        .filter(|((_, defending), _)| defending == name)
        .map(|(_, m)| *m)
        .collect();

    TypeProfile {
        type_name: name.to_string(),
        offense: OffenseProfile {
            avg_effectiveness: round2(mean(&dealt)),
            super_effective_count: count(&dealt, |m| m > 1.0),
            no_effect_count: count(&dealt, |m| m == 0.0),
        },
        defense: DefenseProfile {
            avg_effectiveness_against: round2(mean(&taken)),
            weaknesses_count: count(&taken, |m| m > 1.0),
            resistances_count: count(&taken, |m| m < 1.0),
            immunities_count: count(&taken, |m| m == 0.0),
        },
    }
}

/// Recomputes every type aggregate from the Type entities in `entities`.
///
/// Output is sorted by aggregate key and depends only on the set of inputs, not their
/// order, so identical inputs produce identical hashes.
pub fn derive_aggregates(entities: &[NormalizedEntity]) -> Vec<DerivedAggregate> {
    let types: BTreeMap<String, DamageRelations> = entities
        .iter()
        .filter_map(|entity| match entity.attributes() {
            EntityAttributes::Type(t) => Some((t.name.clone(), t.damage_relations.clone())),
            _ => None,
        })
        .collect();

    let matrix = effectiveness_matrix(&types);

    let mut aggregates: Vec<DerivedAggregate> = matrix
        .iter()
        .map(|((attacking, defending), multiplier)| {
            DerivedAggregate::new(AggregatePayload::Effectiveness(EffectivenessCell {
                attacking: attacking.clone(),
                defending: defending.clone(),
                multiplier: *multiplier,
            }))
        })
        .collect();
    aggregates.extend(
        types
            .keys()
            .map(|name| DerivedAggregate::new(AggregatePayload::TypeProfile(profile(name, &matrix)))),
    );
    aggregates.sort_by(|a, b| a.key().cmp(b.key()));
    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkmn_core::TypeAttributes;

    fn type_entity(id: u32, name: &str, double: &[&str], half: &[&str], none: &[&str]) -> NormalizedEntity {
        let names = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        NormalizedEntity::new(EntityAttributes::Type(TypeAttributes {
            id,
            name: name.into(),
            damage_relations: DamageRelations {
                double_damage_to: names(double),
                half_damage_to: names(half),
                no_damage_to: names(none),
            },
        }))
    }

    fn sample() -> Vec<NormalizedEntity> {
        vec![
            type_entity(10, "fire", &["grass"], &["fire", "water"], &[]),
            type_entity(11, "water", &["fire"], &["grass", "water"], &[]),
            type_entity(12, "grass", &["water"], &["fire", "grass"], &[]),
            type_entity(1, "normal", &[], &[], &["ghost"]),
            type_entity(8, "ghost", &["ghost"], &[], &["normal"]),
        ]
    }

    fn cell(aggregates: &[DerivedAggregate], key: &str) -> f64 {
        match aggregates.iter().find(|a| a.key() == key).map(|a| a.payload()) {
            Some(AggregatePayload::Effectiveness(c)) => c.multiplier,
            other => panic!("no effectiveness cell {key}: {other:?}"),
        }
    }

    fn profile_of(aggregates: &[DerivedAggregate], name: &str) -> TypeProfile {
        let key = format!("type-profile/{name}");
        match aggregates.iter().find(|a| a.key() == key).map(|a| a.payload()) {
            Some(AggregatePayload::TypeProfile(p)) => p.clone(),
            other => panic!("no profile for {name}: {other:?}"),
        }
    }

    #[test]
    fn matrix_defaults_to_neutral_and_applies_relations() {
        let aggregates = derive_aggregates(&sample());
        assert_eq!(aggregates.len(), 5 * 5 + 5);
        assert_eq!(cell(&aggregates, "type-effectiveness/fire/grass"), 2.0);
        assert_eq!(cell(&aggregates, "type-effectiveness/fire/water"), 0.5);
        assert_eq!(cell(&aggregates, "type-effectiveness/normal/ghost"), 0.0);
        assert_eq!(cell(&aggregates, "type-effectiveness/normal/fire"), 1.0);
    }

    #[test]
    fn double_damage_overrides_earlier_relations() {
        let types = vec![
            type_entity(1, "a", &["b"], &["b"], &["b"]),
            type_entity(2, "b", &[], &[], &[]),
        ];
        let aggregates = derive_aggregates(&types);
        assert_eq!(cell(&aggregates, "type-effectiveness/a/b"), 2.0);
    }

    #[test]
    fn profiles_summarize_rows_and_columns() {
        let aggregates = derive_aggregates(&sample());

        let normal = profile_of(&aggregates, "normal");
        assert_eq!(normal.offense.no_effect_count, 1);
        assert_eq!(normal.offense.avg_effectiveness, 0.8);
        assert_eq!(normal.defense.immunities_count, 1);

        let fire = profile_of(&aggregates, "fire");
        assert_eq!(fire.offense.super_effective_count, 1);
        // Taken: fire 0.5, water 2.0, grass 0.5, normal 1.0, ghost 1.0.
        assert_eq!(fire.defense.weaknesses_count, 1);
        assert_eq!(fire.defense.resistances_count, 2);
        assert_eq!(fire.defense.avg_effectiveness_against, 1.0);
    }

    #[test]
    fn means_are_rounded_to_two_decimals() {
        let types = vec![
            type_entity(1, "a", &["b"], &[], &[]),
            type_entity(2, "b", &[], &[], &[]),
            type_entity(3, "c", &[], &[], &[]),
        ];
        let a = profile_of(&derive_aggregates(&types), "a");
        assert_eq!(a.offense.avg_effectiveness, 1.33);
    }

    #[test]
    fn derivation_is_deterministic_and_order_independent() {
        let first = derive_aggregates(&sample());
        let again = derive_aggregates(&sample());
        let mut reversed_input = sample();
        reversed_input.reverse();
        let reversed = derive_aggregates(&reversed_input);

        let bytes = |aggs: &[DerivedAggregate]| serde_json::to_vec(aggs).unwrap();
        assert_eq!(bytes(&first), bytes(&again));
        assert_eq!(bytes(&first), bytes(&reversed));
    }

    #[test]
    fn non_type_entities_and_unknown_targets_are_ignored() {
        let types = vec![type_entity(1, "a", &["missing"], &[], &[])];
        let aggregates = derive_aggregates(&types);
        assert_eq!(aggregates.len(), 2);
        assert_eq!(cell(&aggregates, "type-effectiveness/a/a"), 1.0);
        assert!(derive_aggregates(&[]).is_empty());
    }
}

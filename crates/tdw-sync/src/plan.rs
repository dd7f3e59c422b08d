//! Merge ordering derived from the warehouse foreign-key graph.

use std::collections::BTreeMap;

use serde::Serialize;
use tdw_core::EntityKind;
use thiserror::Error;

/// `child` stores a surrogate key of `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub child: EntityKind,
    pub parent: EntityKind,
}

const fn fk(child: EntityKind, parent: EntityKind) -> ForeignKey {
    ForeignKey { child, parent }
}

pub const WAREHOUSE_FOREIGN_KEYS: &[ForeignKey] = &[
    fk(EntityKind::Tariff, EntityKind::Provider),
    fk(EntityKind::Tariff, EntityKind::ConnectivityType),
    fk(EntityKind::Bonus, EntityKind::BonusDuration),
    fk(EntityKind::TariffBonusLink, EntityKind::Tariff),
    fk(EntityKind::TariffBonusLink, EntityKind::Bonus),
    fk(EntityKind::Offer, EntityKind::Address),
    fk(EntityKind::Offer, EntityKind::Tariff),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("foreign key {child} -> {parent} references an entity outside the plan")]
    UnknownEntity {
        child: EntityKind,
        parent: EntityKind,
    },
    #[error("entity {0} is declared twice")]
    DuplicateEntity(EntityKind),
    #[error("dependency cycle among {0:?}")]
    Cycle(Vec<EntityKind>),
    #[error("{child} is merged before its dependency {parent}")]
    OutOfOrder {
        child: EntityKind,
        parent: EntityKind,
    },
}

/// Order in which the merge steps run inside the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    steps: Vec<EntityKind>,
    foreign_keys: Vec<ForeignKey>,
}

impl MergePlan {
    /// The plan for the eight warehouse tables.
    pub fn warehouse() -> Result<Self, PlanError> {
        Self::derive(&EntityKind::ALL, WAREHOUSE_FOREIGN_KEYS)
    }

    /// Topologically sort `entities` so every parent precedes its children.
    /// Among steps that are ready at the same time, the earlier-declared one
    /// goes first, which keeps the order stable across runs.
    pub fn derive(entities: &[EntityKind], foreign_keys: &[ForeignKey]) -> Result<Self, PlanError> {
        let mut position = BTreeMap::new();
        for (idx, kind) in entities.iter().enumerate() {
            if position.insert(*kind, idx).is_some() {
                return Err(PlanError::DuplicateEntity(*kind));
            }
        }

        let mut pending_parents = vec![0usize; entities.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); entities.len()];
        for key in foreign_keys {
            let (Some(&child), Some(&parent)) = (position.get(&key.child), position.get(&key.parent))
            else {
                return Err(PlanError::UnknownEntity {
                    child: key.child,
                    parent: key.parent,
                });
            };
            pending_parents[child] += 1;
            children[parent].push(child);
        }

        let mut placed = vec![false; entities.len()];
        let mut steps = Vec::with_capacity(entities.len());
        while let Some(next) = (0..entities.len()).find(|&i| !placed[i] && pending_parents[i] == 0) {
            placed[next] = true;
            steps.push(entities[next]);
            for &child in &children[next] {
                pending_parents[child] -= 1;
            }
        }

        if steps.len() != entities.len() {
            let stuck = entities
                .iter()
                .zip(&placed)
                .filter(|(_, done)| !**done)
                .map(|(kind, _)| *kind)
                .collect();
            return Err(PlanError::Cycle(stuck));
        }

        Ok(Self {
            steps,
            foreign_keys: foreign_keys.to_vec(),
        })
    }

    /// A plan with a caller-chosen order; run `validate` before applying it.
    pub fn from_steps(steps: Vec<EntityKind>, foreign_keys: &[ForeignKey]) -> Self {
        Self {
            steps,
            foreign_keys: foreign_keys.to_vec(),
        }
    }

    pub fn steps(&self) -> &[EntityKind] {
        &self.steps
    }

    pub fn dependencies_of(&self, kind: EntityKind) -> impl Iterator<Item = EntityKind> + '_ {
        self.foreign_keys
            .iter()
            .filter(move |key| key.child == kind)
            .map(|key| key.parent)
    }

    /// Check that every step runs after all of its parents.
    pub fn validate(&self) -> Result<(), PlanError> {
        let position = self
            .steps
            .iter()
            .enumerate()
            .map(|(idx, kind)| (*kind, idx))
            .collect::<BTreeMap<_, _>>();
        if position.len() != self.steps.len() {
            let mut seen = std::collections::BTreeSet::new();
            if let Some(dup) = self.steps.iter().find(|kind| !seen.insert(**kind)) {
                return Err(PlanError::DuplicateEntity(*dup));
            }
        }
        for key in &self.foreign_keys {
            match (position.get(&key.child), position.get(&key.parent)) {
                (Some(child), Some(parent)) if parent < child => {}
                (Some(_), Some(_)) => {
                    return Err(PlanError::OutOfOrder {
                        child: key.child,
                        parent: key.parent,
                    })
                }
                _ => {
                    return Err(PlanError::UnknownEntity {
                        child: key.child,
                        parent: key.parent,
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EntityKind::*;

    #[test]
    fn warehouse_plan_is_the_canonical_order() {
        let plan = MergePlan::warehouse().unwrap();
        assert_eq!(
            plan.steps(),
            &[
                Address,
                Provider,
                ConnectivityType,
                Tariff,
                BonusDuration,
                Bonus,
                TariffBonusLink,
                Offer
            ]
        );
        plan.validate().unwrap();
    }

    #[test]
    fn declaration_order_does_not_break_dependencies() {
        let reversed = EntityKind::ALL.iter().rev().copied().collect::<Vec<_>>();
        let plan = MergePlan::derive(&reversed, WAREHOUSE_FOREIGN_KEYS).unwrap();
        plan.validate().unwrap();
        assert_eq!(plan.steps().len(), 8);
        let pos = |k| plan.steps().iter().position(|s| *s == k).unwrap();
        assert!(pos(Provider) < pos(Tariff));
        assert!(pos(BonusDuration) < pos(Bonus));
        assert!(pos(Bonus) < pos(TariffBonusLink));
        assert!(pos(Tariff) < pos(Offer));
    }

    #[test]
    fn dependencies_follow_the_declared_graph() {
        let plan = MergePlan::warehouse().unwrap();
        let mut deps = plan.dependencies_of(Offer).collect::<Vec<_>>();
        deps.sort();
        assert_eq!(deps, vec![Address, Tariff]);
        assert_eq!(plan.dependencies_of(Address).count(), 0);
    }

    #[test]
    fn cycles_are_rejected() {
        let keys = [fk(Tariff, Bonus), fk(Bonus, Tariff)];
        let err = MergePlan::derive(&[Tariff, Bonus, Address], &keys).unwrap_err();
        assert_eq!(err, PlanError::Cycle(vec![Tariff, Bonus]));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let err = MergePlan::derive(&[Tariff], &[fk(Tariff, Provider)]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownEntity { .. }));
    }

    #[test]
    fn hand_written_order_is_validated() {
        let plan = MergePlan::from_steps(
            vec![
                Address,
                Provider,
                Tariff,
                ConnectivityType,
                BonusDuration,
                Bonus,
                TariffBonusLink,
                Offer,
            ],
            WAREHOUSE_FOREIGN_KEYS,
        );
        assert_eq!(
            plan.validate(),
            Err(PlanError::OutOfOrder {
                child: Tariff,
                parent: ConnectivityType
            })
        );
    }
}

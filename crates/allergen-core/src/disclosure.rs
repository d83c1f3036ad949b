use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::catalog::AllergenKind;
use crate::{AllergenOverrideSet, Ingredient, IngredientId, Recipe, RecipeId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureSource {
    Inherited,
    Manual,
}

/// One disclosed allergen. Manual entries always carry a reason (possibly
/// empty); inherited entries never do.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DisclosureEntry {
    pub id: AllergenKind,
    pub label: String,
    pub source: DisclosureSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DisclosureEntry {
    #[must_use]
    pub fn inherited(id: AllergenKind) -> Self {
        Self {
            id,
            label: id.short_label().to_string(),
            source: DisclosureSource::Inherited,
            reason: None,
        }
    }

    #[must_use]
    pub fn manual(id: AllergenKind, reason: impl Into<String>) -> Self {
        Self {
            id,
            label: id.short_label().to_string(),
            source: DisclosureSource::Manual,
            reason: Some(reason.into()),
        }
    }

    /// Full catalog label, used in formal printed disclosures.
    #[must_use]
    pub fn full_label(&self) -> &'static str {
        self.id.label()
    }
}

/// Disclosure pair. The id sets of the two tiers are disjoint and each
/// sequence is sorted by label without duplicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AggregationResult {
    pub contains: Vec<DisclosureEntry>,
    pub may_contain: Vec<DisclosureEntry>,
}

impl AggregationResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contains.is_empty() && self.may_contain.is_empty()
    }

    pub fn contains_ids(&self) -> impl Iterator<Item = AllergenKind> + '_ {
        self.contains.iter().map(|entry| entry.id)
    }

    pub fn may_contain_ids(&self) -> impl Iterator<Item = AllergenKind> + '_ {
        self.may_contain.iter().map(|entry| entry.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureTier {
    Contains,
    MayContain,
}

impl DisclosureTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::MayContain => "may_contain",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contains" => Some(Self::Contains),
            "may_contain" => Some(Self::MayContain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IgnoredOverrideCause {
    AlreadyInheritedContains,
    AlreadyInheritedMayContain,
    SupersededByContains,
}

/// An override that did not produce a manual entry in the final disclosure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct IgnoredOverride {
    pub id: AllergenKind,
    pub tier: DisclosureTier,
    pub cause: IgnoredOverrideCause,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct OverrideResolution {
    pub inherited: AggregationResult,
    #[serde(rename = "final")]
    pub resolved: AggregationResult,
    #[serde(default)]
    pub ignored_overrides: Vec<IgnoredOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipeDisclosure {
    pub recipe_id: RecipeId,
    pub recipe_name: String,
    pub ingredient_names: Vec<String>,
    pub missing_ingredient_ids: Vec<IngredientId>,
    pub resolution: OverrideResolution,
}

fn sort_by_label(entries: &mut [DisclosureEntry]) {
    entries.sort_by_cached_key(|entry| (entry.label.to_lowercase(), entry.id));
}

/// Compute the ingredient-derived disclosure for a set of ingredients.
///
/// Every allergen declared as contained by any ingredient is disclosed as
/// `contains`; every other allergen flagged as a cross-contamination risk is
/// disclosed as `may_contain`. Entries are tagged [`DisclosureSource::Inherited`].
#[must_use]
pub fn aggregate<'a, I>(ingredients: I) -> AggregationResult
where
    I: IntoIterator<Item = &'a Ingredient>,
{
    let mut contains_ids = BTreeSet::new();
    let mut may_contain_ids = BTreeSet::new();
    for ingredient in ingredients {
        contains_ids.extend(ingredient.allergens.iter());
        may_contain_ids.extend(ingredient.may_contain.iter());
    }

    let mut contains =
        contains_ids.iter().copied().map(DisclosureEntry::inherited).collect::<Vec<_>>();
    let mut may_contain = may_contain_ids
        .difference(&contains_ids)
        .copied()
        .map(DisclosureEntry::inherited)
        .collect::<Vec<_>>();
    sort_by_label(&mut contains);
    sort_by_label(&mut may_contain);

    AggregationResult { contains, may_contain }
}

/// Layer a recipe's manual overrides over the inherited disclosure.
///
/// Overrides only add disclosures. An override already covered by the
/// inherited result, or outranked by a final `contains` entry, is left out of
/// the final disclosure and listed in `ignored_overrides`. Without overrides
/// the final disclosure equals the inherited one.
#[must_use]
pub fn resolve_with_overrides<'a, I>(
    ingredients: I,
    overrides: Option<&AllergenOverrideSet>,
) -> OverrideResolution
where
    I: IntoIterator<Item = &'a Ingredient>,
{
    let inherited = aggregate(ingredients);
    let Some(overrides) = overrides else {
        return OverrideResolution {
            resolved: inherited.clone(),
            inherited,
            ignored_overrides: Vec::new(),
        };
    };

    let inherited_contains = inherited.contains_ids().collect::<BTreeSet<_>>();
    let inherited_may_contain = inherited.may_contain_ids().collect::<BTreeSet<_>>();
    let mut ignored_overrides = Vec::new();

    let mut contains = inherited.contains.clone();
    for kind in &overrides.contains {
        if inherited_contains.contains(kind) {
            ignored_overrides.push(IgnoredOverride {
                id: *kind,
                tier: DisclosureTier::Contains,
                cause: IgnoredOverrideCause::AlreadyInheritedContains,
            });
        } else {
            contains.push(DisclosureEntry::manual(*kind, overrides.reason_for(*kind)));
        }
    }
    let final_contains = contains.iter().map(|entry| entry.id).collect::<BTreeSet<_>>();

    let mut may_contain = inherited
        .may_contain
        .iter()
        .filter(|entry| !final_contains.contains(&entry.id))
        .cloned()
        .collect::<Vec<_>>();
    for kind in &overrides.may_contain {
        let cause = if final_contains.contains(kind) {
            Some(IgnoredOverrideCause::SupersededByContains)
        } else if inherited_may_contain.contains(kind) {
            Some(IgnoredOverrideCause::AlreadyInheritedMayContain)
        } else {
            None
        };
        match cause {
            Some(cause) => ignored_overrides.push(IgnoredOverride {
                id: *kind,
                tier: DisclosureTier::MayContain,
                cause,
            }),
            None => may_contain.push(DisclosureEntry::manual(*kind, overrides.reason_for(*kind))),
        }
    }

    sort_by_label(&mut contains);
    sort_by_label(&mut may_contain);

    for ignored in &ignored_overrides {
        tracing::debug!(
            allergen = ignored.id.as_str(),
            tier = ?ignored.tier,
            cause = ?ignored.cause,
            "override left out of final disclosure"
        );
    }

    OverrideResolution {
        inherited,
        resolved: AggregationResult { contains, may_contain },
        ignored_overrides,
    }
}

/// Resolve a recipe's final disclosure against the supplied ingredients.
///
/// Lines referencing ingredients absent from `ingredients` are skipped and
/// reported in `missing_ingredient_ids`. An ingredient referenced by several
/// lines is named once.
#[must_use]
pub fn disclose_recipe(recipe: &Recipe, ingredients: &[Ingredient]) -> RecipeDisclosure {
    let by_id = ingredients
        .iter()
        .map(|ingredient| (ingredient.id, ingredient))
        .collect::<BTreeMap<_, _>>();

    let mut seen = BTreeSet::new();
    let mut used = Vec::new();
    let mut missing_ingredient_ids = Vec::new();
    for line in &recipe.ingredients {
        match by_id.get(&line.ingredient_id) {
            Some(ingredient) => {
                if seen.insert(ingredient.id) {
                    used.push(*ingredient);
                }
            }
            None => {
                if !missing_ingredient_ids.contains(&line.ingredient_id) {
                    missing_ingredient_ids.push(line.ingredient_id);
                }
            }
        }
    }

    RecipeDisclosure {
        recipe_id: recipe.id,
        recipe_name: recipe.name.clone(),
        ingredient_names: used.iter().map(|ingredient| ingredient.name.clone()).collect(),
        missing_ingredient_ids,
        resolution: resolve_with_overrides(used, recipe.allergen_overrides.as_ref()),
    }
}

use serde::{Deserialize, Serialize};

use crate::catalog::{list_allergens, AllergenKind, ALLERGEN_COUNT};
use crate::Ingredient;

/// Number of allergens reported in [`ComplianceSummary::top_allergens`].
pub const TOP_ALLERGEN_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AllergenCount {
    pub id: AllergenKind,
    pub label: String,
    pub count: usize,
}

/// Dashboard statistics over an ingredient list.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComplianceSummary {
    pub total_ingredients: usize,
    pub ingredients_with_allergens: usize,
    pub ingredients_with_cross_contamination: usize,
    pub allergen_types_tracked: usize,
    pub top_allergens: Vec<AllergenCount>,
}

#[must_use]
pub fn summarize(ingredients: &[Ingredient]) -> ComplianceSummary {
    let mut counts = [0_usize; ALLERGEN_COUNT];
    for ingredient in ingredients {
        for kind in ingredient.allergens.iter() {
            counts[kind.index()] += 1;
        }
    }

    let mut ranked = list_allergens()
        .iter()
        .copied()
        .filter(|kind| counts[kind.index()] > 0)
        .collect::<Vec<_>>();
    // stable sort keeps catalog order for ties
    ranked.sort_by_key(|kind| std::cmp::Reverse(counts[kind.index()]));

    ComplianceSummary {
        total_ingredients: ingredients.len(),
        ingredients_with_allergens: ingredients
            .iter()
            .filter(|ingredient| !ingredient.allergens.is_empty())
            .count(),
        ingredients_with_cross_contamination: ingredients
            .iter()
            .filter(|ingredient| !ingredient.may_contain.is_empty())
            .count(),
        allergen_types_tracked: ALLERGEN_COUNT,
        top_allergens: ranked
            .into_iter()
            .take(TOP_ALLERGEN_LIMIT)
            .map(|kind| AllergenCount {
                id: kind,
                label: kind.short_label().to_string(),
                count: counts[kind.index()],
            })
            .collect(),
    }
}

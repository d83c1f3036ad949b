use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::flags::AllergenFlagSet;
use crate::CoreError;

/// Number of allergens recognized by UK food information regulations.
pub const ALLERGEN_COUNT: usize = 14;

/// One of the 14 regulated allergens.
///
/// Variants are declared in catalog order, so the derived `Ord` and the
/// discriminant both follow the canonical listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AllergenKind {
    Celery,
    Gluten,
    Crustaceans,
    Eggs,
    Fish,
    Lupin,
    Milk,
    Molluscs,
    Mustard,
    TreeNuts,
    Peanuts,
    Sesame,
    Soya,
    Sulphites,
}

const CATALOG: [AllergenKind; ALLERGEN_COUNT] = [
    AllergenKind::Celery,
    AllergenKind::Gluten,
    AllergenKind::Crustaceans,
    AllergenKind::Eggs,
    AllergenKind::Fish,
    AllergenKind::Lupin,
    AllergenKind::Milk,
    AllergenKind::Molluscs,
    AllergenKind::Mustard,
    AllergenKind::TreeNuts,
    AllergenKind::Peanuts,
    AllergenKind::Sesame,
    AllergenKind::Soya,
    AllergenKind::Sulphites,
];

impl AllergenKind {
    /// Stable identifier used as a map key and in persisted data.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Celery => "celery",
            Self::Gluten => "gluten",
            Self::Crustaceans => "crustaceans",
            Self::Eggs => "eggs",
            Self::Fish => "fish",
            Self::Lupin => "lupin",
            Self::Milk => "milk",
            Self::Molluscs => "molluscs",
            Self::Mustard => "mustard",
            Self::TreeNuts => "treeNuts",
            Self::Peanuts => "peanuts",
            Self::Sesame => "sesame",
            Self::Soya => "soya",
            Self::Sulphites => "sulphites",
        }
    }

    /// Full display label, including any clarifying example list.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Celery => "Celery",
            Self::Gluten => "Gluten (wheat, rye, barley, oats)",
            Self::Crustaceans => "Crustaceans (crab, lobster, prawns)",
            Self::Eggs => "Eggs",
            Self::Fish => "Fish",
            Self::Lupin => "Lupin",
            Self::Milk => "Milk",
            Self::Molluscs => "Molluscs (mussels, oysters, squid)",
            Self::Mustard => "Mustard",
            Self::TreeNuts => "Tree Nuts (almonds, hazelnuts, walnuts)",
            Self::Peanuts => "Peanuts",
            Self::Sesame => "Sesame seeds",
            Self::Soya => "Soya",
            Self::Sulphites => "Sulphites (>10mg/kg or 10mg/litre)",
        }
    }

    /// Display label without the trailing parenthetical clarifier.
    #[must_use]
    pub fn short_label(self) -> &'static str {
        strip_clarifier(self.label())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        CATALOG.iter().copied().find(|kind| kind.as_str() == value)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Display for AllergenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllergenKind {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| CoreError::UnknownAllergen(value.to_string()))
    }
}

/// The canonical catalog, in fixed order.
#[must_use]
pub fn list_allergens() -> &'static [AllergenKind] {
    &CATALOG
}

/// Full label for an allergen id. Unknown ids are returned unchanged.
#[must_use]
pub fn label_for(id: &str) -> &str {
    AllergenKind::parse(id).map_or(id, |kind| kind.label())
}

/// Compact label for an allergen id. Unknown ids are returned unchanged.
#[must_use]
pub fn short_label(id: &str) -> &str {
    AllergenKind::parse(id).map_or(id, |kind| kind.short_label())
}

/// All-false flag set over the full catalog.
#[must_use]
pub fn empty_flag_set() -> AllergenFlagSet {
    AllergenFlagSet::empty()
}

fn strip_clarifier(label: &str) -> &str {
    label.split_once('(').map_or(label, |(head, _)| head).trim()
}

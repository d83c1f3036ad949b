use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod catalog;
pub mod disclosure;
pub mod flags;
pub mod summary;

pub use catalog::{
    empty_flag_set, label_for, list_allergens, short_label, AllergenKind, ALLERGEN_COUNT,
};
pub use disclosure::{
    aggregate, disclose_recipe, resolve_with_overrides, AggregationResult, DisclosureEntry,
    DisclosureSource, DisclosureTier, IgnoredOverride, IgnoredOverrideCause, OverrideResolution,
    RecipeDisclosure,
};
pub use flags::AllergenFlagSet;
pub use summary::{summarize, AllergenCount, ComplianceSummary, TOP_ALLERGEN_LIMIT};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown allergen id: {0}")]
    UnknownAllergen(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IngredientId(pub Ulid);

impl IngredientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for IngredientId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for IngredientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IngredientId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecipeId(pub Ulid);

impl RecipeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecipeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecipeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecipeId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

/// A raw material and its declared allergens.
///
/// `allergens` are definite contents; `may_contain` is cross-contamination
/// risk only. The same allergen may be flagged in both.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ingredient {
    pub id: IngredientId,
    pub name: String,
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub allergens: AllergenFlagSet,
    #[serde(default)]
    pub may_contain: AllergenFlagSet,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Ingredient {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: IngredientId::new(),
            name: name.into(),
            supplier_name: None,
            allergens: AllergenFlagSet::empty(),
            may_contain: AllergenFlagSet::empty(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn with_supplier(mut self, supplier_name: impl Into<String>) -> Self {
        self.supplier_name = Some(supplier_name.into());
        self
    }

    #[must_use]
    pub fn with_allergens(mut self, kinds: impl IntoIterator<Item = AllergenKind>) -> Self {
        self.allergens = kinds.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_may_contain(mut self, kinds: impl IntoIterator<Item = AllergenKind>) -> Self {
        self.may_contain = kinds.into_iter().collect();
        self
    }

    /// Check the fields an ingredient store requires before a write.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the name is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation("ingredient name MUST be provided".to_string()));
        }
        Ok(())
    }
}

/// A recipe's reference to an ingredient. Quantity and unit never affect
/// allergen disclosure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeIngredientLine {
    pub ingredient_id: IngredientId,
    pub quantity: f64,
    pub unit: String,
}

impl RecipeIngredientLine {
    #[must_use]
    pub fn new(ingredient_id: IngredientId, quantity: f64, unit: impl Into<String>) -> Self {
        Self { ingredient_id, quantity, unit: unit.into() }
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when the quantity is not a positive
    /// finite number or the unit is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(CoreError::Validation(format!(
                "quantity MUST be a positive number for ingredient {}",
                self.ingredient_id
            )));
        }
        if self.unit.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "unit MUST be provided for ingredient {}",
                self.ingredient_id
            )));
        }
        Ok(())
    }
}

/// Manual allergen assertions layered over the ingredient-derived disclosure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AllergenOverrideSet {
    #[serde(default, deserialize_with = "flags::deserialize_kind_set")]
    pub contains: BTreeSet<AllergenKind>,
    #[serde(default, deserialize_with = "flags::deserialize_kind_set")]
    pub may_contain: BTreeSet<AllergenKind>,
    #[serde(default, deserialize_with = "flags::deserialize_reason_map")]
    pub reasons: BTreeMap<AllergenKind, String>,
}

impl AllergenOverrideSet {
    /// Build an override set where every asserted id carries the same reason.
    /// A blank reason records no reasons at all.
    #[must_use]
    pub fn with_shared_reason(
        contains: impl IntoIterator<Item = AllergenKind>,
        may_contain: impl IntoIterator<Item = AllergenKind>,
        reason: &str,
    ) -> Self {
        let contains = contains.into_iter().collect::<BTreeSet<_>>();
        let may_contain = may_contain.into_iter().collect::<BTreeSet<_>>();
        let reason = reason.trim();
        let reasons = if reason.is_empty() {
            BTreeMap::new()
        } else {
            contains
                .iter()
                .chain(may_contain.iter())
                .map(|kind| (*kind, reason.to_string()))
                .collect()
        };
        Self { contains, may_contain, reasons }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contains.is_empty() && self.may_contain.is_empty()
    }

    /// Recorded reason for an allergen, or `""` when none was given.
    #[must_use]
    pub fn reason_for(&self, kind: AllergenKind) -> &str {
        self.reasons.get(&kind).map_or("", String::as_str)
    }

    /// Asserted allergens whose reason is missing or blank, in catalog order.
    #[must_use]
    pub fn missing_reasons(&self) -> Vec<AllergenKind> {
        self.contains
            .union(&self.may_contain)
            .copied()
            .filter(|kind| self.reason_for(*kind).trim().is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub action: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub id: RecipeId,
    pub name: String,
    pub ingredients: Vec<RecipeIngredientLine>,
    #[serde(default)]
    pub allergen_overrides: Option<AllergenOverrideSet>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Recipe {
    #[must_use]
    pub fn new(name: impl Into<String>, ingredients: Vec<RecipeIngredientLine>) -> Self {
        Self {
            id: RecipeId::new(),
            name: name.into(),
            ingredients,
            allergen_overrides: None,
            audit_log: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when the name is blank, the recipe
    /// has no ingredient lines, or any line is invalid.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation("recipe name MUST be provided".to_string()));
        }
        if self.ingredients.is_empty() {
            return Err(CoreError::Validation(
                "recipe MUST reference at least one ingredient".to_string(),
            ));
        }
        for line in &self.ingredients {
            line.validate()?;
        }
        Ok(())
    }
}

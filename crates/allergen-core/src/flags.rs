use std::collections::{BTreeMap, BTreeSet};

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::catalog::{list_allergens, AllergenKind, ALLERGEN_COUNT};

/// Presence flag for every catalog allergen.
///
/// Backed by a fixed array indexed by [`AllergenKind`], so a flag set is
/// always total. On the wire it is an object keyed by allergen id; reading
/// tolerates missing keys (false), unknown keys (ignored) and `null`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct AllergenFlagSet([bool; ALLERGEN_COUNT]);

impl AllergenFlagSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self([false; ALLERGEN_COUNT])
    }

    #[must_use]
    pub fn contains(&self, kind: AllergenKind) -> bool {
        self.0[kind.index()]
    }

    pub fn set(&mut self, kind: AllergenKind, present: bool) {
        self.0[kind.index()] = present;
    }

    pub fn insert(&mut self, kind: AllergenKind) {
        self.set(kind, true);
    }

    #[must_use]
    pub fn with(mut self, kind: AllergenKind) -> Self {
        self.insert(kind);
        self
    }

    /// Present allergens in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = AllergenKind> + '_ {
        list_allergens().iter().copied().filter(|kind| self.contains(*kind))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.iter().filter(|present| **present).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|present| *present)
    }
}

impl FromIterator<AllergenKind> for AllergenFlagSet {
    fn from_iter<I: IntoIterator<Item = AllergenKind>>(iter: I) -> Self {
        let mut flags = Self::empty();
        for kind in iter {
            flags.insert(kind);
        }
        flags
    }
}

impl Serialize for AllergenFlagSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(ALLERGEN_COUNT))?;
        for kind in list_allergens() {
            map.serialize_entry(kind.as_str(), &self.contains(*kind))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AllergenFlagSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<BTreeMap<String, bool>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(raw
            .into_iter()
            .filter(|(_, present)| *present)
            .filter_map(|(id, _)| AllergenKind::parse(&id))
            .collect())
    }
}

/// Read a list of allergen ids, dropping ids outside the catalog.
pub(crate) fn deserialize_kind_set<'de, D>(
    deserializer: D,
) -> Result<BTreeSet<AllergenKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw.iter().filter_map(|id| AllergenKind::parse(id)).collect())
}

/// Read an id-keyed reason map, dropping ids outside the catalog.
pub(crate) fn deserialize_reason_map<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<AllergenKind, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw.into_iter().filter_map(|(id, reason)| Some((AllergenKind::parse(&id)?, reason))).collect())
}

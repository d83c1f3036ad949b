use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use allergen_core::{
    disclose_recipe, AllergenFlagSet, AllergenKind, AllergenOverrideSet, AuditEntry,
    DisclosureTier, Ingredient, IngredientId, Recipe, RecipeDisclosure, RecipeId,
    RecipeIngredientLine,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Audit action recorded whenever a recipe's override set is saved.
pub const OVERRIDES_SAVED_ACTION: &str = "overrides_saved";

const INGREDIENTS_FILE: &str = "ingredients.ndjson";
const RECIPES_FILE: &str = "recipes.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ingredients (
  ingredient_id TEXT PRIMARY KEY,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  supplier_name TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingredient_allergens (
  ingredient_id TEXT NOT NULL,
  allergen_id TEXT NOT NULL,
  tier TEXT NOT NULL CHECK (tier IN ('contains','may_contain')),
  PRIMARY KEY (ingredient_id, allergen_id, tier),
  FOREIGN KEY (ingredient_id) REFERENCES ingredients(ingredient_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS recipes (
  recipe_id TEXT PRIMARY KEY,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recipe_lines (
  recipe_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  ingredient_id TEXT NOT NULL,
  quantity REAL NOT NULL CHECK (quantity > 0),
  unit TEXT NOT NULL,
  PRIMARY KEY (recipe_id, position),
  FOREIGN KEY (recipe_id) REFERENCES recipes(recipe_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_ingredient_allergens_allergen ON ingredient_allergens(allergen_id);
CREATE INDEX IF NOT EXISTS idx_recipe_lines_ingredient ON recipe_lines(ingredient_id);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE recipes ADD COLUMN overrides_saved_at TEXT;

CREATE TABLE IF NOT EXISTS recipe_overrides (
  recipe_id TEXT NOT NULL,
  allergen_id TEXT NOT NULL,
  tier TEXT NOT NULL CHECK (tier IN ('contains','may_contain')),
  PRIMARY KEY (recipe_id, allergen_id, tier),
  FOREIGN KEY (recipe_id) REFERENCES recipes(recipe_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS recipe_override_reasons (
  recipe_id TEXT NOT NULL,
  allergen_id TEXT NOT NULL,
  reason TEXT NOT NULL,
  PRIMARY KEY (recipe_id, allergen_id),
  FOREIGN KEY (recipe_id) REFERENCES recipes(recipe_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS recipe_audit_log (
  entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
  recipe_id TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  action TEXT NOT NULL,
  reason TEXT NOT NULL,
  FOREIGN KEY (recipe_id) REFERENCES recipes(recipe_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_recipe_audit_log_recipe ON recipe_audit_log(recipe_id, entry_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_ingredients: usize,
    pub skipped_existing_ingredients: usize,
    pub imported_recipes: usize,
    pub skipped_existing_recipes: usize,
}

/// Ingredient search criteria. Empty criteria match every ingredient.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngredientFilter {
    /// Case-insensitive substring matched against name or supplier.
    pub text: Option<String>,
    /// Matches ingredients that contain or may contain this allergen.
    pub allergen: Option<AllergenKind>,
}

impl IngredientFilter {
    #[must_use]
    pub fn matches(&self, ingredient: &Ingredient) -> bool {
        let text_matches = match self.text.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(text) => {
                let needle = text.to_lowercase();
                ingredient.name.to_lowercase().contains(&needle)
                    || ingredient
                        .supplier_name
                        .as_deref()
                        .is_some_and(|supplier| supplier.to_lowercase().contains(&needle))
            }
        };
        let allergen_matches = match self.allergen {
            None => true,
            Some(kind) => ingredient.allergens.contains(kind) || ingredient.may_contain.contains(kind),
        };
        text_matches && allergen_matches
    }
}

struct IngredientRow {
    ingredient_id: String,
    name: String,
    supplier_name: Option<String>,
    created_at: String,
}

struct RecipeRow {
    recipe_id: String,
    name: String,
    created_at: String,
    overrides_saved_at: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed allergen store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            apply_migration_1(&self.conn)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create override and audit tables")?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        tracing::info!(version = 2, "applied schema migration");
        Ok(())
    }

    /// Persist one validated ingredient and its allergen flags.
    ///
    /// # Errors
    /// Returns an error when validation fails, the id already exists, or any write fails.
    pub fn write_ingredient(&mut self, ingredient: &Ingredient) -> Result<()> {
        ingredient.validate().map_err(|err| anyhow!("ingredient validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO ingredients(ingredient_id, name, supplier_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                ingredient.id.to_string(),
                ingredient.name.trim(),
                normalized_supplier(ingredient.supplier_name.as_deref()),
                rfc3339(ingredient.created_at)?,
            ],
        )
        .with_context(|| format!("failed to insert ingredient {}", ingredient.id))?;
        insert_ingredient_flags(&tx, ingredient)?;
        tx.commit().context("failed to commit write transaction")?;

        tracing::debug!(ingredient_id = %ingredient.id, "ingredient written");
        Ok(())
    }

    /// Replace an existing ingredient's name, supplier and allergen flags.
    ///
    /// The ingredient keeps its id, creation time and list position.
    ///
    /// # Errors
    /// Returns an error when validation fails, the ingredient does not exist, or any write fails.
    pub fn replace_ingredient(&mut self, ingredient: &Ingredient) -> Result<()> {
        ingredient.validate().map_err(|err| anyhow!("ingredient validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let updated = tx
            .execute(
                "UPDATE ingredients SET name = ?2, supplier_name = ?3 WHERE ingredient_id = ?1",
                params![
                    ingredient.id.to_string(),
                    ingredient.name.trim(),
                    normalized_supplier(ingredient.supplier_name.as_deref()),
                ],
            )
            .with_context(|| format!("failed to update ingredient {}", ingredient.id))?;
        if updated == 0 {
            return Err(anyhow!("ingredient not found: {}", ingredient.id));
        }

        tx.execute(
            "DELETE FROM ingredient_allergens WHERE ingredient_id = ?1",
            params![ingredient.id.to_string()],
        )
        .context("failed to clear ingredient allergens")?;
        insert_ingredient_flags(&tx, ingredient)?;
        tx.commit().context("failed to commit replace transaction")?;

        tracing::debug!(ingredient_id = %ingredient.id, "ingredient replaced");
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn get_ingredient(&self, ingredient_id: IngredientId) -> Result<Option<Ingredient>> {
        let row = self
            .conn
            .query_row(
                "SELECT ingredient_id, name, supplier_name, created_at
                 FROM ingredients
                 WHERE ingredient_id = ?1",
                params![ingredient_id.to_string()],
                |row| {
                    Ok(IngredientRow {
                        ingredient_id: row.get(0)?,
                        name: row.get(1)?,
                        supplier_name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load ingredient {ingredient_id}"))?;

        row.map(|row| self.hydrate_ingredient(row)).transpose()
    }

    /// Load all ingredients in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_ingredients(&self) -> Result<Vec<Ingredient>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT ingredient_id, name, supplier_name, created_at
                 FROM ingredients
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(IngredientRow {
                    ingredient_id: row.get(0)?,
                    name: row.get(1)?,
                    supplier_name: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read ingredients")?
        };

        rows.into_iter().map(|row| self.hydrate_ingredient(row)).collect()
    }

    /// Ingredients matching `filter`, in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn search_ingredients(&self, filter: &IngredientFilter) -> Result<Vec<Ingredient>> {
        let mut ingredients = self.list_ingredients()?;
        ingredients.retain(|ingredient| filter.matches(ingredient));
        Ok(ingredients)
    }

    /// Delete an ingredient. Recipe lines referencing it are kept and show
    /// up as missing in later disclosures.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_ingredient(&mut self, ingredient_id: IngredientId) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM ingredients WHERE ingredient_id = ?1",
                params![ingredient_id.to_string()],
            )
            .with_context(|| format!("failed to delete ingredient {ingredient_id}"))?;
        tracing::debug!(ingredient_id = %ingredient_id, deleted = deleted > 0, "ingredient delete");
        Ok(deleted > 0)
    }

    /// Persist one validated recipe with its lines, overrides and audit log.
    ///
    /// # Errors
    /// Returns an error when validation fails, the id already exists, or any write fails.
    pub fn write_recipe(&mut self, recipe: &Recipe) -> Result<()> {
        recipe.validate().map_err(|err| anyhow!("recipe validation failed: {err}"))?;

        let overrides_saved_at =
            recipe.allergen_overrides.as_ref().map(|_| now_rfc3339()).transpose()?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO recipes(recipe_id, name, created_at, overrides_saved_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                recipe.id.to_string(),
                recipe.name.trim(),
                rfc3339(recipe.created_at)?,
                overrides_saved_at,
            ],
        )
        .with_context(|| format!("failed to insert recipe {}", recipe.id))?;

        for (position, line) in recipe.ingredients.iter().enumerate() {
            tx.execute(
                "INSERT INTO recipe_lines(recipe_id, position, ingredient_id, quantity, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    recipe.id.to_string(),
                    i64::try_from(position).context("recipe line position overflow")?,
                    line.ingredient_id.to_string(),
                    line.quantity,
                    line.unit.trim(),
                ],
            )
            .context("failed to insert recipe line")?;
        }

        if let Some(overrides) = &recipe.allergen_overrides {
            insert_overrides(&tx, recipe.id, overrides)?;
        }
        for entry in &recipe.audit_log {
            insert_audit_entry(&tx, recipe.id, entry)?;
        }

        tx.commit().context("failed to commit write transaction")?;
        tracing::debug!(recipe_id = %recipe.id, lines = recipe.ingredients.len(), "recipe written");
        Ok(())
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn get_recipe(&self, recipe_id: RecipeId) -> Result<Option<Recipe>> {
        let row = self
            .conn
            .query_row(
                "SELECT recipe_id, name, created_at, overrides_saved_at
                 FROM recipes
                 WHERE recipe_id = ?1",
                params![recipe_id.to_string()],
                |row| {
                    Ok(RecipeRow {
                        recipe_id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        overrides_saved_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load recipe {recipe_id}"))?;

        row.map(|row| self.hydrate_recipe(row)).transpose()
    }

    /// Load all recipes in insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT recipe_id, name, created_at, overrides_saved_at
                 FROM recipes
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RecipeRow {
                    recipe_id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: row.get(2)?,
                    overrides_saved_at: row.get(3)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read recipes")?
        };

        rows.into_iter().map(|row| self.hydrate_recipe(row)).collect()
    }

    /// Delete a recipe together with its lines, overrides and audit log.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_recipe(&mut self, recipe_id: RecipeId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM recipes WHERE recipe_id = ?1", params![recipe_id.to_string()])
            .with_context(|| format!("failed to delete recipe {recipe_id}"))?;
        tracing::debug!(recipe_id = %recipe_id, deleted = deleted > 0, "recipe delete");
        Ok(deleted > 0)
    }

    /// Replace a recipe's override set and append an audit entry carrying `reason`.
    ///
    /// Both writes happen in one transaction. Saving an empty set records
    /// that overrides were reviewed and cleared.
    ///
    /// # Errors
    /// Returns an error when any allergen is asserted without a reason, the
    /// recipe does not exist, or any write fails.
    pub fn save_overrides(
        &mut self,
        recipe_id: RecipeId,
        overrides: &AllergenOverrideSet,
        reason: &str,
    ) -> Result<AuditEntry> {
        let reason = reason.trim();
        if !overrides.is_empty() && reason.is_empty() {
            return Err(anyhow!("override reason MUST be provided when allergens are asserted"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let entry = AuditEntry {
            timestamp: OffsetDateTime::now_utc(),
            action: OVERRIDES_SAVED_ACTION.to_string(),
            reason: reason.to_string(),
        };

        let updated = tx
            .execute(
                "UPDATE recipes SET overrides_saved_at = ?2 WHERE recipe_id = ?1",
                params![recipe_id.to_string(), rfc3339(entry.timestamp)?],
            )
            .with_context(|| format!("failed to update recipe {recipe_id}"))?;
        if updated == 0 {
            return Err(anyhow!("recipe not found: {recipe_id}"));
        }

        tx.execute("DELETE FROM recipe_overrides WHERE recipe_id = ?1", params![
            recipe_id.to_string()
        ])
        .context("failed to clear recipe overrides")?;
        tx.execute("DELETE FROM recipe_override_reasons WHERE recipe_id = ?1", params![
            recipe_id.to_string()
        ])
        .context("failed to clear recipe override reasons")?;
        insert_overrides(&tx, recipe_id, overrides)?;
        insert_audit_entry(&tx, recipe_id, &entry)?;

        tx.commit().context("failed to commit override transaction")?;
        tracing::info!(
            recipe_id = %recipe_id,
            contains = overrides.contains.len(),
            may_contain = overrides.may_contain.len(),
            "saved allergen overrides"
        );
        Ok(entry)
    }

    /// Resolve a stored recipe's final disclosure against the stored ingredients.
    ///
    /// # Errors
    /// Returns an error when the recipe does not exist or rows cannot be read.
    pub fn recipe_disclosure(&self, recipe_id: RecipeId) -> Result<RecipeDisclosure> {
        let recipe =
            self.get_recipe(recipe_id)?.ok_or_else(|| anyhow!("recipe not found: {recipe_id}"))?;
        let ingredients = self.list_ingredients()?;
        let disclosure = disclose_recipe(&recipe, &ingredients);

        if !disclosure.missing_ingredient_ids.is_empty() {
            tracing::warn!(
                recipe_id = %recipe_id,
                missing = disclosure.missing_ingredient_ids.len(),
                "recipe references ingredients that no longer exist"
            );
        }
        Ok(disclosure)
    }

    /// Export ingredients and recipes as NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let ingredients = self.list_ingredients()?;
        let recipes = self.list_recipes()?;

        let ingredient_digest = write_ndjson_file(&out_dir.join(INGREDIENTS_FILE), &ingredients)?;
        let recipe_digest = write_ndjson_file(&out_dir.join(RECIPES_FILE), &recipes)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: INGREDIENTS_FILE.to_string(),
                    sha256: ingredient_digest.0,
                    records: ingredient_digest.1,
                },
                ExportFileDigest {
                    path: RECIPES_FILE.to_string(),
                    sha256: recipe_digest.0,
                    records: recipe_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(
            out_dir = %out_dir.display(),
            ingredients = ingredients.len(),
            recipes = recipes.len(),
            "exported snapshot"
        );
        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest verification, parsing, duplicate handling,
    /// or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary {
            imported_ingredients: 0,
            skipped_existing_ingredients: 0,
            imported_recipes: 0,
            skipped_existing_recipes: 0,
        };

        for ingredient in read_ndjson_file::<Ingredient>(&in_dir.join(INGREDIENTS_FILE))? {
            if self.ingredient_exists(ingredient.id)? {
                if skip_existing {
                    summary.skipped_existing_ingredients += 1;
                    continue;
                }

                return Err(anyhow!("ingredient already exists: {}", ingredient.id));
            }
            self.write_ingredient(&ingredient)?;
            summary.imported_ingredients += 1;
        }

        for recipe in read_ndjson_file::<Recipe>(&in_dir.join(RECIPES_FILE))? {
            if self.recipe_exists(recipe.id)? {
                if skip_existing {
                    summary.skipped_existing_recipes += 1;
                    continue;
                }

                return Err(anyhow!("recipe already exists: {}", recipe.id));
            }
            self.write_recipe(&recipe)?;
            summary.imported_recipes += 1;
        }

        tracing::info!(
            in_dir = %in_dir.display(),
            imported_ingredients = summary.imported_ingredients,
            imported_recipes = summary.imported_recipes,
            "imported snapshot"
        );
        Ok(summary)
    }

    fn ingredient_exists(&self, ingredient_id: IngredientId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM ingredients WHERE ingredient_id = ?1)",
                params![ingredient_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check ingredient existence")?;
        Ok(exists == 1)
    }

    fn recipe_exists(&self, recipe_id: RecipeId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM recipes WHERE recipe_id = ?1)",
                params![recipe_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check recipe existence")?;
        Ok(exists == 1)
    }

    fn hydrate_ingredient(&self, row: IngredientRow) -> Result<Ingredient> {
        let id = parse_ingredient_id(&row.ingredient_id)?;
        let mut allergens = AllergenFlagSet::empty();
        let mut may_contain = AllergenFlagSet::empty();

        let mut stmt = self.conn.prepare(
            "SELECT allergen_id, tier FROM ingredient_allergens WHERE ingredient_id = ?1",
        )?;
        let mut rows = stmt.query(params![row.ingredient_id])?;
        while let Some(flag) = rows.next()? {
            let allergen_raw: String = flag.get(0)?;
            let tier_raw: String = flag.get(1)?;
            let Some(kind) = AllergenKind::parse(&allergen_raw) else {
                tracing::warn!(ingredient_id = %id, allergen = %allergen_raw, "ignoring unknown allergen id");
                continue;
            };
            match DisclosureTier::parse(&tier_raw) {
                Some(DisclosureTier::Contains) => allergens.insert(kind),
                Some(DisclosureTier::MayContain) => may_contain.insert(kind),
                None => return Err(anyhow!("unknown allergen tier: {tier_raw}")),
            }
        }

        Ok(Ingredient {
            id,
            name: row.name,
            supplier_name: row.supplier_name,
            allergens,
            may_contain,
            created_at: parse_rfc3339(&row.created_at)?,
        })
    }

    fn hydrate_recipe(&self, row: RecipeRow) -> Result<Recipe> {
        let id = parse_recipe_id(&row.recipe_id)?;
        let allergen_overrides = match row.overrides_saved_at {
            Some(_) => Some(self.load_overrides(&row.recipe_id)?),
            None => None,
        };

        Ok(Recipe {
            id,
            name: row.name,
            ingredients: self.load_lines(&row.recipe_id)?,
            allergen_overrides,
            audit_log: self.load_audit_log(&row.recipe_id)?,
            created_at: parse_rfc3339(&row.created_at)?,
        })
    }

    fn load_lines(&self, recipe_id: &str) -> Result<Vec<RecipeIngredientLine>> {
        let mut stmt = self.conn.prepare(
            "SELECT ingredient_id, quantity, unit
             FROM recipe_lines
             WHERE recipe_id = ?1
             ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![recipe_id])?;
        let mut lines = Vec::new();

        while let Some(row) = rows.next()? {
            let ingredient_id_raw: String = row.get(0)?;
            lines.push(RecipeIngredientLine {
                ingredient_id: parse_ingredient_id(&ingredient_id_raw)?,
                quantity: row.get(1)?,
                unit: row.get(2)?,
            });
        }

        Ok(lines)
    }

    fn load_overrides(&self, recipe_id: &str) -> Result<AllergenOverrideSet> {
        let mut overrides = AllergenOverrideSet::default();

        {
            let mut stmt = self
                .conn
                .prepare("SELECT allergen_id, tier FROM recipe_overrides WHERE recipe_id = ?1")?;
            let mut rows = stmt.query(params![recipe_id])?;
            while let Some(row) = rows.next()? {
                let allergen_raw: String = row.get(0)?;
                let tier_raw: String = row.get(1)?;
                let Some(kind) = AllergenKind::parse(&allergen_raw) else {
                    tracing::warn!(recipe_id, allergen = %allergen_raw, "ignoring unknown override id");
                    continue;
                };
                match DisclosureTier::parse(&tier_raw) {
                    Some(DisclosureTier::Contains) => overrides.contains.insert(kind),
                    Some(DisclosureTier::MayContain) => overrides.may_contain.insert(kind),
                    None => return Err(anyhow!("unknown override tier: {tier_raw}")),
                };
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT allergen_id, reason FROM recipe_override_reasons WHERE recipe_id = ?1",
        )?;
        let mut rows = stmt.query(params![recipe_id])?;
        while let Some(row) = rows.next()? {
            let allergen_raw: String = row.get(0)?;
            if let Some(kind) = AllergenKind::parse(&allergen_raw) {
                overrides.reasons.insert(kind, row.get(1)?);
            }
        }

        Ok(overrides)
    }

    fn load_audit_log(&self, recipe_id: &str) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT recorded_at, action, reason
             FROM recipe_audit_log
             WHERE recipe_id = ?1
             ORDER BY entry_id ASC",
        )?;
        let mut rows = stmt.query(params![recipe_id])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let recorded_at: String = row.get(0)?;
            entries.push(AuditEntry {
                timestamp: parse_rfc3339(&recorded_at)?,
                action: row.get(1)?,
                reason: row.get(2)?,
            });
        }

        Ok(entries)
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    tracing::info!(version = 1, "applied schema migration");
    Ok(())
}

fn insert_ingredient_flags(conn: &Connection, ingredient: &Ingredient) -> Result<()> {
    for (tier, flags) in [
        (DisclosureTier::Contains, &ingredient.allergens),
        (DisclosureTier::MayContain, &ingredient.may_contain),
    ] {
        for kind in flags.iter() {
            conn.execute(
                "INSERT INTO ingredient_allergens(ingredient_id, allergen_id, tier)
                 VALUES (?1, ?2, ?3)",
                params![ingredient.id.to_string(), kind.as_str(), tier.as_str()],
            )
            .context("failed to insert ingredient allergen")?;
        }
    }
    Ok(())
}

fn insert_overrides(
    conn: &Connection,
    recipe_id: RecipeId,
    overrides: &AllergenOverrideSet,
) -> Result<()> {
    for (tier, kinds) in [
        (DisclosureTier::Contains, &overrides.contains),
        (DisclosureTier::MayContain, &overrides.may_contain),
    ] {
        for kind in kinds {
            conn.execute(
                "INSERT INTO recipe_overrides(recipe_id, allergen_id, tier) VALUES (?1, ?2, ?3)",
                params![recipe_id.to_string(), kind.as_str(), tier.as_str()],
            )
            .context("failed to insert recipe override")?;
        }
    }

    for (kind, reason) in &overrides.reasons {
        if !overrides.contains.contains(kind) && !overrides.may_contain.contains(kind) {
            continue;
        }
        conn.execute(
            "INSERT INTO recipe_override_reasons(recipe_id, allergen_id, reason) VALUES (?1, ?2, ?3)",
            params![recipe_id.to_string(), kind.as_str(), reason],
        )
        .context("failed to insert recipe override reason")?;
    }
    Ok(())
}

fn insert_audit_entry(conn: &Connection, recipe_id: RecipeId, entry: &AuditEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO recipe_audit_log(recipe_id, recorded_at, action, reason) VALUES (?1, ?2, ?3, ?4)",
        params![recipe_id.to_string(), rfc3339(entry.timestamp)?, entry.action, entry.reason],
    )
    .context("failed to insert audit entry")?;
    Ok(())
}

fn normalized_supplier(supplier_name: Option<&str>) -> Option<&str> {
    supplier_name.map(str::trim).filter(|supplier| !supplier.is_empty())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ingredient_id(raw: &str) -> Result<IngredientId> {
    raw.parse::<IngredientId>().with_context(|| format!("invalid ingredient id in store: {raw}"))
}

fn parse_recipe_id(raw: &str) -> Result<RecipeId> {
    raw.parse::<RecipeId>().with_context(|| format!("invalid recipe id in store: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [INGREDIENTS_FILE, RECIPES_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use time::Duration;
    use ulid::Ulid;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_ingredient(
        name: &str,
        supplier: Option<&str>,
        allergens: &[AllergenKind],
        may_contain: &[AllergenKind],
    ) -> Ingredient {
        let mut ingredient = Ingredient::new(name)
            .with_allergens(allergens.iter().copied())
            .with_may_contain(may_contain.iter().copied());
        ingredient.supplier_name = supplier.map(str::to_string);
        ingredient.created_at = fixture_time();
        ingredient
    }

    fn mk_recipe(name: &str, ingredients: &[&Ingredient]) -> Recipe {
        let lines = ingredients
            .iter()
            .map(|ingredient| RecipeIngredientLine::new(ingredient.id, 100.0, "g"))
            .collect();
        let mut recipe = Recipe::new(name, lines);
        recipe.created_at = fixture_time();
        recipe
    }

    fn count_rows(store: &SqliteStore, table: &str, recipe_id: RecipeId) -> Result<i64> {
        let count = store.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE recipe_id = ?1"),
            params![recipe_id.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }

    #[test]
    fn migrate_creates_latest_schema_and_reports_status() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn schema_status_reports_only_recorded_versions() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        apply_migration_1(&store.conn)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.target_version, 2);
        assert_eq!(status.pending_versions, vec![2]);

        let versions = store
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")?
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        assert_eq!(versions, vec![1]);
        Ok(())
    }

    #[test]
    fn migrate_upgrades_v1_database_without_inventing_overrides() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        apply_migration_1(&store.conn)?;

        let recipe_id = RecipeId::new();
        store.conn.execute(
            "INSERT INTO recipes(recipe_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![recipe_id.to_string(), "Plain Loaf", "2026-01-01T00:00:00Z"],
        )?;
        store.conn.execute(
            "INSERT INTO recipe_lines(recipe_id, position, ingredient_id, quantity, unit)
             VALUES (?1, 0, ?2, 250.0, 'g')",
            params![recipe_id.to_string(), IngredientId::new().to_string()],
        )?;

        store.migrate()?;

        let Some(recipe) = store.get_recipe(recipe_id)? else {
            return Err(anyhow!("v1 recipe should survive migration"));
        };
        assert_eq!(recipe.name, "Plain Loaf");
        assert_eq!(recipe.ingredients.len(), 1);
        assert_eq!(recipe.allergen_overrides, None);
        assert!(recipe.audit_log.is_empty());
        Ok(())
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = migrated_store()?;

        let ingredient_id = IngredientId::new().to_string();
        store.conn.execute(
            "INSERT INTO ingredients(ingredient_id, name, created_at) VALUES (?1, 'Salt', ?2)",
            params![ingredient_id, "2026-01-01T00:00:00Z"],
        )?;

        let tier_result = store.conn.execute(
            "INSERT INTO ingredient_allergens(ingredient_id, allergen_id, tier) VALUES (?1, 'milk', 'trace')",
            params![ingredient_id],
        );
        assert!(tier_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO recipe_lines(recipe_id, position, ingredient_id, quantity, unit)
             VALUES (?1, 0, ?2, 1.0, 'g')",
            params![RecipeId::new().to_string(), ingredient_id],
        );
        assert!(fk_result.is_err());

        let recipe_id = RecipeId::new().to_string();
        store.conn.execute(
            "INSERT INTO recipes(recipe_id, name, created_at) VALUES (?1, 'Brine', ?2)",
            params![recipe_id, "2026-01-01T00:00:00Z"],
        )?;
        let quantity_result = store.conn.execute(
            "INSERT INTO recipe_lines(recipe_id, position, ingredient_id, quantity, unit)
             VALUES (?1, 0, ?2, 0.0, 'g')",
            params![recipe_id, ingredient_id],
        );
        assert!(quantity_result.is_err());

        Ok(())
    }

    #[test]
    fn write_and_read_ingredient_round_trip() -> Result<()> {
        let mut store = migrated_store()?;
        let chips = mk_ingredient(
            "Dark Chocolate Chips",
            Some("Cadbury"),
            &[AllergenKind::Milk, AllergenKind::Soya],
            &[AllergenKind::TreeNuts, AllergenKind::Milk],
        );

        store.write_ingredient(&chips)?;

        assert_eq!(store.get_ingredient(chips.id)?, Some(chips.clone()));
        assert_eq!(store.list_ingredients()?, vec![chips]);
        assert_eq!(store.get_ingredient(IngredientId::new())?, None);
        Ok(())
    }

    #[test]
    fn write_ingredient_rejects_blank_name_and_duplicate_id() -> Result<()> {
        let mut store = migrated_store()?;

        let Err(err) = store.write_ingredient(&mk_ingredient("  ", None, &[], &[])) else {
            return Err(anyhow!("expected validation failure for blank name"));
        };
        assert!(err.to_string().contains("ingredient validation failed"));

        let flour = mk_ingredient("Plain Flour", Some("Tesco"), &[AllergenKind::Gluten], &[]);
        store.write_ingredient(&flour)?;
        assert!(store.write_ingredient(&flour).is_err());
        assert_eq!(store.list_ingredients()?.len(), 1);
        Ok(())
    }

    #[test]
    fn blank_supplier_is_stored_as_absent() -> Result<()> {
        let mut store = migrated_store()?;
        let water = mk_ingredient("Water", Some("   "), &[], &[]);
        store.write_ingredient(&water)?;

        let Some(loaded) = store.get_ingredient(water.id)? else {
            return Err(anyhow!("ingredient should be stored"));
        };
        assert_eq!(loaded.supplier_name, None);
        Ok(())
    }

    #[test]
    fn replace_ingredient_updates_flags_and_keeps_position() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", Some("Tesco"), &[AllergenKind::Gluten], &[]);
        let butter = mk_ingredient("Butter", Some("Anchor"), &[AllergenKind::Milk], &[]);
        store.write_ingredient(&flour)?;
        store.write_ingredient(&butter)?;

        let mut revised = flour.clone();
        revised.name = "Strong Flour".to_string();
        revised.may_contain = [AllergenKind::Sesame].into_iter().collect();
        store.replace_ingredient(&revised)?;

        let listed = store.list_ingredients()?;
        assert_eq!(listed, vec![revised, butter]);

        let missing = mk_ingredient("Ghost", None, &[], &[]);
        let Err(err) = store.replace_ingredient(&missing) else {
            return Err(anyhow!("expected replace of unknown ingredient to fail"));
        };
        assert!(err.to_string().contains("ingredient not found"));
        Ok(())
    }

    #[test]
    fn search_ingredients_matches_text_and_either_allergen_tier() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", Some("Tesco"), &[AllergenKind::Gluten], &[]);
        let chips = mk_ingredient(
            "Dark Chocolate Chips",
            Some("Cadbury"),
            &[AllergenKind::Milk],
            &[AllergenKind::TreeNuts],
        );
        let almonds = mk_ingredient(
            "Almonds (Sliced)",
            Some("Brakes"),
            &[AllergenKind::TreeNuts],
            &[AllergenKind::Peanuts],
        );
        for ingredient in [&flour, &chips, &almonds] {
            store.write_ingredient(ingredient)?;
        }

        let names = |filter: IngredientFilter| -> Result<Vec<String>> {
            Ok(store.search_ingredients(&filter)?.into_iter().map(|i| i.name).collect())
        };

        assert_eq!(names(IngredientFilter::default())?.len(), 3);
        assert_eq!(
            names(IngredientFilter { text: Some("cadBURY".to_string()), allergen: None })?,
            vec!["Dark Chocolate Chips".to_string()]
        );
        assert_eq!(
            names(IngredientFilter { text: None, allergen: Some(AllergenKind::TreeNuts) })?,
            vec!["Dark Chocolate Chips".to_string(), "Almonds (Sliced)".to_string()]
        );
        assert_eq!(
            names(IngredientFilter {
                text: Some("flour".to_string()),
                allergen: Some(AllergenKind::TreeNuts),
            })?,
            Vec::<String>::new()
        );
        Ok(())
    }

    #[test]
    fn unknown_allergen_rows_are_dropped_on_read() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", None, &[AllergenKind::Gluten], &[]);
        store.write_ingredient(&flour)?;
        store.conn.execute(
            "INSERT INTO ingredient_allergens(ingredient_id, allergen_id, tier) VALUES (?1, 'pollen', 'contains')",
            params![flour.id.to_string()],
        )?;

        let Some(loaded) = store.get_ingredient(flour.id)? else {
            return Err(anyhow!("ingredient should be stored"));
        };
        assert_eq!(loaded.allergens.iter().collect::<Vec<_>>(), vec![AllergenKind::Gluten]);
        Ok(())
    }

    #[test]
    fn recipe_round_trip_preserves_line_order() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", None, &[AllergenKind::Gluten], &[]);
        let butter = mk_ingredient("Butter", None, &[AllergenKind::Milk], &[]);
        let mut recipe = mk_recipe("Shortbread", &[&butter, &flour]);
        recipe.ingredients[1].quantity = 2.5;
        recipe.ingredients[1].unit = "kg".to_string();

        store.write_recipe(&recipe)?;

        let Some(loaded) = store.get_recipe(recipe.id)? else {
            return Err(anyhow!("recipe should be stored"));
        };
        assert_eq!(loaded, recipe);
        assert_eq!(store.list_recipes()?.len(), 1);
        Ok(())
    }

    #[test]
    fn write_recipe_rejects_empty_line_list() -> Result<()> {
        let mut store = migrated_store()?;
        let Err(err) = store.write_recipe(&mk_recipe("Nothing", &[])) else {
            return Err(anyhow!("expected validation failure for empty recipe"));
        };
        assert!(err.to_string().contains("recipe validation failed"));
        Ok(())
    }

    #[test]
    fn save_overrides_replaces_set_and_appends_audit_entries() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", None, &[AllergenKind::Gluten], &[]);
        let recipe = mk_recipe("Bread", &[&flour]);
        store.write_recipe(&recipe)?;

        let first = AllergenOverrideSet::with_shared_reason(
            [AllergenKind::Sesame],
            [AllergenKind::Peanuts],
            "shared production line",
        );
        let entry = store.save_overrides(recipe.id, &first, " shared production line ")?;
        assert_eq!(entry.action, OVERRIDES_SAVED_ACTION);
        assert_eq!(entry.reason, "shared production line");

        let Some(loaded) = store.get_recipe(recipe.id)? else {
            return Err(anyhow!("recipe should be stored"));
        };
        assert_eq!(loaded.allergen_overrides, Some(first));

        store.save_overrides(recipe.id, &AllergenOverrideSet::default(), "")?;
        let Some(cleared) = store.get_recipe(recipe.id)? else {
            return Err(anyhow!("recipe should be stored"));
        };
        assert_eq!(cleared.allergen_overrides, Some(AllergenOverrideSet::default()));
        let reasons =
            cleared.audit_log.iter().map(|entry| entry.reason.as_str()).collect::<Vec<_>>();
        assert_eq!(reasons, vec!["shared production line", ""]);
        Ok(())
    }

    #[test]
    fn save_overrides_requires_reason_and_existing_recipe() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", None, &[AllergenKind::Gluten], &[]);
        let recipe = mk_recipe("Bread", &[&flour]);
        store.write_recipe(&recipe)?;

        let overrides = AllergenOverrideSet::with_shared_reason([AllergenKind::Mustard], [], "");
        let Err(err) = store.save_overrides(recipe.id, &overrides, "  ") else {
            return Err(anyhow!("expected missing reason to be rejected"));
        };
        assert!(err.to_string().contains("override reason MUST be provided"));
        assert_eq!(count_rows(&store, "recipe_audit_log", recipe.id)?, 0);

        let Err(err) = store.save_overrides(RecipeId::new(), &overrides, "seeded bun") else {
            return Err(anyhow!("expected unknown recipe to be rejected"));
        };
        assert!(err.to_string().contains("recipe not found"));
        Ok(())
    }

    #[test]
    fn delete_recipe_cascades_lines_overrides_and_audit_log() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", None, &[AllergenKind::Gluten], &[]);
        let recipe = mk_recipe("Bread", &[&flour]);
        store.write_recipe(&recipe)?;
        let overrides =
            AllergenOverrideSet::with_shared_reason([AllergenKind::Sesame], [], "seeded crust");
        store.save_overrides(recipe.id, &overrides, "seeded crust")?;

        assert!(store.delete_recipe(recipe.id)?);
        assert!(!store.delete_recipe(recipe.id)?);

        for table in
            ["recipe_lines", "recipe_overrides", "recipe_override_reasons", "recipe_audit_log"]
        {
            assert_eq!(count_rows(&store, table, recipe.id)?, 0, "{table} not cleared");
        }
        Ok(())
    }

    #[test]
    fn recipe_disclosure_uses_stored_overrides_and_reports_deleted_ingredients() -> Result<()> {
        let mut store = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", None, &[AllergenKind::Gluten], &[]);
        let chips = mk_ingredient(
            "Dark Chocolate Chips",
            None,
            &[AllergenKind::Milk],
            &[AllergenKind::TreeNuts],
        );
        store.write_ingredient(&flour)?;
        store.write_ingredient(&chips)?;
        let recipe = mk_recipe("Cookie", &[&flour, &chips]);
        store.write_recipe(&recipe)?;
        store.save_overrides(
            recipe.id,
            &AllergenOverrideSet::with_shared_reason([AllergenKind::Eggs], [], "egg wash"),
            "egg wash",
        )?;

        let disclosure = store.recipe_disclosure(recipe.id)?;
        let contains =
            disclosure.resolution.resolved.contains_ids().collect::<Vec<_>>();
        assert_eq!(contains, vec![AllergenKind::Eggs, AllergenKind::Gluten, AllergenKind::Milk]);
        assert_eq!(disclosure.resolution.resolved.contains[0].reason.as_deref(), Some("egg wash"));

        assert!(store.delete_ingredient(chips.id)?);
        let disclosure = store.recipe_disclosure(recipe.id)?;
        assert_eq!(disclosure.missing_ingredient_ids, vec![chips.id]);
        assert_eq!(disclosure.ingredient_names, vec!["Plain Flour".to_string()]);
        assert!(disclosure.resolution.resolved.may_contain.is_empty());

        assert!(store.recipe_disclosure(RecipeId::new()).is_err());
        Ok(())
    }

    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let mut source = migrated_store()?;
        let flour = mk_ingredient("Plain Flour", Some("Tesco"), &[AllergenKind::Gluten], &[]);
        source.write_ingredient(&flour)?;
        let recipe = mk_recipe("Bread", &[&flour]);
        source.write_recipe(&recipe)?;
        let overrides =
            AllergenOverrideSet::with_shared_reason([], [AllergenKind::Sesame], "seed dust");
        source.save_overrides(recipe.id, &overrides, "seed dust")?;

        let export_dir = std::env::temp_dir().join(format!("allergens-export-{}", Ulid::new()));
        let manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].records, 1);
        assert!(export_dir.join(INGREDIENTS_FILE).exists());
        assert!(export_dir.join(RECIPES_FILE).exists());
        assert!(export_dir.join(MANIFEST_FILE).exists());

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot(&export_dir, true)?;
        assert_eq!(summary.imported_ingredients, 1);
        assert_eq!(summary.imported_recipes, 1);

        assert_eq!(target.list_ingredients()?, vec![flour]);
        let Some(imported) = target.get_recipe(recipe.id)? else {
            return Err(anyhow!("recipe should be imported"));
        };
        assert_eq!(imported.allergen_overrides, Some(overrides));
        assert_eq!(imported.audit_log.len(), 1);

        let again = target.import_snapshot(&export_dir, true)?;
        assert_eq!(again.skipped_existing_ingredients, 1);
        assert_eq!(again.skipped_existing_recipes, 1);

        let Err(err) = target.import_snapshot(&export_dir, false) else {
            return Err(anyhow!("expected duplicate import to fail without skip_existing"));
        };
        assert!(err.to_string().contains("ingredient already exists"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        use std::io::Write as _;

        let mut source = migrated_store()?;
        source.write_ingredient(&mk_ingredient("Butter", None, &[AllergenKind::Milk], &[]))?;

        let export_dir = std::env::temp_dir().join(format!("allergens-export-{}", Ulid::new()));
        source.export_snapshot(&export_dir)?;

        let ingredients_path = export_dir.join(INGREDIENTS_FILE);
        let mut tampered = fs::OpenOptions::new().append(true).open(&ingredients_path)?;
        writeln!(tampered, "{{\"tampered\":true}}")?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir, true) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for ingredients.ndjson"));
        assert!(target.list_ingredients()?.is_empty());

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }
}

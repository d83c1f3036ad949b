use std::fs;
use std::path::PathBuf;

use allergen_core::{
    list_allergens, summarize, AllergenKind, AllergenOverrideSet, Ingredient, IngredientId, Recipe,
    RecipeId, RecipeIngredientLine,
};
use allergen_store_sqlite::{IngredientFilter, SqliteStore};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod export;
mod label;
mod sample;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "allergens")]
#[command(about = "UK allergen disclosure CLI")]
struct Cli {
    #[arg(long, env = "ALLERGENS_DB", default_value = "./allergens.sqlite3")]
    db: PathBuf,

    /// Log filter directive written to stderr, e.g. `info` or `allergen_store_sqlite=debug`.
    #[arg(long, env = "ALLERGENS_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Ingredient {
        #[command(subcommand)]
        command: Box<IngredientCommand>,
    },
    Recipe {
        #[command(subcommand)]
        command: Box<RecipeCommand>,
    },
    Dashboard,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Seed,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum IngredientCommand {
    Add(IngredientAddArgs),
    List(IngredientListArgs),
    Show(IdArgs),
    Delete(IdArgs),
    ExportCsv(OutFileArgs),
}

#[derive(Debug, Args)]
struct IngredientAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    supplier: Option<String>,
    #[arg(long, value_delimiter = ',', value_parser = parse_allergen)]
    contains: Vec<AllergenKind>,
    #[arg(long, value_delimiter = ',', value_parser = parse_allergen)]
    may_contain: Vec<AllergenKind>,
}

#[derive(Debug, Args)]
struct IngredientListArgs {
    #[arg(long)]
    search: Option<String>,
    #[arg(long, value_parser = parse_allergen)]
    allergen: Option<AllergenKind>,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct OutFileArgs {
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum RecipeCommand {
    Add(RecipeAddArgs),
    List,
    Show(IdArgs),
    Delete(IdArgs),
    Overrides(RecipeOverridesArgs),
    Disclose(IdArgs),
    Label(RecipeLabelArgs),
}

#[derive(Debug, Args)]
struct RecipeAddArgs {
    #[arg(long)]
    name: String,
    /// Ingredient line as `INGREDIENT_ID:QUANTITY:UNIT`; repeat for each line.
    #[arg(long = "line", required = true)]
    lines: Vec<String>,
}

#[derive(Debug, Args)]
struct RecipeOverridesArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_delimiter = ',', value_parser = parse_allergen)]
    contains: Vec<AllergenKind>,
    #[arg(long, value_delimiter = ',', value_parser = parse_allergen)]
    may_contain: Vec<AllergenKind>,
    /// Audit reason, applied to every asserted allergen.
    #[arg(long, default_value = "")]
    reason: String,
}

#[derive(Debug, Args)]
struct RecipeLabelArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    out: Option<PathBuf>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log filter: {log_level}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    tracing::debug!(db = %cli.db.display(), "allergens cli starting");

    match cli.command {
        Command::Catalog { command } => run_catalog(&command),
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Ingredient { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_ingredient(*command, &mut store)
        }
        Command::Recipe { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_recipe(*command, &mut store)
        }
        Command::Dashboard => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_dashboard(&mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Seed => run_db_seed(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_seed(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    if !store.list_ingredients()?.is_empty() || !store.list_recipes()?.is_empty() {
        return Err(anyhow!("seed requires an empty database"));
    }

    let ingredients = sample::sample_ingredients();
    for ingredient in &ingredients {
        store.write_ingredient(ingredient)?;
    }
    let recipe = sample::sample_recipe(&ingredients);
    store.write_recipe(&recipe)?;

    emit_json(serde_json::json!({
        "seeded_ingredients": ingredients.len(),
        "seeded_recipes": 1,
        "recipe_id": recipe.id.to_string()
    }))
}

fn run_catalog(command: &CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::List => {
            let allergens = list_allergens()
                .iter()
                .map(|kind| {
                    serde_json::json!({
                        "id": kind.as_str(),
                        "label": kind.label(),
                        "short_label": kind.short_label()
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "allergens": allergens }))
        }
    }
}

fn run_ingredient(command: IngredientCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        IngredientCommand::Add(args) => {
            let mut ingredient = Ingredient::new(args.name.trim())
                .with_allergens(args.contains)
                .with_may_contain(args.may_contain);
            ingredient.supplier_name = args
                .supplier
                .map(|supplier| supplier.trim().to_string())
                .filter(|supplier| !supplier.is_empty());

            store.write_ingredient(&ingredient)?;
            emit_json(serde_json::to_value(&ingredient).context("failed to serialize ingredient")?)
        }
        IngredientCommand::List(args) => {
            let filter = IngredientFilter { text: args.search, allergen: args.allergen };
            let ingredients = store.search_ingredients(&filter)?;
            emit_json(serde_json::json!({ "ingredients": ingredients }))
        }
        IngredientCommand::Show(args) => {
            let ingredient_id = parse_ingredient_id(&args.id)?;
            let ingredient = store
                .get_ingredient(ingredient_id)?
                .ok_or_else(|| anyhow!("ingredient not found: {ingredient_id}"))?;
            emit_json(serde_json::to_value(&ingredient).context("failed to serialize ingredient")?)
        }
        IngredientCommand::Delete(args) => {
            let ingredient_id = parse_ingredient_id(&args.id)?;
            let deleted = store.delete_ingredient(ingredient_id)?;
            emit_json(serde_json::json!({
                "ingredient_id": ingredient_id.to_string(),
                "deleted": deleted
            }))
        }
        IngredientCommand::ExportCsv(args) => {
            let ingredients = store.list_ingredients()?;
            let csv = export::ingredients_csv(&ingredients);
            match args.out {
                Some(out) => {
                    fs::write(&out, format!("{csv}\n"))
                        .with_context(|| format!("failed to write CSV file {}", out.display()))?;
                    emit_json(serde_json::json!({
                        "out_file": out,
                        "rows": ingredients.len()
                    }))
                }
                None => {
                    println!("{csv}");
                    Ok(())
                }
            }
        }
    }
}

fn run_recipe(command: RecipeCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        RecipeCommand::Add(args) => {
            let lines =
                args.lines.iter().map(|raw| parse_recipe_line(raw)).collect::<Result<Vec<_>>>()?;
            for line in &lines {
                if store.get_ingredient(line.ingredient_id)?.is_none() {
                    return Err(anyhow!("ingredient not found: {}", line.ingredient_id));
                }
            }

            let recipe = Recipe::new(args.name.trim(), lines);
            store.write_recipe(&recipe)?;
            emit_json(serde_json::to_value(&recipe).context("failed to serialize recipe")?)
        }
        RecipeCommand::List => {
            let recipes = store.list_recipes()?;
            emit_json(serde_json::json!({ "recipes": recipes }))
        }
        RecipeCommand::Show(args) => {
            let recipe = load_recipe(store, &args.id)?;
            emit_json(serde_json::to_value(&recipe).context("failed to serialize recipe")?)
        }
        RecipeCommand::Delete(args) => {
            let recipe_id = parse_recipe_id(&args.id)?;
            let deleted = store.delete_recipe(recipe_id)?;
            emit_json(serde_json::json!({
                "recipe_id": recipe_id.to_string(),
                "deleted": deleted
            }))
        }
        RecipeCommand::Overrides(args) => {
            let recipe_id = parse_recipe_id(&args.id)?;
            let asserted = !args.contains.is_empty() || !args.may_contain.is_empty();
            if asserted && args.reason.trim().is_empty() {
                return Err(anyhow!("--reason MUST be provided when asserting override allergens"));
            }

            let overrides = AllergenOverrideSet::with_shared_reason(
                args.contains,
                args.may_contain,
                &args.reason,
            );
            let entry = store.save_overrides(recipe_id, &overrides, &args.reason)?;
            let disclosure = store.recipe_disclosure(recipe_id)?;
            emit_json(serde_json::json!({
                "recipe_id": recipe_id.to_string(),
                "overrides": overrides,
                "audit_entry": entry,
                "ignored_overrides": disclosure.resolution.ignored_overrides
            }))
        }
        RecipeCommand::Disclose(args) => {
            let recipe_id = parse_recipe_id(&args.id)?;
            let disclosure = store.recipe_disclosure(recipe_id)?;
            emit_json(serde_json::to_value(&disclosure).context("failed to serialize disclosure")?)
        }
        RecipeCommand::Label(args) => {
            let recipe_id = parse_recipe_id(&args.id)?;
            let disclosure = store.recipe_disclosure(recipe_id)?;
            let html = label::render_label(&disclosure, OffsetDateTime::now_utc().date())?;
            match args.out {
                Some(out) => {
                    fs::write(&out, &html)
                        .with_context(|| format!("failed to write label file {}", out.display()))?;
                    emit_json(serde_json::json!({
                        "recipe_id": recipe_id.to_string(),
                        "out_file": out
                    }))
                }
                None => {
                    println!("{html}");
                    Ok(())
                }
            }
        }
    }
}

fn run_dashboard(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let ingredients = store.list_ingredients()?;
    let total_recipes = store.list_recipes()?.len();
    let summary = summarize(&ingredients);

    let mut value = serde_json::to_value(&summary).context("failed to serialize summary")?;
    if let Value::Object(object) = &mut value {
        object.insert("total_recipes".to_string(), Value::from(total_recipes));
    }
    emit_json(value)
}

fn load_recipe(store: &SqliteStore, raw_id: &str) -> Result<Recipe> {
    let recipe_id = parse_recipe_id(raw_id)?;
    store.get_recipe(recipe_id)?.ok_or_else(|| anyhow!("recipe not found: {recipe_id}"))
}

fn parse_allergen(raw: &str) -> std::result::Result<AllergenKind, String> {
    raw.trim().parse::<AllergenKind>().map_err(|err| err.to_string())
}

fn parse_ingredient_id(raw: &str) -> Result<IngredientId> {
    raw.parse::<IngredientId>().with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_recipe_id(raw: &str) -> Result<RecipeId> {
    raw.parse::<RecipeId>().with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_recipe_line(raw: &str) -> Result<RecipeIngredientLine> {
    let mut parts = raw.splitn(3, ':');
    let (Some(id), Some(quantity), Some(unit)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("invalid --line `{raw}`; expected INGREDIENT_ID:QUANTITY:UNIT"));
    };

    let quantity = quantity
        .trim()
        .parse::<f64>()
        .with_context(|| format!("invalid quantity in --line `{raw}`"))?;
    let line = RecipeIngredientLine::new(parse_ingredient_id(id.trim())?, quantity, unit.trim());
    line.validate().map_err(|err| anyhow!("invalid --line `{raw}`: {err}"))?;
    Ok(line)
}

use allergen_core::{DisclosureEntry, RecipeDisclosure};
use anyhow::{Context, Result};
use askama::Template;
use time::Date;

/// Printable allergen label for one recipe.
#[derive(Template)]
#[template(path = "label.html")]
struct LabelTemplate {
    product_name: String,
    ingredient_names: Vec<String>,
    contains: Vec<&'static str>,
    may_contain: Vec<&'static str>,
    generated_on: String,
}

/// Render the final disclosure as an HTML label using full allergen labels.
///
/// # Errors
/// Returns an error when the template fails to render.
pub fn render_label(disclosure: &RecipeDisclosure, generated_on: Date) -> Result<String> {
    let resolved = &disclosure.resolution.resolved;
    LabelTemplate {
        product_name: disclosure.recipe_name.clone(),
        ingredient_names: disclosure.ingredient_names.clone(),
        contains: resolved.contains.iter().map(DisclosureEntry::full_label).collect(),
        may_contain: resolved.may_contain.iter().map(DisclosureEntry::full_label).collect(),
        generated_on: format_uk_date(generated_on),
    }
    .render()
    .context("failed to render label template")
}

/// `dd/mm/yyyy`
#[must_use]
pub fn format_uk_date(date: Date) -> String {
    format!("{:02}/{:02}/{:04}", date.day(), u8::from(date.month()), date.year())
}

use allergen_core::{AllergenFlagSet, Ingredient};

const CSV_HEADER: &str = "Ingredient Name,Supplier,Contains Allergens,May Contain";

/// Render ingredients as CSV, one row per ingredient in the given order.
///
/// Data cells are always double-quoted. Allergen cells list short labels in
/// catalog order joined by `; `, or `None`.
#[must_use]
pub fn ingredients_csv(ingredients: &[Ingredient]) -> String {
    let mut lines = Vec::with_capacity(ingredients.len() + 1);
    lines.push(CSV_HEADER.to_string());

    for ingredient in ingredients {
        let cells = [
            ingredient.name.clone(),
            ingredient.supplier_name.clone().unwrap_or_default(),
            allergen_cell(&ingredient.allergens),
            allergen_cell(&ingredient.may_contain),
        ];
        lines.push(cells.iter().map(|cell| quote(cell)).collect::<Vec<_>>().join(","));
    }

    lines.join("\n")
}

fn allergen_cell(flags: &AllergenFlagSet) -> String {
    if flags.is_empty() {
        return "None".to_string();
    }
    flags.iter().map(|kind| kind.short_label()).collect::<Vec<_>>().join("; ")
}

fn quote(cell: &str) -> String {
    format!("\"{}\"", cell.replace('"', "\"\""))
}

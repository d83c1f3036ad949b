use allergen_core::{AllergenKind, Ingredient, Recipe, RecipeIngredientLine};

/// Demo inventory used by `db seed`.
#[must_use]
pub fn sample_ingredients() -> Vec<Ingredient> {
    vec![
        Ingredient::new("Plain Flour").with_supplier("Tesco").with_allergens([AllergenKind::Gluten]),
        Ingredient::new("Butter (Unsalted)")
            .with_supplier("Anchor")
            .with_allergens([AllergenKind::Milk]),
        Ingredient::new("Free Range Eggs")
            .with_supplier("Local Farm")
            .with_allergens([AllergenKind::Eggs]),
        Ingredient::new("Dark Chocolate Chips")
            .with_supplier("Cadbury")
            .with_allergens([AllergenKind::Milk, AllergenKind::Soya])
            .with_may_contain([AllergenKind::TreeNuts]),
        Ingredient::new("Almonds (Sliced)")
            .with_supplier("Brakes")
            .with_allergens([AllergenKind::TreeNuts])
            .with_may_contain([AllergenKind::Peanuts]),
    ]
}

/// Chocolate croissant built from the first four sample ingredients.
#[must_use]
pub fn sample_recipe(ingredients: &[Ingredient]) -> Recipe {
    let quantities = [(500.0, "g"), (200.0, "g"), (3.0, "pieces"), (100.0, "g")];
    let lines = ingredients
        .iter()
        .zip(quantities)
        .map(|(ingredient, (quantity, unit))| {
            RecipeIngredientLine::new(ingredient.id, quantity, unit)
        })
        .collect();
    Recipe::new("Chocolate Croissant", lines)
}

//! Database query functions for the recipe side of the schema: catalog
//! entries, recipes, steps, products, ingredients, and meals.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    HydratedMeal, HydratedRecipe, HydratedRecipeStep, HydratedRecipeStepIngredient, Meal,
    MealComponent, Recipe, RecipeStep, RecipeStepIngredient, RecipeStepProduct, ValidIngredient,
    ValidMeasurementUnit,
};

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Insert a catalog ingredient with its storage hints.
pub async fn insert_valid_ingredient(
    pool: &PgPool,
    name: &str,
    storage_instructions: &str,
    minimum_ideal_storage_temperature_in_celsius: Option<f64>,
) -> Result<ValidIngredient> {
    let ingredient = sqlx::query_as::<_, ValidIngredient>(
        "INSERT INTO valid_ingredients \
         (name, storage_instructions, minimum_ideal_storage_temperature_in_celsius) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(name)
    .bind(storage_instructions)
    .bind(minimum_ideal_storage_temperature_in_celsius)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert valid ingredient {:?}", name))?;

    Ok(ingredient)
}

/// Fetch a catalog ingredient by ID.
pub async fn get_valid_ingredient(pool: &PgPool, id: Uuid) -> Result<Option<ValidIngredient>> {
    let ingredient =
        sqlx::query_as::<_, ValidIngredient>("SELECT * FROM valid_ingredients WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch valid ingredient")?;

    Ok(ingredient)
}

/// Insert a catalog measurement unit.
pub async fn insert_valid_measurement_unit(
    pool: &PgPool,
    name: &str,
) -> Result<ValidMeasurementUnit> {
    let unit = sqlx::query_as::<_, ValidMeasurementUnit>(
        "INSERT INTO valid_measurement_units (name) VALUES ($1) RETURNING *",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert measurement unit {:?}", name))?;

    Ok(unit)
}

// ---------------------------------------------------------------------------
// Recipes
// ---------------------------------------------------------------------------

/// Insert a recipe shell. Steps are attached separately.
pub async fn insert_recipe(pool: &PgPool, name: &str) -> Result<Recipe> {
    let recipe = sqlx::query_as::<_, Recipe>("INSERT INTO recipes (name) VALUES ($1) RETURNING *")
        .bind(name)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to insert recipe {:?}", name))?;

    Ok(recipe)
}

/// Insert one recipe step.
pub async fn insert_recipe_step(
    pool: &PgPool,
    recipe_id: Uuid,
    step_index: i32,
    preparation_name: &str,
    minimum_estimated_time_in_seconds: Option<i64>,
    maximum_estimated_time_in_seconds: Option<i64>,
) -> Result<RecipeStep> {
    let step = sqlx::query_as::<_, RecipeStep>(
        "INSERT INTO recipe_steps \
         (belongs_to_recipe, step_index, preparation_name, \
          minimum_estimated_time_in_seconds, maximum_estimated_time_in_seconds) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(recipe_id)
    .bind(step_index)
    .bind(preparation_name)
    .bind(minimum_estimated_time_in_seconds)
    .bind(maximum_estimated_time_in_seconds)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert recipe step {step_index}"))?;

    Ok(step)
}

/// Parameters for inserting a recipe step product.
#[derive(Debug, Clone)]
pub struct NewRecipeStepProduct<'a> {
    pub belongs_to_recipe_step: Uuid,
    pub name: &'a str,
    pub product_type: &'a str,
    pub measurement_unit_id: Option<Uuid>,
    pub maximum_storage_duration_in_seconds: Option<i64>,
    pub minimum_storage_temperature_in_celsius: Option<f64>,
    pub maximum_storage_temperature_in_celsius: Option<f64>,
    pub storage_instructions: &'a str,
    pub compostable: bool,
}

/// Insert a step product.
pub async fn insert_recipe_step_product(
    pool: &PgPool,
    new: &NewRecipeStepProduct<'_>,
) -> Result<RecipeStepProduct> {
    let product = sqlx::query_as::<_, RecipeStepProduct>(
        "INSERT INTO recipe_step_products \
         (belongs_to_recipe_step, name, product_type, measurement_unit_id, \
          maximum_storage_duration_in_seconds, minimum_storage_temperature_in_celsius, \
          maximum_storage_temperature_in_celsius, storage_instructions, compostable) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.belongs_to_recipe_step)
    .bind(new.name)
    .bind(new.product_type)
    .bind(new.measurement_unit_id)
    .bind(new.maximum_storage_duration_in_seconds)
    .bind(new.minimum_storage_temperature_in_celsius)
    .bind(new.maximum_storage_temperature_in_celsius)
    .bind(new.storage_instructions)
    .bind(new.compostable)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert recipe step product {:?}", new.name))?;

    Ok(product)
}

/// Parameters for inserting a recipe step ingredient. Exactly one of
/// `valid_ingredient_id` and `recipe_step_product_id` must be set; the
/// table's check constraint enforces it.
#[derive(Debug, Clone)]
pub struct NewRecipeStepIngredient<'a> {
    pub belongs_to_recipe_step: Uuid,
    pub name: &'a str,
    pub valid_ingredient_id: Option<Uuid>,
    pub recipe_step_product_id: Option<Uuid>,
    pub measurement_unit_id: Uuid,
    pub minimum_quantity: f64,
    pub maximum_quantity: Option<f64>,
}

/// Insert a step ingredient.
pub async fn insert_recipe_step_ingredient(
    pool: &PgPool,
    new: &NewRecipeStepIngredient<'_>,
) -> Result<RecipeStepIngredient> {
    let ingredient = sqlx::query_as::<_, RecipeStepIngredient>(
        "INSERT INTO recipe_step_ingredients \
         (belongs_to_recipe_step, name, valid_ingredient_id, recipe_step_product_id, \
          measurement_unit_id, minimum_quantity, maximum_quantity) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.belongs_to_recipe_step)
    .bind(new.name)
    .bind(new.valid_ingredient_id)
    .bind(new.recipe_step_product_id)
    .bind(new.measurement_unit_id)
    .bind(new.minimum_quantity)
    .bind(new.maximum_quantity)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert recipe step ingredient {:?}", new.name))?;

    Ok(ingredient)
}

/// Fetch a recipe with its steps (ordered by `step_index`), each step's
/// ingredients (catalog entries attached), and products.
pub async fn get_recipe(pool: &PgPool, recipe_id: Uuid) -> Result<Option<HydratedRecipe>> {
    let recipe = sqlx::query_as::<_, Recipe>("SELECT * FROM recipes WHERE id = $1")
        .bind(recipe_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch recipe")?;

    let Some(recipe) = recipe else {
        return Ok(None);
    };

    let step_rows = sqlx::query_as::<_, RecipeStep>(
        "SELECT * FROM recipe_steps WHERE belongs_to_recipe = $1 ORDER BY step_index ASC",
    )
    .bind(recipe_id)
    .fetch_all(pool)
    .await
    .context("failed to list recipe steps")?;

    let mut steps = Vec::with_capacity(step_rows.len());
    for step in step_rows {
        let ingredient_rows = sqlx::query_as::<_, RecipeStepIngredient>(
            "SELECT * FROM recipe_step_ingredients \
             WHERE belongs_to_recipe_step = $1 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(step.id)
        .fetch_all(pool)
        .await
        .context("failed to list recipe step ingredients")?;

        let mut ingredients = Vec::with_capacity(ingredient_rows.len());
        for ingredient in ingredient_rows {
            let valid_ingredient = match ingredient.valid_ingredient_id {
                Some(id) => Some(get_valid_ingredient(pool, id).await?.with_context(|| {
                    format!("catalog ingredient {id} missing for step ingredient")
                })?),
                None => None,
            };
            ingredients.push(HydratedRecipeStepIngredient {
                ingredient,
                valid_ingredient,
            });
        }

        let products = sqlx::query_as::<_, RecipeStepProduct>(
            "SELECT * FROM recipe_step_products \
             WHERE belongs_to_recipe_step = $1 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(step.id)
        .fetch_all(pool)
        .await
        .context("failed to list recipe step products")?;

        steps.push(HydratedRecipeStep {
            step,
            ingredients,
            products,
        });
    }

    Ok(Some(HydratedRecipe { recipe, steps }))
}

// ---------------------------------------------------------------------------
// Meals
// ---------------------------------------------------------------------------

/// Insert a meal shell.
pub async fn insert_meal(pool: &PgPool, name: &str) -> Result<Meal> {
    let meal = sqlx::query_as::<_, Meal>("INSERT INTO meals (name) VALUES ($1) RETURNING *")
        .bind(name)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to insert meal {:?}", name))?;

    Ok(meal)
}

/// Tie a recipe into a meal.
pub async fn insert_meal_component(
    pool: &PgPool,
    meal_id: Uuid,
    recipe_id: Uuid,
) -> Result<MealComponent> {
    let component = sqlx::query_as::<_, MealComponent>(
        "INSERT INTO meal_components (belongs_to_meal, recipe_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(meal_id)
    .bind(recipe_id)
    .fetch_one(pool)
    .await
    .context("failed to insert meal component")?;

    Ok(component)
}

/// Fetch a meal with every component recipe hydrated.
pub async fn get_hydrated_meal(pool: &PgPool, meal_id: Uuid) -> Result<Option<HydratedMeal>> {
    let meal = sqlx::query_as::<_, Meal>("SELECT * FROM meals WHERE id = $1")
        .bind(meal_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch meal")?;

    let Some(meal) = meal else {
        return Ok(None);
    };

    let components = sqlx::query_as::<_, MealComponent>(
        "SELECT * FROM meal_components WHERE belongs_to_meal = $1 ORDER BY created_at ASC",
    )
    .bind(meal_id)
    .fetch_all(pool)
    .await
    .context("failed to list meal components")?;

    let mut recipes = Vec::with_capacity(components.len());
    for component in &components {
        let recipe = get_recipe(pool, component.recipe_id)
            .await?
            .with_context(|| format!("recipe {} missing for meal {meal_id}", component.recipe_id))?;
        recipes.push(recipe);
    }

    Ok(Some(HydratedMeal { meal, recipes }))
}

//! Grocery list derivation: aggregate catalog-ingredient demand across the
//! chosen options of a finalized plan.
//!
//! Only ingredient rows linked to a catalog entry count. Rows that consume
//! another step's product are intermediates, not purchases, and free-text
//! rows carry no identity to aggregate under; both are skipped. Demand is
//! keyed by (ingredient, unit) because units are only compatible when
//! identical.

use std::collections::BTreeMap;

use uuid::Uuid;

use mise_db::models::{
    GroceryListItemStatus, HydratedMealPlan, MealPlanGroceryListItemCreationInput,
};

/// Running quantity totals for one (ingredient, unit) pair.
#[derive(Debug, Clone, Copy, Default)]
struct Demand {
    minimum: f64,
    maximum: f64,
}

/// Derives grocery list rows from finalized plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroceryListCreator;

impl GroceryListCreator {
    /// Walk every chosen option's recipes and sum demand per
    /// (ingredient, unit) pair.
    ///
    /// An ingredient row with no maximum contributes its minimum to the
    /// maximum total, so the maximum never reads below the minimum. Rows
    /// come back ordered by ingredient then unit id, all with status
    /// `unknown`.
    pub fn generate_grocery_list_inputs(
        &self,
        plan: &HydratedMealPlan,
    ) -> Vec<MealPlanGroceryListItemCreationInput> {
        let mut demand: BTreeMap<(Uuid, Uuid), Demand> = BTreeMap::new();

        for option in plan.chosen_options() {
            let Some(meal) = &option.meal else {
                continue;
            };
            for recipe in &meal.recipes {
                for step in &recipe.steps {
                    for ingredient in &step.ingredients {
                        let row = &ingredient.ingredient;
                        if row.recipe_step_product_id.is_some() {
                            continue;
                        }
                        let Some(ingredient_id) = row.valid_ingredient_id else {
                            continue;
                        };

                        let entry = demand
                            .entry((ingredient_id, row.measurement_unit_id))
                            .or_default();
                        entry.minimum += row.minimum_quantity;
                        entry.maximum += row.maximum_quantity.unwrap_or(row.minimum_quantity);
                    }
                }
            }
        }

        demand
            .into_iter()
            .map(|((ingredient_id, unit_id), totals)| MealPlanGroceryListItemCreationInput {
                valid_ingredient_id: ingredient_id,
                valid_measurement_unit_id: unit_id,
                minimum_quantity_needed: totals.minimum,
                maximum_quantity_needed: totals.maximum,
                status: GroceryListItemStatus::Unknown,
            })
            .collect()
    }
}

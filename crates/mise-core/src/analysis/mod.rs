//! Recipe graph analysis: which steps of a recipe can be done ahead of the
//! meal, and inside what time window.
//!
//! Steps form a DAG: an edge runs from the step that produces a product to
//! the step that consumes it (via `recipe_step_product_id` on an
//! ingredient). The analyzer validates the graph (Kahn's algorithm, ready
//! steps processed in `step_index` order), classifies each step for advance
//! eligibility, and emits one task creation input per eligible step. Output
//! is ordered by `step_index`; the topological pass is validation only.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use mise_db::models::{HydratedRecipe, HydratedRecipeStep, MealPlanTaskCreationInput};

use crate::error::WorkerError;

/// Errors that make a recipe graph unusable for task generation.
#[derive(Debug, Error)]
pub enum RecipeGraphError {
    #[error("recipe {recipe_id} has a dependency cycle involving steps {step_indices:?}")]
    CycleDetected {
        recipe_id: Uuid,
        step_indices: Vec<i32>,
    },

    #[error(
        "recipe {recipe_id} step {step_index} consumes product {product_id}, \
         which no step of this recipe produces"
    )]
    DanglingProductReference {
        recipe_id: Uuid,
        step_index: i32,
        product_id: Uuid,
    },
}

impl From<RecipeGraphError> for WorkerError {
    fn from(err: RecipeGraphError) -> Self {
        let recipe_id = match &err {
            RecipeGraphError::CycleDetected { recipe_id, .. } => *recipe_id,
            RecipeGraphError::DanglingProductReference { recipe_id, .. } => *recipe_id,
        };
        WorkerError::InvalidRecipe {
            recipe_id,
            reason: err.to_string(),
        }
    }
}

/// Tuning knobs for advance-eligibility classification.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Preparation names that are inherently advance work, lowercased.
    pub advance_preparation_names: HashSet<String>,
    /// A step's products must all keep at least this long for the step to
    /// count as advance-eligible on storage grounds.
    pub min_advance_window_seconds: i64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        let advance_preparation_names = ["thaw", "marinate", "soak", "rest", "proof", "chill", "freeze"]
            .into_iter()
            .map(str::to_string)
            .collect();
        Self {
            advance_preparation_names,
            min_advance_window_seconds: 3600,
        }
    }
}

/// Why a step qualified for advance preparation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Eligibility {
    /// The preparation itself is advance work (thaw, marinate, ...).
    AdvancePreparation,
    /// Every product of the step stores long enough to bridge to the meal.
    StorableProducts,
    /// A raw ingredient arrives frozen and needs lead time.
    FrozenIngredient { ingredient_name: String },
}

/// Derives advance prep tasks from hydrated recipes.
#[derive(Debug, Clone, Default)]
pub struct RecipeAnalyzer {
    config: AnalyzerConfig,
}

impl RecipeAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze one recipe for one chosen option and emit task inputs for
    /// every advance-eligible step.
    ///
    /// `event_starts_at` is when the meal is served: every emitted window is
    /// anchored to it. A step that is not eligible is skipped without
    /// affecting its producers or consumers.
    pub fn generate_meal_plan_tasks(
        &self,
        recipe: &HydratedRecipe,
        meal_plan_option_id: Uuid,
        event_starts_at: DateTime<Utc>,
    ) -> Result<Vec<MealPlanTaskCreationInput>, RecipeGraphError> {
        // Work over steps sorted by index; positions in this vec are the
        // graph's node ids.
        let mut steps: Vec<&HydratedRecipeStep> = recipe.steps.iter().collect();
        steps.sort_by_key(|s| s.step.step_index);

        validate_step_graph(recipe.recipe.id, &steps)?;

        let mut tasks = Vec::new();
        for step in &steps {
            let Some(reason) = self.classify(step) else {
                continue;
            };

            let storage_bound = step
                .products
                .iter()
                .filter_map(|p| p.maximum_storage_duration_in_seconds)
                .min();
            let min_estimated = step.step.minimum_estimated_time_in_seconds.unwrap_or(0);

            tasks.push(MealPlanTaskCreationInput {
                meal_plan_option_id,
                recipe_step_id: step.step.id,
                creation_explanation: explanation(step, &reason),
                cannot_complete_before: storage_bound
                    .map(|seconds| event_starts_at - Duration::seconds(seconds)),
                cannot_complete_after: Some(event_starts_at - Duration::seconds(min_estimated)),
            });
        }

        Ok(tasks)
    }

    /// Apply the three eligibility rules in order; the first match names the
    /// reason used in the task explanation.
    fn classify(&self, step: &HydratedRecipeStep) -> Option<Eligibility> {
        let preparation = step.step.preparation_name.trim().to_lowercase();
        if self.config.advance_preparation_names.contains(&preparation) {
            return Some(Eligibility::AdvancePreparation);
        }

        let all_products_storable = !step.products.is_empty()
            && step.products.iter().all(|product| {
                let keeps_long_enough = product
                    .maximum_storage_duration_in_seconds
                    .is_some_and(|d| d >= self.config.min_advance_window_seconds);
                let storage_defined = !product.storage_instructions.trim().is_empty()
                    || product.minimum_storage_temperature_in_celsius.is_some()
                    || product.maximum_storage_temperature_in_celsius.is_some();
                keeps_long_enough && storage_defined
            });
        if all_products_storable {
            return Some(Eligibility::StorableProducts);
        }

        for ingredient in &step.ingredients {
            let Some(catalog) = &ingredient.valid_ingredient else {
                continue;
            };
            let frozen_by_instructions =
                catalog.storage_instructions.to_lowercase().contains("frozen");
            let frozen_by_temperature = catalog
                .minimum_ideal_storage_temperature_in_celsius
                .is_some_and(|t| t < 0.0);
            if frozen_by_instructions || frozen_by_temperature {
                return Some(Eligibility::FrozenIngredient {
                    ingredient_name: catalog.name.clone(),
                });
            }
        }

        None
    }
}

/// Human explanation for the task row, always naming the preparation.
fn explanation(step: &HydratedRecipeStep, reason: &Eligibility) -> String {
    let preparation = step.step.preparation_name.trim();
    match reason {
        Eligibility::AdvancePreparation => {
            format!("{preparation} can be done ahead of the meal")
        }
        Eligibility::StorableProducts => {
            let names: Vec<&str> = step.products.iter().map(|p| p.name.as_str()).collect();
            format!(
                "{preparation} produces {}, which keeps until the meal",
                names.join(", ")
            )
        }
        Eligibility::FrozenIngredient { ingredient_name } => {
            format!("{preparation} uses {ingredient_name} stored frozen; thaw ahead of the meal")
        }
    }
}

/// Check that product references stay inside the recipe and the step graph
/// is acyclic (Kahn's algorithm, ready steps taken in `step_index` order).
fn validate_step_graph(
    recipe_id: Uuid,
    steps: &[&HydratedRecipeStep],
) -> Result<(), RecipeGraphError> {
    let mut producer_of: HashMap<Uuid, usize> = HashMap::new();
    for (position, step) in steps.iter().enumerate() {
        for product in &step.products {
            producer_of.insert(product.id, position);
        }
    }

    let n = steps.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (consumer, step) in steps.iter().enumerate() {
        for ingredient in &step.ingredients {
            let Some(product_id) = ingredient.ingredient.recipe_step_product_id else {
                continue;
            };
            let Some(&producer) = producer_of.get(&product_id) else {
                return Err(RecipeGraphError::DanglingProductReference {
                    recipe_id,
                    step_index: step.step.step_index,
                    product_id,
                });
            };
            adj[producer].push(consumer);
            in_degree[consumer] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted_count = 0usize;
    while let Some(node) = ready.pop_first() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                ready.insert(neighbor);
            }
        }
    }

    if sorted_count != n {
        let mut step_indices: Vec<i32> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| steps[i].step.step_index)
            .collect();
        step_indices.sort_unstable();
        return Err(RecipeGraphError::CycleDetected {
            recipe_id,
            step_indices,
        });
    }

    Ok(())
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a meal plan.
///
/// Plans are created in `awaiting_votes`, move to `finalized` exactly once
/// (via the lifecycle worker), and can be archived from either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MealPlanStatus {
    AwaitingVotes,
    Finalized,
    Archived,
}

impl fmt::Display for MealPlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingVotes => "awaiting_votes",
            Self::Finalized => "finalized",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for MealPlanStatus {
    type Err = MealPlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_votes" => Ok(Self::AwaitingVotes),
            "finalized" => Ok(Self::Finalized),
            "archived" => Ok(Self::Archived),
            other => Err(MealPlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MealPlanStatus`] string.
#[derive(Debug, Clone)]
pub struct MealPlanStatusParseError(pub String);

impl fmt::Display for MealPlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid meal plan status: {:?}", self.0)
    }
}

impl std::error::Error for MealPlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a derived prep task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MealPlanTaskStatus {
    Unfinished,
    Postponed,
    Ignored,
    Canceled,
    Finished,
}

impl fmt::Display for MealPlanTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unfinished => "unfinished",
            Self::Postponed => "postponed",
            Self::Ignored => "ignored",
            Self::Canceled => "canceled",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

impl FromStr for MealPlanTaskStatus {
    type Err = MealPlanTaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unfinished" => Ok(Self::Unfinished),
            "postponed" => Ok(Self::Postponed),
            "ignored" => Ok(Self::Ignored),
            "canceled" => Ok(Self::Canceled),
            "finished" => Ok(Self::Finished),
            other => Err(MealPlanTaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MealPlanTaskStatus`] string.
#[derive(Debug, Clone)]
pub struct MealPlanTaskStatusParseError(pub String);

impl fmt::Display for MealPlanTaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid meal plan task status: {:?}", self.0)
    }
}

impl std::error::Error for MealPlanTaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a grocery list item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GroceryListItemStatus {
    Unknown,
    Acquired,
    Unavailable,
}

impl fmt::Display for GroceryListItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Acquired => "acquired",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

impl FromStr for GroceryListItemStatus {
    type Err = GroceryListItemStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "acquired" => Ok(Self::Acquired),
            "unavailable" => Ok(Self::Unavailable),
            other => Err(GroceryListItemStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GroceryListItemStatus`] string.
#[derive(Debug, Clone)]
pub struct GroceryListItemStatusParseError(pub String);

impl fmt::Display for GroceryListItemStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid grocery list item status: {:?}", self.0)
    }
}

impl std::error::Error for GroceryListItemStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A household -- the voting population for its meal plans.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Household {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A household member.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub belongs_to_household: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A catalog ingredient with storage hints used by the recipe analyzer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ValidIngredient {
    pub id: Uuid,
    pub name: String,
    pub storage_instructions: String,
    pub minimum_ideal_storage_temperature_in_celsius: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// A catalog measurement unit. Units are compatible only when identical.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ValidMeasurementUnit {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A recipe. Steps are ordered by `step_index` and form a DAG through
/// product references.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A single step of a recipe.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipeStep {
    pub id: Uuid,
    pub belongs_to_recipe: Uuid,
    pub step_index: i32,
    pub preparation_name: String,
    pub minimum_estimated_time_in_seconds: Option<i64>,
    pub maximum_estimated_time_in_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Something a recipe step produces, possibly consumed by a later step.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipeStepProduct {
    pub id: Uuid,
    pub belongs_to_recipe_step: Uuid,
    pub name: String,
    pub product_type: String,
    pub measurement_unit_id: Option<Uuid>,
    pub maximum_storage_duration_in_seconds: Option<i64>,
    pub minimum_storage_temperature_in_celsius: Option<f64>,
    pub maximum_storage_temperature_in_celsius: Option<f64>,
    pub storage_instructions: String,
    pub compostable: bool,
    pub created_at: DateTime<Utc>,
}

/// An input to a recipe step: either a raw catalog ingredient
/// (`valid_ingredient_id` set) or the product of an earlier step
/// (`recipe_step_product_id` set). Exactly one of the two is present.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipeStepIngredient {
    pub id: Uuid,
    pub belongs_to_recipe_step: Uuid,
    pub name: String,
    pub valid_ingredient_id: Option<Uuid>,
    pub recipe_step_product_id: Option<Uuid>,
    pub measurement_unit_id: Uuid,
    pub minimum_quantity: f64,
    pub maximum_quantity: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// A meal -- a named set of recipes served together.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Meal {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Join row tying a recipe into a meal.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealComponent {
    pub id: Uuid,
    pub belongs_to_meal: Uuid,
    pub recipe_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A meal plan -- the top-level unit the workflow drives.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealPlan {
    pub id: Uuid,
    pub belongs_to_household: Uuid,
    pub status: MealPlanStatus,
    /// Voting window.
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Monotone: set once by the task materializer, never reset.
    pub tasks_created: bool,
    /// Monotone: set once by the grocery list materializer, never reset.
    pub grocery_list_initialized: bool,
    pub created_at: DateTime<Utc>,
}

/// A meal occasion within a plan (e.g. Wednesday dinner).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealPlanEvent {
    pub id: Uuid,
    pub belongs_to_meal_plan: Uuid,
    /// When the meal is served; prep-task windows hang off this instant.
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A candidate meal for an event. Exactly one option per event is chosen at
/// finalization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealPlanOption {
    pub id: Uuid,
    pub belongs_to_meal_plan_event: Uuid,
    pub meal_id: Uuid,
    pub chosen: bool,
    pub created_at: DateTime<Utc>,
}

/// A household member's vote on an option. A non-abstaining vote counts as a
/// positive vote for the option.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealPlanOptionVote {
    pub id: Uuid,
    pub belongs_to_meal_plan_option: Uuid,
    pub by_user: Uuid,
    pub abstain: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// A derived prep task: one advance-preparable recipe step for one chosen
/// option. Unique per (option, step) for the plan's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealPlanTask {
    pub id: Uuid,
    pub belongs_to_meal_plan_option: Uuid,
    pub recipe_step_id: Uuid,
    pub creation_explanation: String,
    pub status: MealPlanTaskStatus,
    pub status_explanation: String,
    /// Earliest the task may be done; `None` means unbounded (no storage
    /// limit applies).
    pub cannot_complete_before: Option<DateTime<Utc>>,
    /// Latest the task may be done and still leave the estimated prep time
    /// before the meal.
    pub cannot_complete_after: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_to_user: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A derived grocery list row: aggregated demand for one (ingredient, unit)
/// pair across all chosen options of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MealPlanGroceryListItem {
    pub id: Uuid,
    pub belongs_to_meal_plan: Uuid,
    pub valid_ingredient_id: Uuid,
    pub valid_measurement_unit_id: Uuid,
    pub minimum_quantity_needed: f64,
    pub maximum_quantity_needed: f64,
    pub status: GroceryListItemStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Creation inputs
// ---------------------------------------------------------------------------

/// Input for one derived prep task, produced by the recipe analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanTaskCreationInput {
    pub meal_plan_option_id: Uuid,
    pub recipe_step_id: Uuid,
    pub creation_explanation: String,
    pub cannot_complete_before: Option<DateTime<Utc>>,
    pub cannot_complete_after: Option<DateTime<Utc>>,
}

/// Input for one grocery list row, produced by the grocery list creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanGroceryListItemCreationInput {
    pub valid_ingredient_id: Uuid,
    pub valid_measurement_unit_id: Uuid,
    pub minimum_quantity_needed: f64,
    pub maximum_quantity_needed: f64,
    pub status: GroceryListItemStatus,
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// One chosen option of a finalized plan whose event falls inside the task
/// materializer's lookahead window, with the recipes backing its meal.
#[derive(Debug, Clone, FromRow)]
pub struct FinalizedMealPlanResult {
    pub meal_plan_id: Uuid,
    pub household_id: Uuid,
    pub meal_plan_event_id: Uuid,
    pub meal_plan_option_id: Uuid,
    pub meal_id: Uuid,
    pub recipe_ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Hydrated composites
// ---------------------------------------------------------------------------
//
// The analyzer and the grocery creator walk whole object trees; the query
// layer assembles these from the flat rows above.

/// A recipe step with its ingredients (catalog data attached) and products.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedRecipeStep {
    pub step: RecipeStep,
    pub ingredients: Vec<HydratedRecipeStepIngredient>,
    pub products: Vec<RecipeStepProduct>,
}

/// A step ingredient joined with its catalog entry when it is a raw
/// ingredient (`valid_ingredient` is `None` for product references).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedRecipeStepIngredient {
    pub ingredient: RecipeStepIngredient,
    pub valid_ingredient: Option<ValidIngredient>,
}

/// A recipe with all steps, ordered by `step_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedRecipe {
    pub recipe: Recipe,
    pub steps: Vec<HydratedRecipeStep>,
}

/// A meal with the recipes of all its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedMeal {
    pub meal: Meal,
    pub recipes: Vec<HydratedRecipe>,
}

/// An option, with its meal hydrated only when the option was chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedMealPlanOption {
    pub option: MealPlanOption,
    pub meal: Option<HydratedMeal>,
}

/// An event with all its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedMealPlanEvent {
    pub event: MealPlanEvent,
    pub options: Vec<HydratedMealPlanOption>,
}

/// A plan with its full event/option/meal/recipe tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedMealPlan {
    pub meal_plan: MealPlan,
    pub events: Vec<HydratedMealPlanEvent>,
}

impl HydratedMealPlan {
    /// Iterate over the chosen options across all events.
    pub fn chosen_options(&self) -> impl Iterator<Item = &HydratedMealPlanOption> {
        self.events
            .iter()
            .flat_map(|e| e.options.iter())
            .filter(|o| o.option.chosen)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meal_plan_status_display_roundtrip() {
        let variants = [
            MealPlanStatus::AwaitingVotes,
            MealPlanStatus::Finalized,
            MealPlanStatus::Archived,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: MealPlanStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn meal_plan_status_invalid() {
        let result = "bogus".parse::<MealPlanStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn meal_plan_task_status_display_roundtrip() {
        let variants = [
            MealPlanTaskStatus::Unfinished,
            MealPlanTaskStatus::Postponed,
            MealPlanTaskStatus::Ignored,
            MealPlanTaskStatus::Canceled,
            MealPlanTaskStatus::Finished,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: MealPlanTaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn meal_plan_task_status_invalid() {
        let result = "done".parse::<MealPlanTaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn grocery_list_item_status_display_roundtrip() {
        let variants = [
            GroceryListItemStatus::Unknown,
            GroceryListItemStatus::Acquired,
            GroceryListItemStatus::Unavailable,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: GroceryListItemStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn grocery_list_item_status_invalid() {
        let result = "bought".parse::<GroceryListItemStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn awaiting_votes_serializes_snake_case() {
        let json = serde_json::to_string(&MealPlanStatus::AwaitingVotes).unwrap();
        assert_eq!(json, "\"awaiting_votes\"");
    }

    #[test]
    fn chosen_options_filters_unchosen() {
        let now = Utc::now();
        let mk_option = |chosen| HydratedMealPlanOption {
            option: MealPlanOption {
                id: Uuid::new_v4(),
                belongs_to_meal_plan_event: Uuid::new_v4(),
                meal_id: Uuid::new_v4(),
                chosen,
                created_at: now,
            },
            meal: None,
        };
        let plan = HydratedMealPlan {
            meal_plan: MealPlan {
                id: Uuid::new_v4(),
                belongs_to_household: Uuid::new_v4(),
                status: MealPlanStatus::Finalized,
                starts_at: now,
                ends_at: now,
                tasks_created: false,
                grocery_list_initialized: false,
                created_at: now,
            },
            events: vec![HydratedMealPlanEvent {
                event: MealPlanEvent {
                    id: Uuid::new_v4(),
                    belongs_to_meal_plan: Uuid::new_v4(),
                    starts_at: now,
                    ends_at: now,
                    created_at: now,
                },
                options: vec![mk_option(true), mk_option(false), mk_option(true)],
            }],
        };

        assert_eq!(plan.chosen_options().count(), 2);
    }
}

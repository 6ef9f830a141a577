//! Query functions, grouped by table family.

pub mod grocery_list_items;
pub mod meal_plan_tasks;
pub mod meal_plans;
pub mod recipes;

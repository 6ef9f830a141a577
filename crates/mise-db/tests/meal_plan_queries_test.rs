//! Integration tests for the discovery queries the tick handlers run:
//! expired voting windows, the task materializer's lookahead listing,
//! grocery list discovery with full hydration, and the lifecycle flags.

use chrono::{Duration, Utc};
use uuid::Uuid;

use mise_db::models::MealPlanStatus;
use mise_db::queries::meal_plans::{self, FinalizeOptions};
use mise_db::queries::recipes;
use mise_test_utils::{create_test_db, drop_test_db, seed_household, seed_meal_for_recipe};

/// A finalized plan with one event, one chosen option (a meal of two
/// recipes), and one losing option.
struct FinalizedPlan {
    household_id: Uuid,
    plan_id: Uuid,
    event_id: Uuid,
    chosen_option_id: Uuid,
    meal_id: Uuid,
    recipe_ids: Vec<Uuid>,
}

async fn seed_finalized_plan(pool: &sqlx::PgPool, event_offset: Duration) -> FinalizedPlan {
    let (household, voter) = seed_household(pool).await;

    let now = Utc::now();
    let plan = meal_plans::insert_meal_plan(
        pool,
        household.id,
        now - Duration::days(3),
        now - Duration::hours(1),
    )
    .await
    .expect("insert plan");
    let event = meal_plans::insert_meal_plan_event(
        pool,
        plan.id,
        now + event_offset,
        now + event_offset + Duration::hours(1),
    )
    .await
    .expect("insert event");

    let recipe_a = recipes::insert_recipe(pool, "braised greens").await.expect("insert recipe a");
    let recipe_b = recipes::insert_recipe(pool, "cornbread").await.expect("insert recipe b");
    let meal = seed_meal_for_recipe(pool, "weeknight dinner", recipe_a.id).await;
    recipes::insert_meal_component(pool, meal.id, recipe_b.id)
        .await
        .expect("insert second component");

    let decoy_meal = recipes::insert_meal(pool, "decoy").await.expect("insert decoy meal");
    let target = meal_plans::insert_meal_plan_option(pool, event.id, meal.id)
        .await
        .expect("insert target option");
    meal_plans::insert_meal_plan_option(pool, event.id, decoy_meal.id)
        .await
        .expect("insert decoy option");

    meal_plans::insert_meal_plan_option_vote(pool, target.id, voter.id, false, "")
        .await
        .expect("vote");
    let changed = meal_plans::attempt_to_finalize_meal_plan(
        pool,
        plan.id,
        household.id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(changed, "fixture plan should finalize");

    FinalizedPlan {
        household_id: household.id,
        plan_id: plan.id,
        event_id: event.id,
        chosen_option_id: target.id,
        meal_id: meal.id,
        recipe_ids: vec![recipe_a.id, recipe_b.id],
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_voting_discovery_lists_only_expired_awaiting_plans() {
    let (pool, db_name) = create_test_db().await;
    let (household, _voter) = seed_household(&pool).await;

    let now = Utc::now();
    let expired = meal_plans::insert_meal_plan(
        &pool,
        household.id,
        now - Duration::days(2),
        now - Duration::minutes(5),
    )
    .await
    .expect("insert expired plan");
    let open = meal_plans::insert_meal_plan(&pool, household.id, now, now + Duration::days(1))
        .await
        .expect("insert open plan");

    // A third plan that has already finalized. A plan with no events
    // finalizes trivially with nothing to choose.
    let finalized = meal_plans::insert_meal_plan(
        &pool,
        household.id,
        now - Duration::days(2),
        now - Duration::hours(1),
    )
    .await
    .expect("insert finalized plan");
    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        finalized.id,
        household.id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(changed);

    let plans = meal_plans::get_unfinalized_meal_plans_with_expired_voting_periods(&pool)
        .await
        .expect("list expired plans");
    let ids: Vec<Uuid> = plans.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![expired.id]);
    let _ = open;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn next_week_listing_returns_chosen_options_with_recipes() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_finalized_plan(&pool, Duration::days(2)).await;

    let rows = meal_plans::get_finalized_meal_plan_ids_for_the_next_week(&pool, Duration::days(7))
        .await
        .expect("list next week");
    assert_eq!(rows.len(), 1, "one chosen option inside the window");

    let row = &rows[0];
    assert_eq!(row.meal_plan_id, fixture.plan_id);
    assert_eq!(row.household_id, fixture.household_id);
    assert_eq!(row.meal_plan_event_id, fixture.event_id);
    assert_eq!(row.meal_plan_option_id, fixture.chosen_option_id);
    assert_eq!(row.meal_id, fixture.meal_id);
    assert_eq!(row.recipe_ids, fixture.recipe_ids);

    // Materialization flips the flag; the plan then leaves the listing.
    meal_plans::mark_meal_plan_as_having_tasks_created(&pool, fixture.plan_id)
        .await
        .expect("mark tasks created");
    let rows = meal_plans::get_finalized_meal_plan_ids_for_the_next_week(&pool, Duration::days(7))
        .await
        .expect("list next week again");
    assert!(rows.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn next_week_listing_excludes_events_outside_the_window() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_finalized_plan(&pool, Duration::days(10)).await;

    let rows = meal_plans::get_finalized_meal_plan_ids_for_the_next_week(&pool, Duration::days(7))
        .await
        .expect("list next week");
    assert!(
        rows.is_empty(),
        "an event ten days out is beyond a seven-day lookahead"
    );
    let _ = fixture;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn grocery_discovery_hydrates_chosen_options_only() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_finalized_plan(&pool, Duration::days(2)).await;

    let plans = meal_plans::get_finalized_meal_plans_with_uninitialized_grocery_lists(&pool)
        .await
        .expect("list uninitialized");
    assert_eq!(plans.len(), 1);

    let hydrated = &plans[0];
    assert_eq!(hydrated.meal_plan.id, fixture.plan_id);
    assert_eq!(hydrated.events.len(), 1);

    let event = &hydrated.events[0];
    assert_eq!(event.options.len(), 2);
    for option in &event.options {
        if option.option.id == fixture.chosen_option_id {
            let meal = option.meal.as_ref().expect("chosen option carries its meal");
            assert_eq!(meal.meal.id, fixture.meal_id);
            assert_eq!(meal.recipes.len(), 2);
        } else {
            assert!(option.meal.is_none(), "losing options stay unhydrated");
        }
    }

    meal_plans::mark_meal_plan_grocery_list_initialized(&pool, fixture.plan_id)
        .await
        .expect("mark grocery list initialized");
    let plans = meal_plans::get_finalized_meal_plans_with_uninitialized_grocery_lists(&pool)
        .await
        .expect("list uninitialized again");
    assert!(plans.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Lifecycle flags and archival
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_flags_error_on_missing_plan() {
    let (pool, db_name) = create_test_db().await;

    let missing = Uuid::new_v4();
    assert!(
        meal_plans::mark_meal_plan_as_having_tasks_created(&pool, missing)
            .await
            .is_err()
    );
    assert!(
        meal_plans::mark_meal_plan_grocery_list_initialized(&pool, missing)
            .await
            .is_err()
    );
    assert!(meal_plans::archive_meal_plan(&pool, missing).await.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn archive_is_terminal_and_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let (household, _voter) = seed_household(&pool).await;

    let now = Utc::now();
    let plan = meal_plans::insert_meal_plan(
        &pool,
        household.id,
        now - Duration::days(2),
        now - Duration::hours(1),
    )
    .await
    .expect("insert plan");

    meal_plans::archive_meal_plan(&pool, plan.id)
        .await
        .expect("archive");
    meal_plans::archive_meal_plan(&pool, plan.id)
        .await
        .expect("archive again is a no-op");

    let archived = meal_plans::get_meal_plan(&pool, plan.id)
        .await
        .expect("fetch plan")
        .expect("plan exists");
    assert_eq!(archived.status, MealPlanStatus::Archived);

    // An archived plan never re-finalizes.
    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        plan.id,
        household.id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize archived");
    assert!(!changed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn plan_status_counts_groups_by_status() {
    let (pool, db_name) = create_test_db().await;
    let (household, _voter) = seed_household(&pool).await;

    let now = Utc::now();
    meal_plans::insert_meal_plan(&pool, household.id, now, now + Duration::days(1))
        .await
        .expect("insert awaiting plan");
    let finalized = meal_plans::insert_meal_plan(
        &pool,
        household.id,
        now - Duration::days(2),
        now - Duration::hours(1),
    )
    .await
    .expect("insert to-finalize plan");
    meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        finalized.id,
        household.id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    let archived = meal_plans::insert_meal_plan(
        &pool,
        household.id,
        now - Duration::days(2),
        now - Duration::hours(1),
    )
    .await
    .expect("insert to-archive plan");
    meal_plans::archive_meal_plan(&pool, archived.id)
        .await
        .expect("archive");

    let mut counts = meal_plans::plan_status_counts(&pool)
        .await
        .expect("status counts");
    counts.sort_by_key(|(status, _)| status.to_string());

    assert_eq!(
        counts,
        vec![
            (MealPlanStatus::Archived, 1),
            (MealPlanStatus::AwaitingVotes, 1),
            (MealPlanStatus::Finalized, 1),
        ]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

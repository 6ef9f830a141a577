//! Integration tests for the vote tally and finalization transition.
//!
//! Covers the selection rule (most positive votes, creation-time tie break,
//! lowest-ID fallback), idempotence, the voting-window guard, and concurrent
//! tally attempts against the same plan.

use chrono::{Duration, Utc};
use uuid::Uuid;

use mise_db::models::{MealPlan, MealPlanEvent, MealPlanOption, MealPlanStatus, User};
use mise_db::queries::meal_plans::{self, FinalizeOptions};
use mise_db::queries::recipes;
use mise_test_utils::{create_test_db, drop_test_db, seed_household};

/// A plan whose voting window closed an hour ago, with one event offering
/// two options.
struct VotablePlan {
    household_id: Uuid,
    voter: User,
    plan: MealPlan,
    event: MealPlanEvent,
    option_a: MealPlanOption,
    option_b: MealPlanOption,
}

async fn seed_votable_plan(pool: &sqlx::PgPool) -> VotablePlan {
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
        now + Duration::days(2),
        now + Duration::days(2) + Duration::hours(1),
    )
    .await
    .expect("insert event");

    let meal_a = recipes::insert_meal(pool, "meal a").await.expect("insert meal a");
    let meal_b = recipes::insert_meal(pool, "meal b").await.expect("insert meal b");

    let option_a = meal_plans::insert_meal_plan_option(pool, event.id, meal_a.id)
        .await
        .expect("insert option a");
    let option_b = meal_plans::insert_meal_plan_option(pool, event.id, meal_b.id)
        .await
        .expect("insert option b");

    VotablePlan {
        household_id: household.id,
        voter,
        plan,
        event,
        option_a,
        option_b,
    }
}

async fn chosen_option_ids(pool: &sqlx::PgPool, event_id: Uuid) -> Vec<Uuid> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM meal_plan_options WHERE belongs_to_meal_plan_event = $1 AND chosen",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .expect("list chosen options");
    rows.into_iter().map(|(id,)| id).collect()
}

// ---------------------------------------------------------------------------
// Selection rule
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finalize_picks_option_with_most_positive_votes() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    let second_voter = meal_plans::insert_user(&pool, fixture.household_id, "second voter")
        .await
        .expect("insert second voter");

    // Two positive votes for A, one abstention for B. Abstentions never count.
    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_a.id, fixture.voter.id, false, "")
        .await
        .expect("vote a 1");
    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_a.id, second_voter.id, false, "")
        .await
        .expect("vote a 2");
    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_b.id, second_voter.id, true, "")
        .await
        .expect("abstain b");

    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        fixture.household_id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(changed, "first tally should perform the transition");

    let plan = meal_plans::get_meal_plan(&pool, fixture.plan.id)
        .await
        .expect("fetch plan")
        .expect("plan exists");
    assert_eq!(plan.status, MealPlanStatus::Finalized);

    let chosen = chosen_option_ids(&pool, fixture.event.id).await;
    assert_eq!(chosen, vec![fixture.option_a.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_tie_breaks_by_earliest_option_creation() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    // One positive vote each: a tie, so the earlier-created option wins.
    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_a.id, fixture.voter.id, false, "")
        .await
        .expect("vote a");
    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_b.id, fixture.voter.id, false, "")
        .await
        .expect("vote b");

    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        fixture.household_id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(changed);

    let chosen = chosen_option_ids(&pool, fixture.event.id).await;
    assert_eq!(
        chosen,
        vec![fixture.option_a.id],
        "option a was created first and should win the tie"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_tie_without_creation_tie_break_uses_lowest_id() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_a.id, fixture.voter.id, false, "")
        .await
        .expect("vote a");
    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_b.id, fixture.voter.id, false, "")
        .await
        .expect("vote b");

    let options = FinalizeOptions {
        tie_break_by_earliest_creation: false,
        ..FinalizeOptions::default()
    };
    let changed =
        meal_plans::attempt_to_finalize_meal_plan(&pool, fixture.plan.id, fixture.household_id, &options)
            .await
            .expect("finalize");
    assert!(changed);

    let expected = fixture.option_a.id.min(fixture.option_b.id);
    let chosen = chosen_option_ids(&pool, fixture.event.id).await;
    assert_eq!(chosen, vec![expected]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_zero_votes_falls_back_to_lowest_option_id() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        fixture.household_id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(changed, "zero votes still finalizes by default");

    let expected = fixture.option_a.id.min(fixture.option_b.id);
    let chosen = chosen_option_ids(&pool, fixture.event.id).await;
    assert_eq!(chosen, vec![expected]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_with_required_vote_holds_plan_open() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    let options = FinalizeOptions {
        require_at_least_one_vote: true,
        ..FinalizeOptions::default()
    };
    let changed =
        meal_plans::attempt_to_finalize_meal_plan(&pool, fixture.plan.id, fixture.household_id, &options)
            .await
            .expect("finalize");
    assert!(!changed, "a zero-vote event must hold the plan open");

    let plan = meal_plans::get_meal_plan(&pool, fixture.plan.id)
        .await
        .expect("fetch plan")
        .expect("plan exists");
    assert_eq!(plan.status, MealPlanStatus::AwaitingVotes);
    assert!(chosen_option_ids(&pool, fixture.event.id).await.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_chooses_one_winner_per_event() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    // A second event on the same plan with its own pair of options.
    let now = Utc::now();
    let second_event = meal_plans::insert_meal_plan_event(
        &pool,
        fixture.plan.id,
        now + Duration::days(3),
        now + Duration::days(3) + Duration::hours(1),
    )
    .await
    .expect("insert second event");

    let meal_c = recipes::insert_meal(&pool, "meal c").await.expect("insert meal c");
    let meal_d = recipes::insert_meal(&pool, "meal d").await.expect("insert meal d");
    let option_c = meal_plans::insert_meal_plan_option(&pool, second_event.id, meal_c.id)
        .await
        .expect("insert option c");
    let option_d = meal_plans::insert_meal_plan_option(&pool, second_event.id, meal_d.id)
        .await
        .expect("insert option d");

    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_b.id, fixture.voter.id, false, "")
        .await
        .expect("vote b");
    meal_plans::insert_meal_plan_option_vote(&pool, option_d.id, fixture.voter.id, false, "")
        .await
        .expect("vote d");

    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        fixture.household_id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(changed);

    assert_eq!(
        chosen_option_ids(&pool, fixture.event.id).await,
        vec![fixture.option_b.id]
    );
    assert_eq!(
        chosen_option_ids(&pool, second_event.id).await,
        vec![option_d.id]
    );
    let _ = option_c;

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Guards and idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finalize_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_a.id, fixture.voter.id, false, "")
        .await
        .expect("vote a");

    let first = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        fixture.household_id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("first finalize");
    let second = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        fixture.household_id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("second finalize");

    assert!(first, "first call performs the transition");
    assert!(!second, "second call reports nothing to do");

    let chosen = chosen_option_ids(&pool, fixture.event.id).await;
    assert_eq!(chosen, vec![fixture.option_a.id], "replay must not re-choose");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_skips_plan_with_open_voting_window() {
    let (pool, db_name) = create_test_db().await;
    let (household, _voter) = seed_household(&pool).await;

    let now = Utc::now();
    let plan = meal_plans::insert_meal_plan(&pool, household.id, now, now + Duration::hours(6))
        .await
        .expect("insert plan");

    let changed = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        plan.id,
        household.id,
        &FinalizeOptions::default(),
    )
    .await
    .expect("finalize");
    assert!(!changed, "a plan still collecting votes must not finalize");

    let plan = meal_plans::get_meal_plan(&pool, plan.id)
        .await
        .expect("fetch plan")
        .expect("plan exists");
    assert_eq!(plan.status, MealPlanStatus::AwaitingVotes);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_unknown_plan_is_an_error() {
    let (pool, db_name) = create_test_db().await;
    let (household, _voter) = seed_household(&pool).await;

    let result = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        Uuid::new_v4(),
        household.id,
        &FinalizeOptions::default(),
    )
    .await;
    assert!(result.is_err(), "a missing plan is an error, not a no-op");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_scopes_plan_to_household() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    let other_household = meal_plans::insert_household(&pool, "other household")
        .await
        .expect("insert other household");

    let result = meal_plans::attempt_to_finalize_meal_plan(
        &pool,
        fixture.plan.id,
        other_household.id,
        &FinalizeOptions::default(),
    )
    .await;
    assert!(result.is_err(), "another household's plan must not resolve");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_finalize_attempts_change_the_plan_once() {
    let (pool, db_name) = create_test_db().await;
    let fixture = seed_votable_plan(&pool).await;

    meal_plans::insert_meal_plan_option_vote(&pool, fixture.option_a.id, fixture.voter.id, false, "")
        .await
        .expect("vote a");

    let spawn_attempt = |pool: sqlx::PgPool, plan_id: Uuid, household_id: Uuid| {
        tokio::spawn(async move {
            meal_plans::attempt_to_finalize_meal_plan(
                &pool,
                plan_id,
                household_id,
                &FinalizeOptions::default(),
            )
            .await
        })
    };

    let first = spawn_attempt(pool.clone(), fixture.plan.id, fixture.household_id);
    let second = spawn_attempt(pool.clone(), fixture.plan.id, fixture.household_id);

    let first = first.await.expect("join").expect("finalize");
    let second = second.await.expect("join").expect("finalize");

    assert!(
        first ^ second,
        "exactly one concurrent attempt may perform the transition"
    );
    assert_eq!(
        chosen_option_ids(&pool, fixture.event.id).await,
        vec![fixture.option_a.id]
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

//! Database query functions for meal plans, their events, options, and
//! votes, including the atomic finalization path.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{
    FinalizedMealPlanResult, Household, HydratedMealPlan, HydratedMealPlanEvent,
    HydratedMealPlanOption, MealPlan, MealPlanEvent, MealPlanOption, MealPlanOptionVote,
    MealPlanStatus, User,
};
use crate::queries::recipes;

// ---------------------------------------------------------------------------
// Inserts
// ---------------------------------------------------------------------------

/// Insert a household. Returns the row with server-generated defaults.
pub async fn insert_household(pool: &PgPool, name: &str) -> Result<Household> {
    let household = sqlx::query_as::<_, Household>(
        "INSERT INTO households (name) VALUES ($1) RETURNING *",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert household {:?}", name))?;

    Ok(household)
}

/// Insert a household member.
pub async fn insert_user(pool: &PgPool, household_id: Uuid, username: &str) -> Result<User> {
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, belongs_to_household) VALUES ($1, $2) RETURNING *",
    )
    .bind(username)
    .bind(household_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert user {:?}", username))?;

    Ok(user)
}

/// Insert a meal plan in `awaiting_votes` with the given voting window.
pub async fn insert_meal_plan(
    pool: &PgPool,
    household_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<MealPlan> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "INSERT INTO meal_plans (belongs_to_household, starts_at, ends_at) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(household_id)
    .bind(starts_at)
    .bind(ends_at)
    .fetch_one(pool)
    .await
    .context("failed to insert meal plan")?;

    Ok(plan)
}

/// Insert a meal occasion into a plan.
pub async fn insert_meal_plan_event(
    pool: &PgPool,
    meal_plan_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<MealPlanEvent> {
    let event = sqlx::query_as::<_, MealPlanEvent>(
        "INSERT INTO meal_plan_events (belongs_to_meal_plan, starts_at, ends_at) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(meal_plan_id)
    .bind(starts_at)
    .bind(ends_at)
    .fetch_one(pool)
    .await
    .context("failed to insert meal plan event")?;

    Ok(event)
}

/// Insert a candidate option for an event.
pub async fn insert_meal_plan_option(
    pool: &PgPool,
    event_id: Uuid,
    meal_id: Uuid,
) -> Result<MealPlanOption> {
    let option = sqlx::query_as::<_, MealPlanOption>(
        "INSERT INTO meal_plan_options (belongs_to_meal_plan_event, meal_id) \
         VALUES ($1, $2) \
         RETURNING *",
    )
    .bind(event_id)
    .bind(meal_id)
    .fetch_one(pool)
    .await
    .context("failed to insert meal plan option")?;

    Ok(option)
}

/// Record a member's ballot on an option. One ballot per member per option.
pub async fn insert_meal_plan_option_vote(
    pool: &PgPool,
    option_id: Uuid,
    user_id: Uuid,
    abstain: bool,
    notes: &str,
) -> Result<MealPlanOptionVote> {
    let vote = sqlx::query_as::<_, MealPlanOptionVote>(
        "INSERT INTO meal_plan_option_votes (belongs_to_meal_plan_option, by_user, abstain, notes) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(option_id)
    .bind(user_id)
    .bind(abstain)
    .bind(notes)
    .fetch_one(pool)
    .await
    .context("failed to insert meal plan option vote")?;

    Ok(vote)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Fetch a single meal plan by ID.
pub async fn get_meal_plan(pool: &PgPool, id: Uuid) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>("SELECT * FROM meal_plans WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch meal plan")?;

    Ok(plan)
}

/// Fetch a single event, scoped to its plan.
pub async fn get_meal_plan_event(
    pool: &PgPool,
    meal_plan_id: Uuid,
    event_id: Uuid,
) -> Result<Option<MealPlanEvent>> {
    let event = sqlx::query_as::<_, MealPlanEvent>(
        "SELECT * FROM meal_plan_events WHERE id = $1 AND belongs_to_meal_plan = $2",
    )
    .bind(event_id)
    .bind(meal_plan_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch meal plan event")?;

    Ok(event)
}

/// List plans still awaiting votes whose voting window has closed.
///
/// These are the plans the tally scheduler turns into tally requests.
pub async fn get_unfinalized_meal_plans_with_expired_voting_periods(
    pool: &PgPool,
) -> Result<Vec<MealPlan>> {
    let plans = sqlx::query_as::<_, MealPlan>(
        "SELECT * FROM meal_plans \
         WHERE status = 'awaiting_votes' AND ends_at < now() \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list expired meal plans")?;

    Ok(plans)
}

/// One row per chosen option of a finalized, not-yet-materialized plan whose
/// event starts inside `[now, now + lookahead)`, with the recipe IDs of the
/// option's meal aggregated in.
pub async fn get_finalized_meal_plan_ids_for_the_next_week(
    pool: &PgPool,
    lookahead: Duration,
) -> Result<Vec<FinalizedMealPlanResult>> {
    let now = Utc::now();
    let until = now + lookahead;

    let rows = sqlx::query_as::<_, FinalizedMealPlanResult>(
        "SELECT mp.id AS meal_plan_id, \
                mp.belongs_to_household AS household_id, \
                e.id AS meal_plan_event_id, \
                o.id AS meal_plan_option_id, \
                m.id AS meal_id, \
                ARRAY_AGG(mc.recipe_id ORDER BY mc.created_at) AS recipe_ids \
         FROM meal_plans mp \
         JOIN meal_plan_events e ON e.belongs_to_meal_plan = mp.id \
         JOIN meal_plan_options o ON o.belongs_to_meal_plan_event = e.id AND o.chosen \
         JOIN meals m ON m.id = o.meal_id \
         JOIN meal_components mc ON mc.belongs_to_meal = m.id \
         WHERE mp.status = 'finalized' \
           AND NOT mp.tasks_created \
           AND e.starts_at >= $1 \
           AND e.starts_at < $2 \
         GROUP BY mp.id, e.id, o.id, m.id \
         ORDER BY mp.created_at ASC, e.starts_at ASC",
    )
    .bind(now)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to list finalized meal plans for the lookahead window")?;

    Ok(rows)
}

/// Fully hydrated plans that are finalized but have no grocery list yet.
///
/// IDs are discovered first, then each plan's tree is assembled, so the heavy
/// hydration only runs for plans that actually need it.
pub async fn get_finalized_meal_plans_with_uninitialized_grocery_lists(
    pool: &PgPool,
) -> Result<Vec<HydratedMealPlan>> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM meal_plans \
         WHERE status = 'finalized' AND NOT grocery_list_initialized \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list plans with uninitialized grocery lists")?;

    let mut plans = Vec::with_capacity(ids.len());
    for (id,) in ids {
        let plan = get_hydrated_meal_plan(pool, id)
            .await?
            .with_context(|| format!("meal plan {id} disappeared during hydration"))?;
        plans.push(plan);
    }

    Ok(plans)
}

/// Assemble a plan's full tree: events, options, and (for chosen options)
/// the meal with its recipes.
pub async fn get_hydrated_meal_plan(
    pool: &PgPool,
    meal_plan_id: Uuid,
) -> Result<Option<HydratedMealPlan>> {
    let Some(meal_plan) = get_meal_plan(pool, meal_plan_id).await? else {
        return Ok(None);
    };

    let event_rows = sqlx::query_as::<_, MealPlanEvent>(
        "SELECT * FROM meal_plan_events WHERE belongs_to_meal_plan = $1 ORDER BY starts_at ASC",
    )
    .bind(meal_plan_id)
    .fetch_all(pool)
    .await
    .context("failed to list meal plan events")?;

    let mut events = Vec::with_capacity(event_rows.len());
    for event in event_rows {
        let option_rows = sqlx::query_as::<_, MealPlanOption>(
            "SELECT * FROM meal_plan_options \
             WHERE belongs_to_meal_plan_event = $1 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(event.id)
        .fetch_all(pool)
        .await
        .context("failed to list meal plan options")?;

        let mut options = Vec::with_capacity(option_rows.len());
        for option in option_rows {
            let meal = if option.chosen {
                Some(
                    recipes::get_hydrated_meal(pool, option.meal_id)
                        .await?
                        .with_context(|| {
                            format!("meal {} missing for option {}", option.meal_id, option.id)
                        })?,
                )
            } else {
                None
            };
            options.push(HydratedMealPlanOption { option, meal });
        }

        events.push(HydratedMealPlanEvent { event, options });
    }

    Ok(Some(HydratedMealPlan { meal_plan, events }))
}

/// Plan counts grouped by status, for the `status` subcommand.
pub async fn plan_status_counts(pool: &PgPool) -> Result<Vec<(MealPlanStatus, i64)>> {
    let counts: Vec<(MealPlanStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM meal_plans GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count meal plans by status")?;

    Ok(counts)
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// Knobs for the winner-selection rule inside [`attempt_to_finalize_meal_plan`].
#[derive(Debug, Clone, Copy)]
pub struct FinalizeOptions {
    /// When true, a plan with any zero-vote event stays in `awaiting_votes`.
    pub require_at_least_one_vote: bool,
    /// When true, vote ties are broken by earliest option creation before
    /// falling back to option ID order.
    pub tie_break_by_earliest_creation: bool,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        Self {
            require_at_least_one_vote: false,
            tie_break_by_earliest_creation: true,
        }
    }
}

#[derive(Debug, FromRow)]
struct OptionTally {
    event_id: Uuid,
    option_id: Uuid,
    option_created_at: DateTime<Utc>,
    positive_votes: i64,
}

/// Atomically finalize a plan: lock the plan row, tally votes per event,
/// mark the winning option of each event chosen, and flip the plan to
/// `finalized`.
///
/// Returns `Ok(true)` when this call performed the transition and `Ok(false)`
/// when there was nothing to do: the plan is already finalized or archived,
/// its voting window is still open, or (with
/// [`FinalizeOptions::require_at_least_one_vote`]) some event has no votes.
///
/// The row lock serializes concurrent tally attempts for the same plan, so at
/// most one caller ever observes `true`.
pub async fn attempt_to_finalize_meal_plan(
    pool: &PgPool,
    meal_plan_id: Uuid,
    household_id: Uuid,
    options: &FinalizeOptions,
) -> Result<bool> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin finalization transaction")?;

    // 1. Lock the plan row. Everything below happens under this lock;
    //    returning early drops the transaction and rolls back.
    let plan = sqlx::query_as::<_, MealPlan>(
        "SELECT * FROM meal_plans \
         WHERE id = $1 AND belongs_to_household = $2 \
         FOR UPDATE",
    )
    .bind(meal_plan_id)
    .bind(household_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to lock meal plan row")?;

    let Some(plan) = plan else {
        anyhow::bail!("meal plan {meal_plan_id} not found for household {household_id}");
    };

    // 2. Only plans still awaiting votes can finalize.
    if plan.status != MealPlanStatus::AwaitingVotes {
        return Ok(false);
    }

    // 3. The voting window must have closed.
    if plan.ends_at > Utc::now() {
        return Ok(false);
    }

    // 4. Tally positive votes per option, grouped by event.
    let tallies = sqlx::query_as::<_, OptionTally>(
        "SELECT e.id AS event_id, \
                o.id AS option_id, \
                o.created_at AS option_created_at, \
                COUNT(v.id) FILTER (WHERE NOT v.abstain) AS positive_votes \
         FROM meal_plan_events e \
         JOIN meal_plan_options o ON o.belongs_to_meal_plan_event = e.id \
         LEFT JOIN meal_plan_option_votes v ON v.belongs_to_meal_plan_option = o.id \
         WHERE e.belongs_to_meal_plan = $1 \
         GROUP BY e.id, o.id, o.created_at \
         ORDER BY e.id, o.id",
    )
    .bind(meal_plan_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to tally votes")?;

    let mut per_event: BTreeMap<Uuid, Vec<OptionTally>> = BTreeMap::new();
    for tally in tallies {
        per_event.entry(tally.event_id).or_default().push(tally);
    }

    // 5. Pick a winner per event.
    let mut winners: Vec<Uuid> = Vec::with_capacity(per_event.len());
    for candidates in per_event.values() {
        match select_winner(candidates, options) {
            Some(winner) => winners.push(winner),
            // A zero-vote event under require_at_least_one_vote: the whole
            // plan stays open.
            None => return Ok(false),
        }
    }

    // 6. Mark winners chosen and flip the plan status.
    if !winners.is_empty() {
        sqlx::query("UPDATE meal_plan_options SET chosen = TRUE WHERE id = ANY($1)")
            .bind(&winners)
            .execute(&mut *tx)
            .await
            .context("failed to mark winning options chosen")?;
    }

    let updated = sqlx::query(
        "UPDATE meal_plans SET status = 'finalized' \
         WHERE id = $1 AND status = 'awaiting_votes'",
    )
    .bind(meal_plan_id)
    .execute(&mut *tx)
    .await
    .context("failed to update meal plan status")?;

    if updated.rows_affected() == 0 {
        // Unreachable while we hold the row lock; guard anyway.
        anyhow::bail!("meal plan {meal_plan_id} changed status during finalization");
    }

    tx.commit()
        .await
        .context("failed to commit finalization transaction")?;

    Ok(true)
}

/// Apply the selection rule to one event's tallied options.
///
/// Most positive votes wins. Ties go to the earliest-created option (when
/// configured), then the lowest option ID. An event where nobody voted falls
/// back to the lowest option ID, or `None` when a vote is required.
fn select_winner(candidates: &[OptionTally], options: &FinalizeOptions) -> Option<Uuid> {
    if candidates.is_empty() {
        return None;
    }

    let total_votes: i64 = candidates.iter().map(|c| c.positive_votes).sum();
    if total_votes == 0 {
        if options.require_at_least_one_vote {
            return None;
        }
        return candidates.iter().map(|c| c.option_id).min();
    }

    let winner = candidates
        .iter()
        .min_by(|a, b| {
            b.positive_votes
                .cmp(&a.positive_votes)
                .then_with(|| {
                    if options.tie_break_by_earliest_creation {
                        a.option_created_at.cmp(&b.option_created_at)
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
                .then_with(|| a.option_id.cmp(&b.option_id))
        })
        .map(|c| c.option_id);

    winner
}

// ---------------------------------------------------------------------------
// Flag flips and archival
// ---------------------------------------------------------------------------

/// Record that a plan's prep tasks have been materialized. Monotone: the
/// flag is only ever set, never cleared.
pub async fn mark_meal_plan_as_having_tasks_created(pool: &PgPool, meal_plan_id: Uuid) -> Result<()> {
    let result = sqlx::query("UPDATE meal_plans SET tasks_created = TRUE WHERE id = $1")
        .bind(meal_plan_id)
        .execute(pool)
        .await
        .context("failed to mark meal plan tasks created")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("meal plan {meal_plan_id} not found");
    }

    Ok(())
}

/// Record that a plan's grocery list has been initialized. Monotone.
pub async fn mark_meal_plan_grocery_list_initialized(
    pool: &PgPool,
    meal_plan_id: Uuid,
) -> Result<()> {
    let result = sqlx::query("UPDATE meal_plans SET grocery_list_initialized = TRUE WHERE id = $1")
        .bind(meal_plan_id)
        .execute(pool)
        .await
        .context("failed to mark meal plan grocery list initialized")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("meal plan {meal_plan_id} not found");
    }

    Ok(())
}

/// Archive a plan. Valid from either `awaiting_votes` or `finalized`;
/// archiving an archived plan is a no-op.
pub async fn archive_meal_plan(pool: &PgPool, meal_plan_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE meal_plans SET status = 'archived' WHERE id = $1 AND status <> 'archived'",
    )
    .bind(meal_plan_id)
    .execute(pool)
    .await
    .context("failed to archive meal plan")?;

    if result.rows_affected() == 0 {
        // Distinguish "missing" from "already archived" for the caller's log.
        let exists = get_meal_plan(pool, meal_plan_id).await?.is_some();
        if !exists {
            anyhow::bail!("meal plan {meal_plan_id} not found");
        }
    }

    Ok(())
}

//! Tests for the message runtime: dispatch, settlement, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mise_db::models::MealPlanStatus;
use mise_db::queries::{meal_plans, recipes};
use mise_test_utils::{create_test_db, drop_test_db, seed_household, seed_meal_for_recipe};

use mise_core::analysis::RecipeAnalyzer;
use mise_core::bus::memory::InProcessBus;
use mise_core::bus::{
    ChangeEventType, DATA_CHANGES_TOPIC, DataChangeMessage, DataType, Envelope, MessageKind,
    MessagePublisher, TALLY_REQUESTS_TOPIC, WORKER_TICKS_TOPIC,
};
use mise_core::events::MemoryEventSink;
use mise_core::runtime::{Handlers, MessageRuntime, RuntimeConfig, RuntimeResult};

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    pool: PgPool,
    db_name: String,
}

impl TestHarness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self { pool, db_name }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

/// A runtime wired to one in-process bus, publishing back onto the same bus.
fn build_runtime(
    pool: &PgPool,
    bus: Arc<InProcessBus>,
    sink: Arc<MemoryEventSink>,
) -> MessageRuntime {
    let config = RuntimeConfig::default();
    let handlers = Handlers::new(
        pool.clone(),
        bus.clone(),
        sink,
        RecipeAnalyzer::default(),
        &config,
    );
    MessageRuntime::new(bus, handlers, config)
}

// ===========================================================================
// Settlement
// ===========================================================================

#[tokio::test]
async fn ticks_against_an_empty_database_drain_cleanly() {
    let harness = TestHarness::new().await;
    let pool = harness.pool();

    let bus = Arc::new(InProcessBus::new());
    for kind in [
        MessageKind::FinalizationTick,
        MessageKind::TaskTick,
        MessageKind::GroceryTick,
    ] {
        bus.publish(WORKER_TICKS_TOPIC, &Envelope::tick(kind))
            .await
            .expect("publish tick");
    }
    bus.close().await;

    let sink = Arc::new(MemoryEventSink::new());
    let runtime = build_runtime(pool, bus.clone(), sink);
    let result = runtime
        .run(CancellationToken::new())
        .await
        .expect("runtime run");

    assert_eq!(result, RuntimeResult::Drained);
    assert_eq!(bus.ready_len().await, 0);
    assert_eq!(bus.in_flight_len().await, 0);

    harness.teardown().await;
}

#[tokio::test]
async fn malformed_bodies_are_rejected_not_redelivered() {
    let harness = TestHarness::new().await;
    let pool = harness.pool();

    let bus = Arc::new(InProcessBus::new());
    bus.publish_raw(WORKER_TICKS_TOPIC, "this is not json".to_string())
        .await
        .expect("publish garbage");
    // Decodes as an envelope but carries neither of the required ids.
    bus.publish_raw(TALLY_REQUESTS_TOPIC, "{\"type\":\"tallyRequest\"}".to_string())
        .await
        .expect("publish incomplete request");
    bus.close().await;

    let sink = Arc::new(MemoryEventSink::new());
    let runtime = build_runtime(pool, bus.clone(), sink);
    let result = runtime
        .run(CancellationToken::new())
        .await
        .expect("runtime run");

    // Both were rejected permanently; a retry disposition would leave the
    // run spinning on redeliveries instead of draining.
    assert_eq!(result, RuntimeResult::Drained);
    assert_eq!(bus.ready_len().await, 0);
    assert_eq!(bus.in_flight_len().await, 0);

    harness.teardown().await;
}

#[tokio::test]
async fn data_changes_reach_the_event_sink() {
    let harness = TestHarness::new().await;
    let pool = harness.pool();

    let meal_plan_id = Uuid::new_v4();
    let household_id = Uuid::new_v4();
    let message = DataChangeMessage::meal_plan_finalized(meal_plan_id, household_id);

    let bus = Arc::new(InProcessBus::new());
    let envelope = Envelope::data_change(&message).expect("encode data change");
    bus.publish(DATA_CHANGES_TOPIC, &envelope)
        .await
        .expect("publish data change");
    bus.close().await;

    let sink = Arc::new(MemoryEventSink::new());
    let runtime = build_runtime(pool, bus.clone(), sink.clone());
    let result = runtime
        .run(CancellationToken::new())
        .await
        .expect("runtime run");
    assert_eq!(result, RuntimeResult::Drained);

    let recorded = sink.recorded().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0], message);

    harness.teardown().await;
}

// ===========================================================================
// End to end
// ===========================================================================

/// One finalization tick carries a votable expired plan all the way through:
/// scheduling, tallying, and the finalization announcement into the sink.
#[tokio::test]
async fn finalization_tick_finalizes_an_expired_plan() {
    let harness = TestHarness::new().await;
    let pool = harness.pool();

    let (household, user) = seed_household(pool).await;
    let now = Utc::now();
    let plan = meal_plans::insert_meal_plan(
        pool,
        household.id,
        now - chrono::Duration::days(3),
        now - chrono::Duration::hours(1),
    )
    .await
    .expect("insert plan");
    let event = meal_plans::insert_meal_plan_event(
        pool,
        plan.id,
        now + chrono::Duration::days(2),
        now + chrono::Duration::days(2) + chrono::Duration::hours(1),
    )
    .await
    .expect("insert event");
    let recipe = recipes::insert_recipe(pool, "pasta al limone")
        .await
        .expect("insert recipe");
    let meal = seed_meal_for_recipe(pool, "pasta night", recipe.id).await;
    let option = meal_plans::insert_meal_plan_option(pool, event.id, meal.id)
        .await
        .expect("insert option");
    meal_plans::insert_meal_plan_option_vote(pool, option.id, user.id, false, "")
        .await
        .expect("insert vote");

    let bus = Arc::new(InProcessBus::new());
    bus.publish(
        WORKER_TICKS_TOPIC,
        &Envelope::tick(MessageKind::FinalizationTick),
    )
    .await
    .expect("publish tick");

    let sink = Arc::new(MemoryEventSink::new());
    let runtime = build_runtime(pool, bus.clone(), sink.clone());
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = tokio::spawn(async move { runtime.run(run_cancel).await });

    // The tick fans out into a tally request and then a finalization
    // announcement, all on the same bus. Wait for the effects.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let current = meal_plans::get_meal_plan(pool, plan.id)
            .await
            .expect("get plan")
            .expect("plan exists");
        if current.status == MealPlanStatus::Finalized && !sink.recorded().await.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "plan was not finalized in time, status: {}",
            current.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let result = run
        .await
        .expect("runtime task")
        .expect("runtime run");
    assert_eq!(result, RuntimeResult::Interrupted);

    let recorded = sink.recorded().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].data_type, DataType::MealPlan);
    assert_eq!(recorded[0].event_type, ChangeEventType::Finalized);
    assert_eq!(recorded[0].meal_plan_id, Some(plan.id));
    assert_eq!(recorded[0].attributable_to_household_id, Some(household.id));

    harness.teardown().await;
}

//! Message bus contract: the JSON envelope, the data-change payload, topic
//! names, and the publisher/consumer traits.
//!
//! The bus guarantees at-least-once delivery with no ordering between
//! messages. Consumers either ack (done), nack (redeliver later), or reject
//! (drop permanently, for poison messages). The traits are the seam where an
//! external broker client would plug in; [`memory::InProcessBus`] is the
//! implementation the worker ships with.

pub mod memory;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mise_db::models::{MealPlanGroceryListItem, MealPlanTask};

/// Topic carrying per-plan tally requests emitted by the scheduler.
pub const TALLY_REQUESTS_TOPIC: &str = "tally_requests";
/// Topic carrying the periodic tick messages (finalization, tasks, groceries).
pub const WORKER_TICKS_TOPIC: &str = "worker_ticks";
/// Topic carrying post-commit data-change notifications.
pub const DATA_CHANGES_TOPIC: &str = "data_changes";

/// Discriminator for the message envelope. Unknown strings fail decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    TallyRequest,
    FinalizationTick,
    TaskTick,
    GroceryTick,
    DataChange,
}

impl fmt::Display for MessageKind {
    /// Renders the wire name (`tallyRequest`, `taskTick`, ...).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TallyRequest => "tallyRequest",
            Self::FinalizationTick => "finalizationTick",
            Self::TaskTick => "taskTick",
            Self::GroceryTick => "groceryTick",
            Self::DataChange => "dataChange",
        };
        f.write_str(s)
    }
}

/// The JSON envelope every message travels in. All fields except `type` are
/// optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "mealPlanID", skip_serializing_if = "Option::is_none", default)]
    pub meal_plan_id: Option<Uuid>,
    #[serde(rename = "householdID", skip_serializing_if = "Option::is_none", default)]
    pub household_id: Option<Uuid>,
    #[serde(rename = "userID", skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<Uuid>,
    #[serde(rename = "payload", skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    /// A bare tick envelope (`finalizationTick`, `taskTick`, `groceryTick`).
    pub fn tick(kind: MessageKind) -> Self {
        Self {
            kind,
            meal_plan_id: None,
            household_id: None,
            user_id: None,
            payload: None,
        }
    }

    /// A tally request for one plan.
    pub fn tally_request(meal_plan_id: Uuid, household_id: Uuid) -> Self {
        Self {
            kind: MessageKind::TallyRequest,
            meal_plan_id: Some(meal_plan_id),
            household_id: Some(household_id),
            user_id: None,
            payload: None,
        }
    }

    /// A data-change notification wrapping the given payload.
    pub fn data_change(message: &DataChangeMessage) -> Result<Self> {
        let payload = serde_json::to_value(message)?;
        Ok(Self {
            kind: MessageKind::DataChange,
            meal_plan_id: message.meal_plan_id,
            household_id: message.attributable_to_household_id,
            user_id: message.attributable_to_user_id,
            payload: Some(payload),
        })
    }

    /// Decode an envelope from a raw message body.
    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Encode this envelope to its wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Which derived table a data change concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    MealPlan,
    MealPlanTask,
    MealPlanGroceryListItem,
}

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    Finalized,
    TaskCreated,
    GroceryListItemCreated,
}

/// Payload of a `dataChange` envelope: one persisted row changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeMessage {
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    #[serde(rename = "eventType")]
    pub event_type: ChangeEventType,
    #[serde(rename = "mealPlanID", skip_serializing_if = "Option::is_none", default)]
    pub meal_plan_id: Option<Uuid>,
    #[serde(
        rename = "mealPlanTaskID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub meal_plan_task_id: Option<Uuid>,
    #[serde(
        rename = "mealPlanGroceryListItemID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub meal_plan_grocery_list_item_id: Option<Uuid>,
    #[serde(
        rename = "attributableToUserID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub attributable_to_user_id: Option<Uuid>,
    #[serde(
        rename = "attributableToHouseholdID",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub attributable_to_household_id: Option<Uuid>,
}

impl DataChangeMessage {
    /// A plan reached `finalized`.
    pub fn meal_plan_finalized(meal_plan_id: Uuid, household_id: Uuid) -> Self {
        Self {
            data_type: DataType::MealPlan,
            event_type: ChangeEventType::Finalized,
            meal_plan_id: Some(meal_plan_id),
            meal_plan_task_id: None,
            meal_plan_grocery_list_item_id: None,
            attributable_to_user_id: None,
            attributable_to_household_id: Some(household_id),
        }
    }

    /// A derived prep task row was created.
    pub fn task_created(task: &MealPlanTask, meal_plan_id: Uuid, household_id: Uuid) -> Self {
        Self {
            data_type: DataType::MealPlanTask,
            event_type: ChangeEventType::TaskCreated,
            meal_plan_id: Some(meal_plan_id),
            meal_plan_task_id: Some(task.id),
            meal_plan_grocery_list_item_id: None,
            attributable_to_user_id: None,
            attributable_to_household_id: Some(household_id),
        }
    }

    /// A derived grocery list row was created.
    pub fn grocery_list_item_created(item: &MealPlanGroceryListItem, household_id: Uuid) -> Self {
        Self {
            data_type: DataType::MealPlanGroceryListItem,
            event_type: ChangeEventType::GroceryListItemCreated,
            meal_plan_id: Some(item.belongs_to_meal_plan),
            meal_plan_task_id: None,
            meal_plan_grocery_list_item_id: Some(item.id),
            attributable_to_user_id: None,
            attributable_to_household_id: Some(household_id),
        }
    }
}

/// One message handed to a consumer. `body` is the raw wire form; decoding
/// happens in the runtime so poison bodies can be rejected.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Identifies this delivery for ack/nack/reject. A redelivered message
    /// gets a fresh id.
    pub id: Uuid,
    pub topic: String,
    pub body: String,
}

/// Producer side of the bus.
///
/// At-least-once: callers may publish the same logical message more than
/// once, and consumers must tolerate duplicates.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()>;
}

/// Consumer side of the bus.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Wait for the next message. Returns `None` when the bus has shut down
    /// and no messages remain.
    async fn next(&self) -> Result<Option<Delivery>>;

    /// Mark a delivery done. Unknown ids are ignored (the lease may already
    /// have expired).
    async fn ack(&self, delivery_id: Uuid) -> Result<()>;

    /// Return a delivery to the queue for a later retry.
    async fn nack(&self, delivery_id: Uuid) -> Result<()>;

    /// Drop a delivery permanently.
    async fn reject(&self, delivery_id: Uuid) -> Result<()>;
}

// Compile-time assertions: both traits must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn MessagePublisher, _: &dyn MessageConsumer) {}
};

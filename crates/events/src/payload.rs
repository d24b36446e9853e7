//! Typed payloads for the known commerce event kinds.
//!
//! The ledger stores payloads as opaque JSON. Product code that wants compile
//! time checking records and reads events through these types instead; any
//! kind not listed here round-trips as [`DomainEvent::Unknown`] so older
//! devices and services keep working when new kinds appear.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tally_core::EventType;

use crate::event::Event;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload of {event_type} is invalid: {reason}")]
    Invalid { event_type: String, reason: String },

    #[error("failed to serialize payload: {0}")]
    Serialization(String),
}

/// A payload bound to a stable event type tag.
pub trait TypedPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: &'static str;

    fn event_type() -> EventType {
        EventType::from_static(Self::EVENT_TYPE)
    }

    fn to_payload(&self) -> Result<JsonValue, PayloadError> {
        serde_json::to_value(self).map_err(|e| PayloadError::Serialization(e.to_string()))
    }

    fn from_payload(payload: &JsonValue) -> Result<Self, PayloadError> {
        Self::deserialize(payload).map_err(|e| PayloadError::Invalid {
            event_type: Self::EVENT_TYPE.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    DineIn,
    Takeout,
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Wallet,
    Crypto,
    BankTransfer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifier {
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemAdded {
    pub order_id: String,
    pub menu_item_id: String,
    pub menu_item_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<Modifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmitted {
    pub order_id: String,
    pub total_amount: f64,
    pub subtotal: f64,
    pub tax_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<f64>,
    pub item_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCollected {
    pub order_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<PaymentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub order_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Signed stock correction; negative `quantity` removes stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAdjusted {
    pub ingredient_id: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashDrawerOpened {
    pub staff_id: String,
    pub opening_balance: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashDrawerClosed {
    pub staff_id: String,
    pub closing_balance: f64,
    pub currency: String,
}

macro_rules! domain_events {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        $(
            impl TypedPayload for $variant {
                const EVENT_TYPE: &'static str = $tag;
            }
        )+

        /// A decoded event payload.
        #[derive(Debug, Clone, PartialEq)]
        pub enum DomainEvent {
            $($variant($variant),)+
            /// A kind this build does not know; carried through untouched.
            Unknown {
                event_type: EventType,
                payload: JsonValue,
            },
        }

        impl DomainEvent {
            /// Decode `payload` according to `event_type`.
            pub fn parse(event_type: &EventType, payload: &JsonValue) -> Result<Self, PayloadError> {
                match event_type.as_str() {
                    $($tag => Ok(Self::$variant($variant::from_payload(payload)?)),)+
                    _ => Ok(Self::Unknown {
                        event_type: event_type.clone(),
                        payload: payload.clone(),
                    }),
                }
            }

            pub fn event_type(&self) -> EventType {
                match self {
                    $(Self::$variant(_) => $variant::event_type(),)+
                    Self::Unknown { event_type, .. } => event_type.clone(),
                }
            }

            pub fn to_payload(&self) -> Result<JsonValue, PayloadError> {
                match self {
                    $(Self::$variant(p) => p.to_payload(),)+
                    Self::Unknown { payload, .. } => Ok(payload.clone()),
                }
            }
        }

        $(
            impl From<$variant> for DomainEvent {
                fn from(value: $variant) -> Self {
                    Self::$variant(value)
                }
            }
        )+
    };
}

domain_events! {
    OrderCreated => "ORDER_CREATED",
    OrderItemAdded => "ORDER_ITEM_ADDED",
    OrderSubmitted => "ORDER_SUBMITTED",
    OrderCancelled => "ORDER_CANCELLED",
    PaymentCollected => "PAYMENT_COLLECTED",
    PaymentRefunded => "PAYMENT_REFUNDED",
    InventoryAdjusted => "INVENTORY_ADJUSTED",
    CashDrawerOpened => "CASH_DRAWER_OPENED",
    CashDrawerClosed => "CASH_DRAWER_CLOSED",
}

impl DomainEvent {
    pub fn from_event(event: &Event) -> Result<Self, PayloadError> {
        Self::parse(event.event_type(), event.payload())
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown { .. })
    }
}

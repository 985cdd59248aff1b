//! Core domain model for Shopzap product monitoring.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopzap-core";

/// Number of observations retained per product; older ones are evicted first.
pub const HISTORY_CAPACITY: usize = 5;

/// Canonical key of a monitored product.
///
/// This is the source URL with surrounding whitespace removed. No further
/// canonicalization is applied, so the same product reached through different
/// query parameters is tracked as two products.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductIdentity(String);

impl ProductIdentity {
    pub fn from_url(url: &str) -> Self {
        Self(url.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockStatus {
    #[serde(rename = "In Stock")]
    InStock,
    #[serde(rename = "Out of Stock")]
    OutOfStock,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InStock => "In Stock",
            Self::OutOfStock => "Out of Stock",
            Self::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Structured result of one extraction. Every scraped field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractionRecord {
    pub title: Option<String>,
    pub raw_price: Option<String>,
    pub numeric_price: Option<f64>,
    #[serde(rename = "stock")]
    pub stock_status: Option<StockStatus>,
    pub seller: Option<String>,
    /// Text read through a caller-supplied descriptor (generic adapter only).
    pub data: Option<String>,
    #[serde(rename = "url")]
    pub source_url: String,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExtractionRecord {
    pub fn empty(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    /// True when at least one scrapable field carries a value.
    pub fn has_any_field(&self) -> bool {
        self.title.is_some()
            || self.raw_price.is_some()
            || self.numeric_price.is_some()
            || self.stock_status.is_some()
            || self.seller.is_some()
            || self.data.is_some()
    }
}

/// One timestamped price/stock sample. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "price")]
    pub numeric_price: Option<f64>,
    #[serde(rename = "stock")]
    pub stock_status: Option<StockStatus>,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
}

/// Rolling window of the most recent observations of one product, newest last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductHistory {
    #[serde(rename = "id")]
    pub identity: ProductIdentity,
    #[serde(rename = "history", default)]
    observations: Vec<Observation>,
}

impl ProductHistory {
    pub fn new(identity: ProductIdentity) -> Self {
        Self {
            identity,
            observations: Vec::new(),
        }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn latest(&self) -> Option<&Observation> {
        self.observations.last()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Append and evict from the front until at most [`HISTORY_CAPACITY`] remain.
    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
        self.enforce_capacity();
    }

    /// Drop the oldest observations beyond [`HISTORY_CAPACITY`]. Needed for
    /// histories loaded from disk, which bypass [`ProductHistory::push`].
    pub fn enforce_capacity(&mut self) {
        if self.observations.len() > HISTORY_CAPACITY {
            let excess = self.observations.len() - HISTORY_CAPACITY;
            self.observations.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recurring extraction of one URL on a cron-style schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringTask {
    #[serde(rename = "id")]
    pub task_id: TaskId,
    #[serde(rename = "url")]
    pub target_url: String,
    #[serde(rename = "selector", default, skip_serializing_if = "Option::is_none")]
    pub field_descriptor: Option<String>,
    #[serde(rename = "frequency")]
    pub trigger_schedule: String,
}

impl MonitoringTask {
    pub fn new(
        target_url: impl Into<String>,
        field_descriptor: Option<String>,
        trigger_schedule: impl Into<String>,
    ) -> Self {
        Self {
            task_id: TaskId::generate(),
            target_url: target_url.into(),
            field_descriptor,
            trigger_schedule: trigger_schedule.into(),
        }
    }
}

/// Restock rule: fires only on an OutOfStock -> InStock edge.
pub fn should_alert(previous: Option<StockStatus>, current: Option<StockStatus>) -> bool {
    matches!(
        (previous, current),
        (Some(StockStatus::OutOfStock), Some(StockStatus::InStock))
    )
}

pub fn restock_message(product_name: &str, product_url: &str) -> String {
    format!("Stock Alert: {product_name} is now IN STOCK! \n{product_url}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(minute: u32, stock: Option<StockStatus>) -> Observation {
        Observation {
            numeric_price: Some(100.0 + f64::from(minute)),
            stock_status: stock,
            observed_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).single().unwrap(),
        }
    }

    #[test]
    fn history_is_capped_to_most_recent_five_in_arrival_order() {
        for n in 0..12u32 {
            let mut history = ProductHistory::new(ProductIdentity::from_url("https://shop.test/p"));
            for i in 0..n {
                history.push(obs(i, Some(StockStatus::InStock)));
            }
            assert_eq!(history.len(), (n as usize).min(HISTORY_CAPACITY));
            let minutes = history
                .observations()
                .iter()
                .map(|o| o.observed_at.format("%M").to_string().parse::<u32>().unwrap())
                .collect::<Vec<_>>();
            let expected = (n.saturating_sub(HISTORY_CAPACITY as u32)..n).collect::<Vec<_>>();
            assert_eq!(minutes, expected);
        }
    }

    #[test]
    fn alert_fires_only_on_restock_edge() {
        use StockStatus::*;
        let values = [None, Some(InStock), Some(OutOfStock), Some(Unknown)];
        for previous in values {
            for current in values {
                let expected = previous == Some(OutOfStock) && current == Some(InStock);
                assert_eq!(should_alert(previous, current), expected, "{previous:?} -> {current:?}");
            }
        }
        assert!(should_alert(Some(OutOfStock), Some(InStock)));
        assert!(!should_alert(None, Some(InStock)));
        assert!(!should_alert(Some(InStock), Some(OutOfStock)));
        assert!(!should_alert(Some(Unknown), Some(InStock)));
    }

    #[test]
    fn record_with_only_a_title_is_a_partial_success() {
        let mut record = ExtractionRecord::empty("https://www.amazon.in/dp/X");
        assert!(!record.has_any_field());
        record.title = Some("Widget".into());
        assert!(record.has_any_field());
    }

    #[test]
    fn persisted_shapes_use_flat_file_keys() {
        let task = MonitoringTask {
            task_id: TaskId::from("abc"),
            target_url: "https://www.flipkart.com/p".into(),
            field_descriptor: None,
            trigger_schedule: "*/5 * * * *".into(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "abc", "url": "https://www.flipkart.com/p", "frequency": "*/5 * * * *"})
        );

        let mut history = ProductHistory::new(ProductIdentity::from_url(" https://shop.test/p "));
        history.push(obs(1, Some(StockStatus::OutOfStock)));
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["id"], "https://shop.test/p");
        assert_eq!(json["history"][0]["stock"], "Out of Stock");
        assert_eq!(json["history"][0]["price"], 101.0);
    }
}

pub mod patch;
pub mod timestamp;

pub use patch::{ListingPatch, OwnerPatch, PropertyPatch};
pub use timestamp::Timestamp;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Land,
    Commercial,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "apartment",
            PropertyType::House => "house",
            PropertyType::Land => "land",
            PropertyType::Commercial => "commercial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Sale,
    Rent,
    Both,
    Seasonal,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Sale => "sale",
            Purpose::Rent => "rent",
            Purpose::Both => "both",
            Purpose::Seasonal => "seasonal",
        }
    }

    /// True when the purpose carries a rental component
    pub fn has_rental(&self) -> bool {
        !matches!(self, Purpose::Sale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Inactive,
}

impl ListingStatus {
    pub fn property_status(&self) -> PropertyStatus {
        match self {
            ListingStatus::Active => PropertyStatus::Available,
            ListingStatus::Inactive => PropertyStatus::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCompleteness {
    Complete,
    Partial,
    Incomplete,
}

/// Owner completeness tier. Ordered so that a higher tier compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerStatus {
    Incomplete,
    Partial,
    Verified,
}

impl OwnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerStatus::Incomplete => "incomplete",
            OwnerStatus::Partial => "partial",
            OwnerStatus::Verified => "verified",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    pub complement: String,
    pub neighborhood: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub formatted: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub sale_price: Option<f64>,
    pub rental_price: Option<f64>,
    pub seasonal_price: Option<f64>,
    pub condo_fee: Option<f64>,
    pub iptu: Option<f64>,
}

impl Pricing {
    /// Whether a price exists for the given purpose
    pub fn covers(&self, purpose: Purpose) -> bool {
        let positive = |p: Option<f64>| p.map(|v| v > 0.0).unwrap_or(false);
        match purpose {
            Purpose::Sale => positive(self.sale_price),
            Purpose::Rent => positive(self.rental_price),
            Purpose::Both => positive(self.sale_price) && positive(self.rental_price),
            Purpose::Seasonal => positive(self.seasonal_price),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalTerms {
    pub deposit_months: u32,
    pub accepted_guarantees: Vec<String>,
    pub min_rental_months: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub external_source: String,
    pub external_id: String,
    pub reference: String,
    pub title: String,
    pub description: String,
    pub property_type: PropertyType,
    pub category: String,
    pub purpose: Purpose,
    pub status: PropertyStatus,
    pub address: Address,
    pub pricing: Pricing,
    pub bedrooms: u32,
    pub bathrooms: u32,
    pub suites: u32,
    pub parking_spaces: u32,
    pub built_area: f64,
    pub total_area: f64,
    pub rental_terms: Option<RentalTerms>,
    pub fingerprint: String,
    pub possible_duplicate: bool,
    pub(crate) data_completeness: DataCompleteness,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Property {
    pub fn data_completeness(&self) -> DataCompleteness {
        self.data_completeness
    }

    /// The (source, external id) pair, when both parts are present
    pub fn external_key(&self) -> Option<(&str, &str)> {
        if self.external_source.is_empty() || self.external_id.is_empty() {
            None
        } else {
            Some((self.external_source.as_str(), self.external_id.as_str()))
        }
    }

    /// Recompute the derived completeness from the current field values
    pub(crate) fn assess_completeness(&mut self, photo_count: usize) {
        let a = &self.address;
        self.data_completeness = if a.street.is_empty() || a.city.is_empty() {
            DataCompleteness::Incomplete
        } else if !a.number.is_empty()
            && !a.neighborhood.is_empty()
            && self.total_area > 0.0
            && self.pricing.covers(self.purpose)
            && photo_count > 0
        {
            DataCompleteness::Complete
        } else {
            DataCompleteness::Partial
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub owner_status: OwnerStatus,
    pub enriched_from_xls: bool,
    pub source_reference: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One rendered (or not yet rendered) photo inside a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub original_url: String,
    pub thumb_url: String,
    pub medium_url: String,
    pub large_url: String,
    pub order: u32,
    pub is_cover: bool,
}

impl Photo {
    /// Placeholder entry pointing every size at the source URL
    pub fn degenerate(url: &str, order: u32) -> Self {
        Self {
            original_url: url.to_string(),
            thumb_url: url.to_string(),
            medium_url: url.to_string(),
            large_url: url.to_string(),
            order,
            is_cover: order == 0,
        }
    }

    pub fn is_rendered(&self) -> bool {
        self.thumb_url != self.original_url
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub property_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub import_batch_id: Option<Uuid>,
    pub status: ListingStatus,
    pub purpose: Purpose,
    pub title: String,
    pub description: String,
    pub sale_price: Option<f64>,
    pub rental_price: Option<f64>,
    pub photos: Vec<Photo>,
    pub is_canonical: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyRole {
    OriginatingBroker,
}

impl PropertyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyRole::OriginatingBroker => "originating_broker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Processing)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub total_records: u64,
    pub properties_created: u64,
    pub matched_existing: u64,
    pub possible_duplicates: u64,
    pub owners_from_enrichment: u64,
    pub owners_placeholder: u64,
    pub listings_created: u64,
    pub errors: u64,
    pub enrichment_rows_skipped: u64,
    pub photos_rendered: u64,
    pub photos_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source: String,
    pub created_by: Option<Uuid>,
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportBatch {
    pub fn new(tenant_id: Uuid, source: &str, created_by: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            source: source.to_string(),
            created_by,
            status: BatchStatus::Processing,
            counters: BatchCounters::default(),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A batch created by a person rather than the scheduler/system account
    pub fn human_actor(&self) -> Option<Uuid> {
        self.created_by.filter(|id| !id.is_nil())
    }

    /// Seal as completed. Returns false if the batch was already terminal.
    pub fn mark_completed(&mut self) -> bool {
        self.seal(BatchStatus::Completed, None)
    }

    /// Seal as failed, keeping the triggering error. Returns false if already terminal.
    pub fn mark_failed(&mut self, message: impl Into<String>) -> bool {
        self.seal(BatchStatus::Failed, Some(message.into()))
    }

    fn seal(&mut self, status: BatchStatus, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error_message = message;
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Append-only audit entry for a record-level or batch-level failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportErrorRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub raw_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ImportErrorRecord {
    pub fn new(batch_id: Uuid, kind: ErrorKind, message: impl Into<String>, raw_data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            kind,
            message: message.into(),
            raw_data,
            created_at: Utc::now(),
        }
    }
}

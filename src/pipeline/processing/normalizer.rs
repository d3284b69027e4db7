use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::*;
use crate::pipeline::ingestion::enrichment::{normalize_header as fold, EnrichmentRecord};
use crate::pipeline::ingestion::feed::FeedRecord;

/// Keyword families checked in this order; the first family with a hit wins
const TYPE_FAMILIES: &[(PropertyType, &[&str])] = &[
    (PropertyType::Land, &["terreno", "lote", "gleba", "land"]),
    (
        PropertyType::Commercial,
        &[
            "comercial",
            "sala",
            "loja",
            "galpao",
            "predio",
            "escritorio",
            "ponto",
            "commercial",
            "office",
            "store",
        ],
    ),
    (PropertyType::House, &["casa", "sobrado", "chacara", "sitio", "fazenda", "house"]),
    (
        PropertyType::Apartment,
        &["apartamento", "apto", "cobertura", "flat", "kitnet", "studio", "loft", "apartment"],
    ),
];

pub const DEFAULT_DEPOSIT_MONTHS: u32 = 3;
pub const DEFAULT_GUARANTEES: &[&str] = &["deposit", "guarantor", "surety_insurance"];
pub const DEFAULT_MIN_RENTAL_MONTHS: u32 = 30;

/// Owner data derived for one feed record, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerPayload {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub owner_status: OwnerStatus,
    pub enriched_from_xls: bool,
    pub source_reference: String,
}

impl OwnerPayload {
    pub fn into_owner(self, tenant_id: Uuid) -> Owner {
        let now = Utc::now();
        Owner {
            id: None,
            tenant_id,
            name: self.name,
            phone: self.phone,
            email: self.email,
            company: self.company,
            owner_status: self.owner_status,
            enriched_from_xls: self.enriched_from_xls,
            source_reference: self.source_reference,
            created_at: now,
            updated_at: now,
        }
    }

    /// The patch that carries this payload's contact data onto an existing owner
    pub fn to_patch(&self) -> OwnerPatch {
        let mut patch = OwnerPatch::new().owner_status(self.owner_status);
        if self.enriched_from_xls {
            patch = patch.name(&self.name).enriched_from_xls(true);
        }
        if let Some(phone) = &self.phone {
            patch = patch.phone(phone);
        }
        if let Some(email) = &self.email {
            patch = patch.email(email);
        }
        if let Some(company) = &self.company {
            patch = patch.company(company);
        }
        patch
    }
}

/// Canonical shapes derived from one feed record
#[derive(Debug, Clone)]
pub struct NormalizedPayload {
    pub property: Property,
    pub owner: OwnerPayload,
    pub photo_urls: Vec<String>,
    pub listing_status: ListingStatus,
    /// The feed record as received, kept for the error audit
    pub raw: serde_json::Value,
}

/// Map a feed record (and its enrichment row, if any) to canonical shapes.
/// Pure: no I/O, no lookups.
pub fn normalize(
    feed: &FeedRecord,
    enrichment: Option<&EnrichmentRecord>,
    tenant_id: Uuid,
    source: &str,
) -> NormalizedPayload {
    let purpose = purpose_for(feed);
    let listing_status = listing_status_for(feed);
    let property_type = property_type_for(&feed.property_type, &feed.category);

    let address = Address {
        street: feed.street.trim().to_string(),
        number: feed.number.trim().to_string(),
        complement: feed.complement.trim().to_string(),
        neighborhood: feed.neighborhood.trim().to_string(),
        city: feed.city.trim().to_string(),
        state: feed.state.trim().to_string(),
        zip_code: feed.zip_code.trim().to_string(),
        latitude: feed.latitude,
        longitude: feed.longitude,
        formatted: format_address(
            &feed.street,
            &feed.number,
            &feed.complement,
            &feed.neighborhood,
            &feed.city,
            &feed.state,
        ),
    };

    let fingerprint = fingerprint(
        &feed.street,
        &feed.number,
        &feed.neighborhood,
        &feed.city,
        property_type,
        feed.total_area,
    );

    let mut property = Property {
        id: None,
        tenant_id,
        owner_id: None,
        external_source: source.trim().to_string(),
        external_id: feed.external_id.trim().to_string(),
        reference: feed.reference.trim().to_string(),
        title: title_for(feed),
        description: feed.description.trim().to_string(),
        property_type,
        category: feed.category.trim().to_string(),
        purpose,
        status: listing_status.property_status(),
        address,
        pricing: Pricing {
            sale_price: feed.sale_price,
            rental_price: feed.rental_price,
            seasonal_price: feed.seasonal_price,
            condo_fee: feed.condo_fee,
            iptu: feed.iptu,
        },
        bedrooms: feed.bedrooms,
        bathrooms: feed.bathrooms,
        suites: feed.suites,
        parking_spaces: feed.parking_spaces,
        built_area: feed.built_area,
        total_area: feed.total_area,
        rental_terms: rental_terms_for(purpose),
        fingerprint,
        possible_duplicate: false,
        data_completeness: DataCompleteness::Incomplete,
        source_updated_at: feed.updated_at.as_ref().and_then(|t| t.as_datetime()),
        created_at: Utc::now(),
    };
    property.assess_completeness(feed.photo_urls.len());

    NormalizedPayload {
        property,
        owner: owner_payload(feed, enrichment),
        photo_urls: feed.photo_urls.clone(),
        listing_status,
        raw: serde_json::to_value(feed).unwrap_or(serde_json::Value::Null),
    }
}

/// Heuristic duplicate key over address, type and area. Bit-for-bit stable:
/// `sha256("<street>|<number>|<neighborhood>|<city>|<type>|<area:.2>")` with
/// the text parts trimmed and lower-cased.
pub fn fingerprint(
    street: &str,
    number: &str,
    neighborhood: &str,
    city: &str,
    property_type: PropertyType,
    total_area: f64,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{:.2}",
        street.trim().to_lowercase(),
        number.trim().to_lowercase(),
        neighborhood.trim().to_lowercase(),
        city.trim().to_lowercase(),
        property_type.as_str(),
        total_area
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn purpose_for(feed: &FeedRecord) -> Purpose {
    match (feed.for_sale, feed.for_rent, feed.seasonal) {
        (true, true, _) => Purpose::Both,
        (false, true, _) => Purpose::Rent,
        (false, false, true) => Purpose::Seasonal,
        _ => Purpose::Sale,
    }
}

pub fn listing_status_for(feed: &FeedRecord) -> ListingStatus {
    if feed.for_sale || feed.for_rent || feed.seasonal {
        ListingStatus::Active
    } else {
        ListingStatus::Inactive
    }
}

/// Vocabulary lookup on the feed type, then on the category. Unknown input
/// maps to apartment.
pub fn property_type_for(raw_type: &str, category: &str) -> PropertyType {
    [raw_type, category]
        .iter()
        .find_map(|text| match_family(&fold(text)))
        .unwrap_or(PropertyType::Apartment)
}

fn match_family(folded: &str) -> Option<PropertyType> {
    if folded.is_empty() {
        return None;
    }
    TYPE_FAMILIES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| folded.contains(k)))
        .map(|(family, _)| *family)
}

fn rental_terms_for(purpose: Purpose) -> Option<RentalTerms> {
    purpose.has_rental().then(|| RentalTerms {
        deposit_months: DEFAULT_DEPOSIT_MONTHS,
        accepted_guarantees: DEFAULT_GUARANTEES.iter().map(|g| g.to_string()).collect(),
        min_rental_months: DEFAULT_MIN_RENTAL_MONTHS,
    })
}

fn title_for(feed: &FeedRecord) -> String {
    let title = feed.title.trim();
    if !title.is_empty() {
        return title.to_string();
    }
    [feed.property_type.trim(), feed.reference.trim()]
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `"<street>, <number> - <complement> - <neighborhood>, <city>/<state>"`,
/// leaving out empty parts together with their separators
pub fn format_address(
    street: &str,
    number: &str,
    complement: &str,
    neighborhood: &str,
    city: &str,
    state: &str,
) -> String {
    fn join(parts: &[&str], sep: &str) -> String {
        parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(sep)
    }

    let head = join(&[street, number], ", ");
    let body = join(&[&head, complement, neighborhood], " - ");
    let locality = join(&[city, state], "/");
    join(&[&body, &locality], ", ")
}

fn owner_payload(feed: &FeedRecord, enrichment: Option<&EnrichmentRecord>) -> OwnerPayload {
    let reference = if feed.reference.trim().is_empty() {
        feed.external_id.trim()
    } else {
        feed.reference.trim()
    };
    let non_empty = |v: &str| {
        let v = v.trim();
        (!v.is_empty()).then(|| v.to_string())
    };

    if let Some(row) = enrichment.filter(|r| !r.owner_name.trim().is_empty()) {
        let phone = non_empty(&row.phone);
        let email = non_empty(&row.email);
        let owner_status = if phone.is_some() && email.is_some() {
            OwnerStatus::Verified
        } else {
            OwnerStatus::Partial
        };
        return OwnerPayload {
            name: row.owner_name.trim().to_string(),
            phone,
            email,
            company: non_empty(&row.company),
            owner_status,
            enriched_from_xls: true,
            source_reference: reference.to_string(),
        };
    }

    let (name, owner_status) = match non_empty(&feed.captured_by) {
        Some(agent) => (
            format!("Owner of {} (captured by: {})", reference, agent),
            OwnerStatus::Partial,
        ),
        None => (format!("Owner of {}", reference), OwnerStatus::Incomplete),
    };

    OwnerPayload {
        name,
        phone: None,
        email: None,
        company: None,
        owner_status,
        enriched_from_xls: false,
        source_reference: reference.to_string(),
    }
}

//! Shared builders for unit tests

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{Listing, ListingStatus, Photo, Property, Purpose};
use crate::pipeline::ingestion::FeedRecord;
use crate::pipeline::processing::normalize;

/// A sale apartment at Rua A, 100 - Centro, SP with 80 m²
pub fn feed_record(external_id: &str, reference: &str) -> FeedRecord {
    FeedRecord {
        external_id: external_id.to_string(),
        reference: reference.to_string(),
        property_type: "Apartamento".to_string(),
        street: "Rua A".to_string(),
        number: "100".to_string(),
        neighborhood: "Centro".to_string(),
        city: "SP".to_string(),
        total_area: 80.0,
        for_sale: true,
        sale_price: Some(450_000.0),
        ..Default::default()
    }
}

pub fn property(tenant_id: Uuid, external_id: &str) -> Property {
    let reference = format!("AP{}", external_id);
    normalize(&feed_record(external_id, &reference), None, tenant_id, "vista").property
}

pub fn listing(tenant_id: Uuid, property_id: Uuid) -> Listing {
    let now = Utc::now();
    Listing {
        id: None,
        tenant_id,
        property_id,
        owner_id: None,
        import_batch_id: None,
        status: ListingStatus::Active,
        purpose: Purpose::Sale,
        title: "Apartamento AP".to_string(),
        description: String::new(),
        sale_price: Some(450_000.0),
        rental_price: None,
        photos: vec![Photo::degenerate("http://cdn.example.com/1.jpg", 0)],
        is_canonical: false,
        created_at: now,
        updated_at: now,
    }
}

//! Typed post-creation updates. Identity fields (ids, tenant, external key,
//! fingerprint) have no setter here and cannot be changed through a patch.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{Listing, ListingStatus, Owner, OwnerStatus, Photo, Property, PropertyStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerPatch {
    name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    company: Option<String>,
    owner_status: Option<OwnerStatus>,
    enriched_from_xls: Option<bool>,
}

impl OwnerPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn owner_status(mut self, status: OwnerStatus) -> Self {
        self.owner_status = Some(status);
        self
    }

    pub fn enriched_from_xls(mut self, enriched: bool) -> Self {
        self.enriched_from_xls = Some(enriched);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.company.is_none()
            && self.owner_status.is_none()
            && self.enriched_from_xls.is_none()
    }

    /// Apply to an owner. Empty values never erase known contact data and the
    /// completeness tier only moves up.
    pub fn apply(self, owner: &mut Owner) {
        fn merge(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                *slot = Some(v);
            }
        }

        if let Some(name) = self.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            owner.name = name;
        }
        merge(&mut owner.phone, self.phone);
        merge(&mut owner.email, self.email);
        merge(&mut owner.company, self.company);
        if let Some(status) = self.owner_status {
            owner.owner_status = owner.owner_status.max(status);
        }
        if let Some(true) = self.enriched_from_xls {
            owner.enriched_from_xls = true;
        }
        owner.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingPatch {
    photos: Option<Vec<Photo>>,
    status: Option<ListingStatus>,
    title: Option<String>,
    description: Option<String>,
}

impl ListingPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn photos(mut self, photos: Vec<Photo>) -> Self {
        self.photos = Some(photos);
        self
    }

    pub fn status(mut self, status: ListingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn apply(self, listing: &mut Listing) {
        if let Some(mut photos) = self.photos {
            photos.sort_by_key(|p| p.order);
            listing.photos = photos;
        }
        if let Some(status) = self.status {
            listing.status = status;
        }
        if let Some(title) = self.title {
            listing.title = title;
        }
        if let Some(description) = self.description {
            listing.description = description;
        }
        listing.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyPatch {
    status: Option<PropertyStatus>,
    clear_possible_duplicate: bool,
}

impl PropertyPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: PropertyStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Mark a surfaced possible duplicate as reviewed
    pub fn clear_possible_duplicate(mut self) -> Self {
        self.clear_possible_duplicate = true;
        self
    }

    pub fn apply(self, property: &mut Property) {
        if let Some(status) = self.status {
            property.status = status;
        }
        if self.clear_possible_duplicate {
            property.possible_duplicate = false;
        }
    }
}

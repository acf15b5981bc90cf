// src/services/normalizer.rs

//! Maps source detail payloads onto `NormalizedRecord`.

use crate::error::{AppError, Result};
use crate::models::{
    ListingPayload, Location, NormalizedRecord, Operation, Price, RawPayload,
};
use crate::services::Normalizer;

const DEFAULT_CURRENCY: &str = "EUR";

/// Normalizer for listing detail payloads.
#[derive(Debug, Clone, Default)]
pub struct ListingNormalizer;

impl ListingNormalizer {
    pub fn new() -> Self {
        Self
    }

    fn title(payload: &ListingPayload) -> String {
        if let Some(title) = payload.title.as_deref().map(clean_text).filter(|t| !t.is_empty()) {
            return title;
        }

        // Fall back to "<type> in <city>" and finally to the id
        match (&payload.property_type, &payload.city) {
            (Some(kind), Some(city)) => format!("{} in {}", clean_text(kind), clean_text(city)),
            (Some(kind), None) => clean_text(kind),
            _ => format!("Listing {}", payload.id),
        }
    }
}

impl Normalizer for ListingNormalizer {
    fn normalize(&self, id: &str, raw: &RawPayload) -> Result<NormalizedRecord> {
        let payload: ListingPayload = serde_json::from_str(&raw.body)
            .map_err(|e| AppError::normalize(id, format!("invalid payload: {e}")))?;

        if payload.id != id {
            return Err(AppError::normalize(
                id,
                format!("payload belongs to item {}", payload.id),
            ));
        }

        let price = match payload.price {
            Some(amount) if !amount.is_finite() || amount < 0.0 => {
                return Err(AppError::normalize(id, format!("invalid price {amount}")));
            }
            Some(amount) => Some(Price {
                amount,
                currency: payload
                    .currency
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            }),
            None => None,
        };

        Ok(NormalizedRecord {
            id: payload.id.clone(),
            title: Self::title(&payload),
            description: payload
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            operation: payload
                .operation
                .as_deref()
                .map(Operation::parse)
                .unwrap_or(Operation::Unknown),
            property_type: payload.property_type.clone(),
            price,
            location: Location {
                address: payload.address.clone(),
                city: payload.city.clone(),
                latitude: payload.latitude,
                longitude: payload.longitude,
            },
            area_m2: payload.area.filter(|a| *a > 0.0),
            rooms: payload.rooms,
            bathrooms: payload.bathrooms,
            images: payload.images.clone(),
            url: payload.url.clone(),
            agency: payload.agency.clone(),
            source_updated_at: payload.updated_at.clone(),
        })
    }
}

/// Collapse runs of whitespace into single spaces.
fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(id: &str, body: &str) -> Result<NormalizedRecord> {
        ListingNormalizer::new().normalize(id, &RawPayload::new(body))
    }

    #[test]
    fn test_normalize_full_payload() {
        let record = normalize(
            "98765",
            r#"{
                "propertyCode": "98765",
                "suggestedTexts": "  Piso   luminoso\n en Chamberí ",
                "price": 350000,
                "currency": "eur",
                "operation": "sale",
                "propertyType": "flat",
                "municipality": "Madrid",
                "size": 85.5,
                "rooms": 3,
                "images": ["https://img.example/1.jpg"]
            }"#,
        )
        .unwrap();

        assert_eq!(record.id, "98765");
        assert_eq!(record.title, "Piso luminoso en Chamberí");
        assert_eq!(record.operation, Operation::Sale);
        assert_eq!(
            record.price,
            Some(Price {
                amount: 350000.0,
                currency: "EUR".to_string()
            })
        );
        assert_eq!(record.location.city.as_deref(), Some("Madrid"));
        assert_eq!(record.area_m2, Some(85.5));
        assert_eq!(record.images.len(), 1);
    }

    #[test]
    fn test_title_fallbacks() {
        let record = normalize(
            "1",
            r#"{"id": 1, "propertyType": "chalet", "city": "Valencia"}"#,
        )
        .unwrap();
        assert_eq!(record.title, "chalet in Valencia");
        assert_eq!(record.price, None);

        let record = normalize("2", r#"{"id": "2"}"#).unwrap();
        assert_eq!(record.title, "Listing 2");
        assert_eq!(record.operation, Operation::Unknown);
    }

    #[test]
    fn test_default_currency() {
        let record = normalize("3", r#"{"id": "3", "price": 900}"#).unwrap();
        assert_eq!(record.price.unwrap().currency, "EUR");
    }

    #[test]
    fn test_rejects_schema_violations() {
        assert!(normalize("4", "not json").is_err());
        assert!(normalize("4", r#"{"price": 10}"#).is_err());
        assert!(normalize("4", r#"{"id": "4", "rooms": "three"}"#).is_err());
    }

    #[test]
    fn test_rejects_foreign_payload() {
        let err = normalize("5", r#"{"id": "6"}"#).unwrap_err();
        assert!(err.to_string().contains("item 6"));
    }

    #[test]
    fn test_rejects_negative_price() {
        assert!(normalize("7", r#"{"id": "7", "price": -1}"#).is_err());
    }
}

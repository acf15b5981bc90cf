//! Listing payload schema and the normalized record sent downstream.

use serde::{Deserialize, Deserializer, Serialize};

/// Detail payload as published by the source, validated at parse time.
///
/// Only `id` is required; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPayload {
    #[serde(alias = "propertyCode", deserialize_with = "string_or_number")]
    pub id: String,

    #[serde(default, alias = "suggestedTexts")]
    pub title: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub price: Option<f64>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub operation: Option<String>,

    #[serde(default)]
    pub property_type: Option<String>,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default, alias = "municipality")]
    pub city: Option<String>,

    #[serde(default)]
    pub latitude: Option<f64>,

    #[serde(default)]
    pub longitude: Option<f64>,

    #[serde(default, alias = "size")]
    pub area: Option<f64>,

    #[serde(default)]
    pub rooms: Option<u32>,

    #[serde(default)]
    pub bathrooms: Option<u32>,

    #[serde(default)]
    pub images: Vec<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub agency: Option<String>,

    #[serde(default, alias = "modificationDate")]
    pub updated_at: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(s) if s.trim().is_empty() => Err(serde::de::Error::custom("empty id")),
        Raw::Text(s) => Ok(s.trim().to_string()),
        Raw::Int(n) => Ok(n.to_string()),
    }
}

/// Transaction type of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sale,
    Rent,
    Unknown,
}

impl Operation {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "sale" | "sell" | "venta" | "buy" => Self::Sale,
            "rent" | "rental" | "alquiler" | "lease" => Self::Rent,
            _ => Self::Unknown,
        }
    }
}

/// Price with its currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

/// Geographic location of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub address: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Source-independent record handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub operation: Operation,
    pub property_type: Option<String>,
    pub price: Option<Price>,
    pub location: Location,
    pub area_m2: Option<f64>,
    pub rooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub images: Vec<String>,
    pub url: Option<String>,
    pub agency: Option<String>,
    pub source_updated_at: Option<String>,
}

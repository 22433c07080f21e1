//! The editable record produced by document extraction.
//!
//! Every leaf is a `String`, including numeric-looking values such as the
//! model year or odometer, so that the user can type freely. A record built
//! through [`ExtractedRecord::from_output`] is total: keys missing from the
//! extraction payload become empty strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AppError, AppResult};

const DROPOFF_SECTION_KEYS: &[&str] = &["dropoff_location", "drop_off_location"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    /// Parses a stored text pair. Blank or non-finite components yield `None`.
    pub fn parse(lat: &str, lng: &str) -> Option<Self> {
        let lat = lat.trim().parse::<f64>().ok()?;
        let lng = lng.trim().parse::<f64>().ok()?;
        let coords = Self { lat, lng };
        coords.is_finite().then_some(coords)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Vehicle,
    SellingDealership,
    BuyingDealership,
    PickupLocation,
    DropoffLocation,
    Transaction,
    Authorization,
    DealerNotes,
}

impl Section {
    pub const ALL: [Section; 8] = [
        Section::Vehicle,
        Section::SellingDealership,
        Section::BuyingDealership,
        Section::PickupLocation,
        Section::DropoffLocation,
        Section::Transaction,
        Section::Authorization,
        Section::DealerNotes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Vehicle => "vehicle",
            Section::SellingDealership => "selling_dealership",
            Section::BuyingDealership => "buying_dealership",
            Section::PickupLocation => "pickup_location",
            Section::DropoffLocation => "dropoff_location",
            Section::Transaction => "transaction",
            Section::Authorization => "authorization",
            Section::DealerNotes => "dealer_notes",
        }
    }

    pub fn keys(&self) -> &'static [&'static str] {
        match self {
            Section::Vehicle => &[
                "vin",
                "year",
                "make",
                "model",
                "transmission",
                "odometer_km",
                "exterior_color",
                "interior_color",
                "has_accident",
            ],
            Section::SellingDealership => &["name", "phone", "address"],
            Section::BuyingDealership => &["name", "phone", "contact_name"],
            Section::PickupLocation => &["name", "address", "phone"],
            Section::DropoffLocation => &["name", "phone", "address", "lat", "lng"],
            Section::Transaction => &[
                "transaction_id",
                "release_form_number",
                "release_date",
                "arrival_date",
            ],
            Section::Authorization => &["released_by_name", "released_to_name"],
            Section::DealerNotes => &["dealer_notes"],
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        match value.trim() {
            "drop_off_location" => Ok(Section::DropoffLocation),
            other => Section::ALL
                .iter()
                .copied()
                .find(|section| section.as_str() == other)
                .ok_or_else(|| AppError::Parse(format!("unknown record section: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vehicle {
    pub vin: String,
    pub year: String,
    pub make: String,
    pub model: String,
    pub transmission: String,
    pub odometer_km: String,
    pub exterior_color: String,
    pub interior_color: String,
    pub has_accident: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SellingDealership {
    pub name: String,
    pub phone: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuyingDealership {
    pub name: String,
    pub phone: String,
    pub contact_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickupLocation {
    pub name: String,
    pub address: String,
    pub phone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoffLocation {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub lat: String,
    pub lng: String,
}

impl DropoffLocation {
    /// Coordinates count as present only next to a non-empty address.
    pub fn coordinates(&self) -> Option<Coordinates> {
        if self.address.trim().is_empty() {
            return None;
        }
        Coordinates::parse(&self.lat, &self.lng)
    }

    pub fn has_coordinate_text(&self) -> bool {
        !self.lat.trim().is_empty() || !self.lng.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub transaction_id: String,
    pub release_form_number: String,
    pub release_date: String,
    pub arrival_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authorization {
    pub released_by_name: String,
    pub released_to_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedRecord {
    pub vehicle: Vehicle,
    pub selling_dealership: SellingDealership,
    pub buying_dealership: BuyingDealership,
    pub pickup_location: PickupLocation,
    pub dropoff_location: DropoffLocation,
    pub transaction: Transaction,
    pub authorization: Authorization,
    pub dealer_notes: String,
}

impl ExtractedRecord {
    /// Maps the raw `output` object of an extraction response onto the full
    /// schema. `None` or a JSON `null` yields no record.
    pub fn from_output(output: Option<&Value>) -> Option<Self> {
        let output = output.filter(|value| !value.is_null())?;
        let field = |section: &str, key: &str| text_at(output, &[section], key);
        let dropoff = |key: &str| text_at(output, DROPOFF_SECTION_KEYS, key);

        Some(Self {
            vehicle: Vehicle {
                vin: field("vehicle", "vin"),
                year: field("vehicle", "year"),
                make: field("vehicle", "make"),
                model: field("vehicle", "model"),
                transmission: field("vehicle", "transmission"),
                odometer_km: field("vehicle", "odometer_km"),
                exterior_color: field("vehicle", "exterior_color"),
                interior_color: field("vehicle", "interior_color"),
                has_accident: field("vehicle", "has_accident"),
            },
            selling_dealership: SellingDealership {
                name: field("selling_dealership", "name"),
                phone: field("selling_dealership", "phone"),
                address: field("selling_dealership", "address"),
            },
            buying_dealership: BuyingDealership {
                name: field("buying_dealership", "name"),
                phone: field("buying_dealership", "phone"),
                contact_name: field("buying_dealership", "contact_name"),
            },
            pickup_location: PickupLocation {
                name: field("pickup_location", "name"),
                address: field("pickup_location", "address"),
                phone: field("pickup_location", "phone"),
            },
            dropoff_location: DropoffLocation {
                name: dropoff("name"),
                phone: dropoff("phone"),
                address: dropoff("address"),
                lat: dropoff("lat"),
                lng: dropoff("lng"),
            },
            transaction: Transaction {
                transaction_id: field("transaction", "transaction_id"),
                release_form_number: field("transaction", "release_form_number"),
                release_date: field("transaction", "release_date"),
                arrival_date: field("transaction", "arrival_date"),
            },
            authorization: Authorization {
                released_by_name: field("authorization", "released_by_name"),
                released_to_name: field("authorization", "released_to_name"),
            },
            dealer_notes: scalar_text(output.get("dealer_notes")),
        })
    }

    pub fn field(&self, section: Section, key: &str) -> AppResult<&str> {
        let value = match (section, key) {
            (Section::Vehicle, "vin") => &self.vehicle.vin,
            (Section::Vehicle, "year") => &self.vehicle.year,
            (Section::Vehicle, "make") => &self.vehicle.make,
            (Section::Vehicle, "model") => &self.vehicle.model,
            (Section::Vehicle, "transmission") => &self.vehicle.transmission,
            (Section::Vehicle, "odometer_km") => &self.vehicle.odometer_km,
            (Section::Vehicle, "exterior_color") => &self.vehicle.exterior_color,
            (Section::Vehicle, "interior_color") => &self.vehicle.interior_color,
            (Section::Vehicle, "has_accident") => &self.vehicle.has_accident,
            (Section::SellingDealership, "name") => &self.selling_dealership.name,
            (Section::SellingDealership, "phone") => &self.selling_dealership.phone,
            (Section::SellingDealership, "address") => &self.selling_dealership.address,
            (Section::BuyingDealership, "name") => &self.buying_dealership.name,
            (Section::BuyingDealership, "phone") => &self.buying_dealership.phone,
            (Section::BuyingDealership, "contact_name") => &self.buying_dealership.contact_name,
            (Section::PickupLocation, "name") => &self.pickup_location.name,
            (Section::PickupLocation, "address") => &self.pickup_location.address,
            (Section::PickupLocation, "phone") => &self.pickup_location.phone,
            (Section::DropoffLocation, "name") => &self.dropoff_location.name,
            (Section::DropoffLocation, "phone") => &self.dropoff_location.phone,
            (Section::DropoffLocation, "address") => &self.dropoff_location.address,
            (Section::DropoffLocation, "lat") => &self.dropoff_location.lat,
            (Section::DropoffLocation, "lng") => &self.dropoff_location.lng,
            (Section::Transaction, "transaction_id") => &self.transaction.transaction_id,
            (Section::Transaction, "release_form_number") => {
                &self.transaction.release_form_number
            }
            (Section::Transaction, "release_date") => &self.transaction.release_date,
            (Section::Transaction, "arrival_date") => &self.transaction.arrival_date,
            (Section::Authorization, "released_by_name") => {
                &self.authorization.released_by_name
            }
            (Section::Authorization, "released_to_name") => {
                &self.authorization.released_to_name
            }
            (Section::DealerNotes, "dealer_notes") => &self.dealer_notes,
            _ => return Err(unknown_field(section, key)),
        };
        Ok(value.as_str())
    }

    /// Replaces one leaf. Returns whether the stored text actually changed;
    /// sibling fields are never touched.
    pub fn set_field(&mut self, section: Section, key: &str, value: &str) -> AppResult<bool> {
        let slot = self.field_mut(section, key)?;
        if slot == value {
            return Ok(false);
        }
        value.clone_into(slot);
        Ok(true)
    }

    fn field_mut(&mut self, section: Section, key: &str) -> AppResult<&mut String> {
        let slot = match (section, key) {
            (Section::Vehicle, "vin") => &mut self.vehicle.vin,
            (Section::Vehicle, "year") => &mut self.vehicle.year,
            (Section::Vehicle, "make") => &mut self.vehicle.make,
            (Section::Vehicle, "model") => &mut self.vehicle.model,
            (Section::Vehicle, "transmission") => &mut self.vehicle.transmission,
            (Section::Vehicle, "odometer_km") => &mut self.vehicle.odometer_km,
            (Section::Vehicle, "exterior_color") => &mut self.vehicle.exterior_color,
            (Section::Vehicle, "interior_color") => &mut self.vehicle.interior_color,
            (Section::Vehicle, "has_accident") => &mut self.vehicle.has_accident,
            (Section::SellingDealership, "name") => &mut self.selling_dealership.name,
            (Section::SellingDealership, "phone") => &mut self.selling_dealership.phone,
            (Section::SellingDealership, "address") => &mut self.selling_dealership.address,
            (Section::BuyingDealership, "name") => &mut self.buying_dealership.name,
            (Section::BuyingDealership, "phone") => &mut self.buying_dealership.phone,
            (Section::BuyingDealership, "contact_name") => {
                &mut self.buying_dealership.contact_name
            }
            (Section::PickupLocation, "name") => &mut self.pickup_location.name,
            (Section::PickupLocation, "address") => &mut self.pickup_location.address,
            (Section::PickupLocation, "phone") => &mut self.pickup_location.phone,
            (Section::DropoffLocation, "name") => &mut self.dropoff_location.name,
            (Section::DropoffLocation, "phone") => &mut self.dropoff_location.phone,
            (Section::DropoffLocation, "address") => &mut self.dropoff_location.address,
            (Section::DropoffLocation, "lat") => &mut self.dropoff_location.lat,
            (Section::DropoffLocation, "lng") => &mut self.dropoff_location.lng,
            (Section::Transaction, "transaction_id") => &mut self.transaction.transaction_id,
            (Section::Transaction, "release_form_number") => {
                &mut self.transaction.release_form_number
            }
            (Section::Transaction, "release_date") => &mut self.transaction.release_date,
            (Section::Transaction, "arrival_date") => &mut self.transaction.arrival_date,
            (Section::Authorization, "released_by_name") => {
                &mut self.authorization.released_by_name
            }
            (Section::Authorization, "released_to_name") => {
                &mut self.authorization.released_to_name
            }
            (Section::DealerNotes, "dealer_notes") => &mut self.dealer_notes,
            _ => return Err(unknown_field(section, key)),
        };
        Ok(slot)
    }
}

fn unknown_field(section: Section, key: &str) -> AppError {
    AppError::UnknownField {
        section: section.as_str().to_string(),
        key: key.to_string(),
    }
}

/// First non-null value for `key` across the candidate section spellings.
fn text_at(output: &Value, sections: &[&str], key: &str) -> String {
    let value = sections
        .iter()
        .filter_map(|section| output.get(*section))
        .filter_map(|section| section.get(key))
        .find(|value| !value.is_null());
    scalar_text(value)
}

fn scalar_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number_text(number),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    }
}

// Integral floats print without a fractional part, e.g. `2020.0` -> "2020".
fn number_text(number: &serde_json::Number) -> String {
    if number.is_f64() {
        if let Some(value) = number.as_f64() {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                return format!("{}", value as i64);
            }
            return value.to_string();
        }
    }
    number.to_string()
}

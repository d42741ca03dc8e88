use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Language {
    #[serde(rename = "EN")]
    En,
    #[serde(rename = "UK")]
    Uk,
}

impl Language {
    /// Lenient parse of whatever the LLM hands us ("english", "Ukrainian", "uk", ...).
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "en" | "eng" | "english" => Some(Language::En),
            "uk" | "ua" | "ukr" | "ukrainian" => Some(Language::Uk),
            _ => None,
        }
    }
}

mod client {
    use super::Language;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct ClientDto {
        pub id: String,
        pub first_name: String,
        pub last_name: String,
        #[serde(default)]
        pub middle_name: Option<String>,
        pub phone_number: String,
        #[serde(default)]
        pub preferred_language: Option<Language>,
        #[serde(default)]
        pub preferences: Vec<String>,
        #[serde(default)]
        pub note: Option<String>,
    }

    impl ClientDto {
        pub fn full_name(&self) -> String {
            match &self.middle_name {
                Some(middle) if !middle.is_empty() => {
                    format!("{} {} {}", self.first_name, middle, self.last_name)
                }
                _ => format!("{} {}", self.first_name, self.last_name),
            }
        }
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct CreateClientDto {
        pub first_name: String,
        pub last_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub middle_name: Option<String>,
        pub phone_number: String,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct UpdateClientNameDto {
        pub first_name: String,
        pub last_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub middle_name: Option<String>,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    pub struct UpdateClientPreferencesDto {
        pub preferences: Vec<String>,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    pub struct UpdateClientPreferredLanguageDto {
        pub language: Language,
    }
}
pub use client::*;

mod rental {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Price {
        pub amount_micros: i64,
        pub currency_code: String,
        #[serde(default)]
        pub amount_decimal: Option<f64>,
    }

    impl Price {
        pub fn amount(&self) -> f64 {
            self.amount_decimal
                .unwrap_or(self.amount_micros as f64 / 1_000_000.0)
        }
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct Location {
        #[serde(default)]
        pub street: String,
        #[serde(default)]
        pub city: Option<String>,
        #[serde(default)]
        pub house_number: String,
        #[serde(default)]
        pub apparent_number: Option<String>,
    }

    impl std::fmt::Display for Location {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{} {}", self.street, self.house_number)?;
            if let Some(apt) = self.apparent_number.as_deref().filter(|a| !a.is_empty()) {
                write!(f, ", apartment {apt}")?;
            }
            if let Some(city) = self.city.as_deref().filter(|c| !c.is_empty()) {
                write!(f, ", {city}")?;
            }
            Ok(())
        }
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    pub struct Amenity {
        pub title: String,
    }

    /// Rental description embedded in listings and accommodations.
    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct CompactRentalDto {
        pub id: String,
        pub price: Price,
        #[serde(default)]
        pub description: String,
        pub location: Location,
        #[serde(default)]
        pub amenities: Vec<Amenity>,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct RentalEmergencyDetailsDto {
        pub emergency_details: String,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct RentalSettlementDetailsDto {
        pub settlement_details: String,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct DaysSpanDto {
        pub start_date: String,
        pub end_date: String,
        pub days_count: f64,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct AvailableDateSpansDto {
        pub rental_id: String,
        pub available_spans: Vec<DaysSpanDto>,
    }
}
pub use rental::*;

mod accommodation {
    use super::{CompactRentalDto, DateDayDto};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct ClientAccommodationDto {
        pub id: String,
        pub client_id: String,
        /// Missing on malformed records; the stay check refuses those.
        #[serde(default)]
        pub rental_id: Option<String>,
        #[serde(default)]
        pub start_date: Option<DateDayDto>,
        #[serde(default)]
        pub end_date: Option<DateDayDto>,
        pub status: String,
        #[serde(default)]
        pub rental: Option<CompactRentalDto>,
    }

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct BookRentalDto {
        pub rental_id: String,
        pub client_id: String,
        pub start_date: DateDayDto,
        pub end_date: DateDayDto,
    }
}
pub use accommodation::*;

/// Calendar day as exchanged with the CRM: `{"year": 2025, "month": 2, "day": 21}`.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct DateDayDto {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DateDayDto {
    /// `None` for impossible dates such as 2025-02-30.
    pub fn to_naive_date(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl From<NaiveDate> for DateDayDto {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }
}

/// Parse a date as the LLM tends to produce it: ISO `YYYY-MM-DD` or `DD-MM-YYYY`/`DD.MM.YYYY`.
pub fn parse_day(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    ["%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accommodation_deserializes_from_camel_case() {
        let json = r#"{
            "id": "acc-1",
            "clientId": "c-1",
            "rentalId": "r-1",
            "startDate": {"year": 2025, "month": 5, "day": 1},
            "endDate": {"year": 2025, "month": 5, "day": 8},
            "status": "booking_confirmed",
            "rental": {
                "id": "r-1",
                "price": {"amountMicros": 100000000, "currencyCode": "USD", "amountDecimal": 100},
                "description": "Sunny flat",
                "location": {"street": "Khreshchatyk", "houseNumber": "1", "apparentNumber": "12"},
                "amenities": [{"title": "Wi-Fi"}]
            }
        }"#;
        let acc: ClientAccommodationDto = serde_json::from_str(json).unwrap();
        assert_eq!(acc.rental_id.as_deref(), Some("r-1"));
        assert_eq!(
            acc.start_date.unwrap().to_naive_date(),
            NaiveDate::from_ymd_opt(2025, 5, 1)
        );
        let rental = acc.rental.unwrap();
        assert_eq!(rental.location.to_string(), "Khreshchatyk 1, apartment 12");
        assert_eq!(rental.price.amount(), 100.0);
    }

    #[test]
    fn client_tolerates_null_optional_fields() {
        let json = r#"{
            "id": "c-1", "firstName": "Olena", "lastName": "Shevchenko", "middleName": null,
            "phoneNumber": "+380501112233", "preferredLanguage": "UK", "preferences": [], "note": null
        }"#;
        let client: ClientDto = serde_json::from_str(json).unwrap();
        assert_eq!(client.full_name(), "Olena Shevchenko");
        assert_eq!(client.preferred_language, Some(Language::Uk));
    }

    #[test]
    fn book_rental_serializes_day_objects() {
        let dto = BookRentalDto {
            rental_id: "r-1".into(),
            client_id: "c-1".into(),
            start_date: NaiveDate::from_ymd_opt(2025, 2, 20).unwrap().into(),
            end_date: NaiveDate::from_ymd_opt(2025, 2, 22).unwrap().into(),
        };
        let value = serde_json::to_value(&dto).unwrap();
        assert_eq!(value["rentalId"], "r-1");
        assert_eq!(value["startDate"]["month"], 2);
        assert_eq!(value["endDate"]["day"], 22);
    }

    #[test]
    fn parse_day_accepts_iso_and_day_first() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 31);
        assert_eq!(parse_day("2025-03-31"), expected);
        assert_eq!(parse_day("31-03-2025"), expected);
        assert_eq!(parse_day(" 31.03.2025 "), expected);
        assert_eq!(parse_day("March 31st"), None);
    }

    #[test]
    fn impossible_day_has_no_date() {
        let day = DateDayDto {
            year: 2025,
            month: 2,
            day: 30,
        };
        assert_eq!(day.to_naive_date(), None);
    }

    #[test]
    fn language_parses_leniently() {
        assert_eq!(Language::parse_lenient("English"), Some(Language::En));
        assert_eq!(Language::parse_lenient("ukrainian"), Some(Language::Uk));
        assert_eq!(Language::parse_lenient("klingon"), None);
    }
}

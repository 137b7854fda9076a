use rentwatch_core::Furnishing;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::form_urlencoded;

/// The catalog never returns more than this many items per page.
pub const MAX_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    #[default]
    Rent,
    Sale,
}

impl Operation {
    pub fn as_param(&self) -> &'static str {
        match self {
            Operation::Rent => "rent",
            Operation::Sale => "sale",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    #[default]
    Homes,
    Offices,
    Premises,
    Garages,
    Bedrooms,
}

impl PropertyType {
    pub fn as_param(&self) -> &'static str {
        match self {
            PropertyType::Homes => "homes",
            PropertyType::Offices => "offices",
            PropertyType::Premises => "premises",
            PropertyType::Garages => "garages",
            PropertyType::Bedrooms => "bedrooms",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Preservation {
    #[default]
    Good,
    Renew,
}

impl Preservation {
    pub fn as_param(&self) -> &'static str {
        match self {
            Preservation::Good => "good",
            Preservation::Renew => "renew",
        }
    }
}

/// Recency window for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SinceDate {
    /// Rentals only, rooms excluded.
    LastDay,
    /// Sales and rooms only.
    LastTwoDays,
    #[default]
    LastWeek,
    LastMonth,
}

impl SinceDate {
    pub fn as_param(&self) -> &'static str {
        match self {
            SinceDate::LastDay => "T",
            SinceDate::LastTwoDays => "Y",
            SinceDate::LastWeek => "W",
            SinceDate::LastMonth => "M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderField {
    Distance,
    Price,
    Street,
    Photos,
    PublicationDate,
    ModificationDate,
    Size,
    Floor,
    Rooms,
    #[default]
    #[serde(rename = "ratioeurm2")]
    RatioEurM2,
}

impl OrderField {
    pub fn as_param(&self) -> &'static str {
        match self {
            OrderField::Distance => "distance",
            OrderField::Price => "price",
            OrderField::Street => "street",
            OrderField::Photos => "photos",
            OrderField::PublicationDate => "publicationDate",
            OrderField::ModificationDate => "modificationDate",
            OrderField::Size => "size",
            OrderField::Floor => "floor",
            OrderField::Rooms => "rooms",
            OrderField::RatioEurM2 => "ratioeurm2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_param(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Search area: a point plus radius, or a catalog location identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Center {
        /// `"lat,lon"`.
        center: String,
        /// Radius in metres.
        distance: u32,
    },
    Id { location_id: String },
}

impl Default for Location {
    fn default() -> Self {
        // Madrid, Puerta del Sol, 5 km.
        Location::Center {
            center: "40.416944,-3.703333".to_string(),
            distance: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("locale must not be empty")]
    EmptyLocale,
    #[error("bedroom count {0} out of range (0..=4, 4 meaning four or more)")]
    BedroomsOutOfRange(u8),
    #[error("min_price {min} exceeds max_price {max}")]
    PriceRange { min: u32, max: u32 },
    #[error("search location must not be empty")]
    EmptyLocation,
}

/// Filters shared by every page request of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub locale: String,
    pub operation: Operation,
    pub property_type: PropertyType,
    pub location: Location,
    /// Only listings with pictures, a video or a virtual tour.
    pub has_multimedia: bool,
    pub preservation: Preservation,
    pub max_price: Option<u32>,
    pub min_price: Option<u32>,
    /// Square metres.
    pub min_size: Option<u32>,
    pub since_date: SinceDate,
    pub order: OrderField,
    pub sort: SortDirection,
    /// Accepted bedroom counts; empty means any.
    pub bedrooms: Vec<u8>,
    pub air_conditioning: Option<bool>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            locale: "es".to_string(),
            operation: Operation::default(),
            property_type: PropertyType::default(),
            location: Location::default(),
            has_multimedia: true,
            preservation: Preservation::default(),
            max_price: None,
            min_price: Some(200),
            min_size: Some(40),
            since_date: SinceDate::default(),
            order: OrderField::default(),
            sort: SortDirection::default(),
            bedrooms: Vec::new(),
            air_conditioning: None,
        }
    }
}

fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

impl SearchQuery {
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.locale.trim().is_empty() {
            return Err(QueryError::EmptyLocale);
        }
        if let Some(&n) = self.bedrooms.iter().find(|&&n| n > 4) {
            return Err(QueryError::BedroomsOutOfRange(n));
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(QueryError::PriceRange { min, max });
            }
        }
        let empty_location = match &self.location {
            Location::Center { center, .. } => center.trim().is_empty(),
            Location::Id { location_id } => location_id.trim().is_empty(),
        };
        if empty_location {
            return Err(QueryError::EmptyLocation);
        }
        Ok(())
    }

    /// Form-urlencode the query in the catalog's parameter order.
    ///
    /// Absent optionals are omitted; `page_size` is clamped to [`MAX_PAGE_SIZE`].
    pub fn encode(&self, page_size: u32, facet: Option<Furnishing>, page: Option<u32>) -> String {
        let mut out = form_urlencoded::Serializer::new(String::new());
        out.append_pair("locale", &self.locale)
            .append_pair("operation", self.operation.as_param())
            .append_pair("propertyType", self.property_type.as_param());

        match &self.location {
            Location::Id { location_id } => {
                out.append_pair("locationId", location_id);
            }
            Location::Center { center, distance } => {
                out.append_pair("center", center)
                    .append_pair("distance", &distance.to_string());
            }
        }

        out.append_pair("hasMultimedia", python_bool(self.has_multimedia))
            .append_pair("preservation", self.preservation.as_param())
            .append_pair("maxItems", &page_size.clamp(1, MAX_PAGE_SIZE).to_string());
        if let Some(max_price) = self.max_price {
            out.append_pair("maxPrice", &max_price.to_string());
        }
        if let Some(min_price) = self.min_price {
            out.append_pair("minPrice", &min_price.to_string());
        }
        if let Some(min_size) = self.min_size {
            out.append_pair("minSize", &min_size.to_string());
        }
        out.append_pair("sinceDate", self.since_date.as_param())
            .append_pair("order", self.order.as_param())
            .append_pair("sort", self.sort.as_param());

        if !self.bedrooms.is_empty() {
            let joined = self
                .bedrooms
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.append_pair("bedrooms", &joined);
        }
        if let Some(facet) = facet {
            out.append_pair("furnished", facet.as_str());
        }
        if let Some(air_conditioning) = self.air_conditioning {
            out.append_pair("airConditioning", python_bool(air_conditioning));
        }
        if let Some(page) = page {
            out.append_pair("numPage", &page.to_string());
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_id_query_matches_catalog_parameter_order() {
        let query = SearchQuery {
            location: Location::Id {
                location_id: "0-EU-ES-28".into(),
            },
            ..Default::default()
        };
        assert_eq!(
            query.encode(50, Some(Furnishing::FurnishedKitchen), None),
            "locale=es&operation=rent&propertyType=homes&locationId=0-EU-ES-28&hasMultimedia=True&\
             preservation=good&maxItems=50&minPrice=200&minSize=40&sinceDate=W&\
             order=ratioeurm2&sort=asc&furnished=furnishedKitchen"
        );
    }

    #[test]
    fn default_query_encodes_center_and_paging() {
        let query = SearchQuery {
            bedrooms: vec![1, 4],
            max_price: Some(1800),
            air_conditioning: Some(true),
            ..Default::default()
        };
        let encoded = query.encode(80, Some(Furnishing::Furnished), Some(3));
        assert_eq!(
            encoded,
            "locale=es&operation=rent&propertyType=homes&center=40.416944%2C-3.703333&\
             distance=5000&hasMultimedia=True&preservation=good&maxItems=50&maxPrice=1800&\
             minPrice=200&minSize=40&sinceDate=W&order=ratioeurm2&sort=asc&bedrooms=1%2C4&\
             furnished=furnished&airConditioning=True&numPage=3"
        );
    }

    #[test]
    fn validation_rejects_impossible_filters() {
        assert_eq!(SearchQuery::default().validate(), Ok(()));
        let too_many_rooms = SearchQuery {
            bedrooms: vec![2, 7],
            ..Default::default()
        };
        assert_eq!(too_many_rooms.validate(), Err(QueryError::BedroomsOutOfRange(7)));
        let inverted = SearchQuery {
            min_price: Some(900),
            max_price: Some(500),
            ..Default::default()
        };
        assert_eq!(
            inverted.validate(),
            Err(QueryError::PriceRange { min: 900, max: 500 })
        );
    }

    #[test]
    fn query_deserializes_from_partial_config() {
        let query: SearchQuery = serde_json::from_str(
            r#"{"location":{"location_id":"0-EU-ES-28"},"since_date":"lastMonth","order":"price"}"#,
        )
        .unwrap();
        assert_eq!(
            query.location,
            Location::Id {
                location_id: "0-EU-ES-28".into()
            }
        );
        assert_eq!(query.since_date, SinceDate::LastMonth);
        assert_eq!(query.order, OrderField::Price);
        assert_eq!(query.min_price, Some(200));
    }
}

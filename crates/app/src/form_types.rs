//! Terminal domain form types
//!
//! | type | input | stored as |
//! |---|---|---|
//! | `wagon` | UIC wagon number, 12 digits, spaces/dashes ignored | `"318054751173"` |
//! | `location` | `lat,lon` in decimal degrees | `{"lat": 53.54, "lon": 9.98}` |
//! | `vport` | UN/LOCODE of a vessel port | `"DEHAM"` |
//! | `wport` | `<LOCODE>-<yard>` | `{"locode": "DEHAM", "yard": "EUROKAI"}` |

use std::sync::{Arc, LazyLock};

use conveyor_engine::definition::FormProperty;
use conveyor_engine::form::{FormError, FormType};
use regex::Regex;
use serde_json::{json, Value};

static LOCODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{2}[A-Z2-9]{3}$").expect("valid LOCODE pattern")
});

static YARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z0-9]{1,12}$").expect("valid yard pattern")
});

fn invalid(property: &FormProperty, message: impl Into<String>) -> FormError {
    FormError::InvalidValue {
        property: property.id.clone(),
        message: message.into(),
    }
}

/// All domain types, ready for `add_custom_form_type`
pub fn custom_form_types() -> Vec<Arc<dyn FormType>> {
    vec![
        Arc::new(WagonFormType),
        Arc::new(LocationFormType),
        Arc::new(VesselPortFormType),
        Arc::new(WagonPortFormType),
    ]
}

/// Check digit of the first 11 digits of a UIC wagon number
///
/// Digits are weighted 2,1,2,1,... from the left; the digit sums of the
/// products are added and the check digit tops the total up to a multiple
/// of ten.
pub fn uic_check_digit(digits: &[u8]) -> u8 {
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let product = u32::from(*d) * if i % 2 == 0 { 2 } else { 1 };
            product / 10 + product % 10
        })
        .sum();
    ((10 - sum % 10) % 10) as u8
}

pub struct WagonFormType;

impl FormType for WagonFormType {
    fn name(&self) -> &str {
        "wagon"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        let cleaned: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(property, format!("'{text}' is not a 12-digit wagon number")));
        }
        let digits: Vec<u8> = cleaned.bytes().map(|b| b - b'0').collect();
        let expected = uic_check_digit(&digits[..11]);
        if digits[11] != expected {
            return Err(invalid(
                property,
                format!("wagon number '{text}' has check digit {}, expected {expected}", digits[11]),
            ));
        }
        Ok(Value::String(cleaned))
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        let number = value.as_str()?;
        if number.len() != 12 || !number.is_ascii() {
            return Some(number.to_string());
        }
        // 31 80 5475 117-3
        Some(format!(
            "{} {} {} {}-{}",
            &number[0..2],
            &number[2..4],
            &number[4..8],
            &number[8..11],
            &number[11..]
        ))
    }
}

pub struct LocationFormType;

impl FormType for LocationFormType {
    fn name(&self) -> &str {
        "location"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        let Some((lat, lon)) = text.split_once(',') else {
            return Err(invalid(property, format!("'{text}' is not a 'lat,lon' pair")));
        };
        let coordinate = |raw: &str, limit: f64, axis: &str| {
            raw.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && v.abs() <= limit)
                .ok_or_else(|| invalid(property, format!("{axis} '{}' is out of range", raw.trim())))
        };
        let lat = coordinate(lat, 90.0, "latitude")?;
        let lon = coordinate(lon, 180.0, "longitude")?;
        Ok(json!({ "lat": lat, "lon": lon }))
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        let lat = value.get("lat")?.as_f64()?;
        let lon = value.get("lon")?.as_f64()?;
        Some(format!("{lat},{lon}"))
    }
}

pub struct VesselPortFormType;

impl FormType for VesselPortFormType {
    fn name(&self) -> &str {
        "vport"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        let code = text.trim().replace(' ', "").to_ascii_uppercase();
        if LOCODE.is_match(&code) {
            Ok(Value::String(code))
        } else {
            Err(invalid(property, format!("'{text}' is not a UN/LOCODE")))
        }
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        value.as_str().map(str::to_string)
    }
}

pub struct WagonPortFormType;

impl FormType for WagonPortFormType {
    fn name(&self) -> &str {
        "wport"
    }

    fn to_model_value(&self, property: &FormProperty, text: &str) -> Result<Value, FormError> {
        let upper = text.trim().to_ascii_uppercase();
        let Some((locode, yard)) = upper.split_once('-') else {
            return Err(invalid(property, format!("'{text}' is not '<LOCODE>-<yard>'")));
        };
        if !LOCODE.is_match(locode) {
            return Err(invalid(property, format!("'{locode}' is not a UN/LOCODE")));
        }
        if !YARD.is_match(yard) {
            return Err(invalid(property, format!("'{yard}' is not a yard code")));
        }
        Ok(json!({ "locode": locode, "yard": yard }))
    }

    fn to_form_value(&self, _property: &FormProperty, value: &Value) -> Option<String> {
        let locode = value.get("locode")?.as_str()?;
        let yard = value.get("yard")?.as_str()?;
        Some(format!("{locode}-{yard}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property() -> FormProperty {
        serde_json::from_value(json!({"id": "field", "type": "string"})).unwrap()
    }

    #[test]
    fn test_uic_check_digit() {
        // 21 81 2471 217-3
        assert_eq!(uic_check_digit(&[2, 1, 8, 1, 2, 4, 7, 1, 2, 1, 7]), 3);
        // 31 80 5475 117-3
        assert_eq!(uic_check_digit(&[3, 1, 8, 0, 5, 4, 7, 5, 1, 1, 7]), 3);
    }

    #[test]
    fn test_wagon_numbers() {
        let wagon = WagonFormType;
        let p = property();
        let value = wagon.to_model_value(&p, "31 80 5475 117-3").unwrap();
        assert_eq!(value, json!("318054751173"));
        assert_eq!(wagon.to_form_value(&p, &value).unwrap(), "31 80 5475 117-3");

        assert!(wagon.to_model_value(&p, "318054751176").is_err());
        assert!(wagon.to_model_value(&p, "3180547511").is_err());
        assert!(wagon.to_model_value(&p, "31805475117X").is_err());
    }

    #[test]
    fn test_location() {
        let location = LocationFormType;
        let p = property();
        let value = location.to_model_value(&p, "53.5461, 9.9661").unwrap();
        assert_eq!(value, json!({"lat": 53.5461, "lon": 9.9661}));
        assert_eq!(location.to_form_value(&p, &value).unwrap(), "53.5461,9.9661");

        assert!(location.to_model_value(&p, "91,0").is_err());
        assert!(location.to_model_value(&p, "0,181").is_err());
        assert!(location.to_model_value(&p, "hamburg").is_err());
    }

    #[test]
    fn test_ports() {
        let p = property();
        assert_eq!(VesselPortFormType.to_model_value(&p, " de ham ").unwrap(), json!("DEHAM"));
        assert!(VesselPortFormType.to_model_value(&p, "DEHAMB").is_err());
        assert!(VesselPortFormType.to_model_value(&p, "D1HAM").is_err());

        let value = WagonPortFormType.to_model_value(&p, "nlrtm-maasvlakte2").unwrap();
        assert_eq!(value, json!({"locode": "NLRTM", "yard": "MAASVLAKTE2"}));
        assert_eq!(WagonPortFormType.to_form_value(&p, &value).unwrap(), "NLRTM-MAASVLAKTE2");
        assert!(WagonPortFormType.to_model_value(&p, "NLRTM").is_err());
        assert!(WagonPortFormType.to_model_value(&p, "NLRTM-").is_err());
    }

    #[test]
    fn test_registry_names() {
        let names: Vec<_> = custom_form_types().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, ["wagon", "location", "vport", "wport"]);
    }
}

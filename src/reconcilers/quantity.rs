use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;

use crate::{Error, Result};

fn quantity_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"^(?P<number>[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+))(?P<suffix>Ki|Mi|Gi|Ti|Pi|Ei|[eE][+-]?[0-9]+|m|k|M|G|T|P|E)?$",
        )
        .expect("static quantity pattern compiles")
    })
}

/// Validates `value` as a Kubernetes quantity for `field`
pub fn parse_quantity(field: &str, value: &str) -> Result<Quantity> {
    let value = value.trim();
    if quantity_regex().is_match(value) {
        Ok(Quantity(value.to_string()))
    } else {
        Err(Error::InvalidQuantity {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

/// Byte count of a storage quantity, truncated towards zero
pub fn to_bytes(quantity: &Quantity) -> Result<i64> {
    let invalid = || Error::InvalidQuantity {
        field: "bytes".into(),
        value: quantity.0.clone(),
    };
    let caps = quantity_regex().captures(quantity.0.trim()).ok_or_else(invalid)?;
    let number: f64 = caps["number"].parse().map_err(|_| invalid())?;
    let multiplier = match caps.name("suffix").map(|m| m.as_str()) {
        None => 1f64,
        Some("m") => 1e-3,
        Some("k") => 1e3,
        Some("M") => 1e6,
        Some("G") => 1e9,
        Some("T") => 1e12,
        Some("P") => 1e15,
        Some("E") => 1e18,
        Some("Ki") => 1024f64,
        Some("Mi") => 1024f64.powi(2),
        Some("Gi") => 1024f64.powi(3),
        Some("Ti") => 1024f64.powi(4),
        Some("Pi") => 1024f64.powi(5),
        Some("Ei") => 1024f64.powi(6),
        Some(exponent) => {
            let exp: i32 = exponent[1..].parse().map_err(|_| invalid())?;
            10f64.powi(exp)
        }
    };
    #[allow(clippy::cast_possible_truncation)]
    Ok((number * multiplier) as i64)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("100m")]
    #[case("0.5")]
    #[case("128Mi")]
    #[case("10Gi")]
    #[case("1e3")]
    #[case("2")]
    fn accepts_valid_quantities(#[case] value: &str) {
        assert_eq!(parse_quantity("memory", value).unwrap().0, value);
    }

    #[rstest]
    #[case("")]
    #[case("ten")]
    #[case("10GB")]
    #[case("12345r")]
    #[case("1..2")]
    fn rejects_invalid_quantities(#[case] value: &str) {
        let err = parse_quantity("size", value).unwrap_err();
        assert!(matches!(err, Error::InvalidQuantity { field, .. } if field == "size"));
    }

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(to_bytes(&Quantity("1Mi".into())).unwrap(), 1_048_576);
        assert_eq!(to_bytes(&Quantity("1G".into())).unwrap(), 1_000_000_000);
        assert_eq!(to_bytes(&Quantity("0Gi".into())).unwrap(), 0);
        assert_eq!(to_bytes(&Quantity("1.5Gi".into())).unwrap(), 1_610_612_736);
    }
}

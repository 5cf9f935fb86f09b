use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("quantity {0:?} is empty or contains non-ascii characters")]
    InvalidFormat(String),

    #[error("quantity {0:?} does not start with a number")]
    InvalidNumber(String),

    #[error("quantity {0:?} has an unknown suffix")]
    InvalidSuffix(String),

    #[error("quantity {0:?} is negative")]
    Negative(String),
}

/// Multiplier for a binary, decimal or exponent suffix.
fn suffix_factor(suffix: &str) -> Option<f64> {
    let factor = match suffix {
        "" => 1.0,
        "Ki" => 2f64.powi(10),
        "Mi" => 2f64.powi(20),
        "Gi" => 2f64.powi(30),
        "Ti" => 2f64.powi(40),
        "Pi" => 2f64.powi(50),
        "Ei" => 2f64.powi(60),
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            10f64.powi(i32::from_str(exponent).ok()?)
        }
    };

    Some(factor)
}

/// Value of a storage quantity in bytes; fractional bytes round up.
pub fn to_bytes(quantity: &Quantity) -> Result<u64, Error> {
    let input = quantity.0.trim();
    if input.is_empty() || !input.is_ascii() {
        return Err(Error::InvalidFormat(quantity.0.clone()));
    }

    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(input.len());
    let (number, suffix) = input.split_at(split);

    let value = f64::from_str(number).map_err(|_| Error::InvalidNumber(quantity.0.clone()))?;
    let factor = suffix_factor(suffix).ok_or_else(|| Error::InvalidSuffix(quantity.0.clone()))?;
    if value < 0.0 {
        return Err(Error::Negative(quantity.0.clone()));
    }

    Ok((value * factor).ceil() as u64)
}

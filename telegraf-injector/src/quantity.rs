//! Kubernetes resource quantities and override resolution.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SUFFIXES: [&str; 9] = ["n", "u", "m", "k", "M", "G", "T", "P", "E"];

/// Parses a quantity such as `100m`, `1.5Gi` or `1e3`, following the grammar of the
/// Kubernetes API server.
pub fn parse_quantity(value: &str) -> Result<Quantity> {
    let invalid = || Error::InvalidQuantity(value.to_string());

    let unsigned = value
        .strip_prefix(['+', '-'])
        .unwrap_or(value);
    let number_len = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    if !is_number(number) || !is_suffix(suffix) {
        return Err(invalid());
    }

    Ok(Quantity(value.to_string()))
}

fn is_number(number: &str) -> bool {
    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();

    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    match fraction {
        None => !whole.is_empty() && digits(whole),
        Some(fraction) => {
            !(whole.is_empty() && fraction.is_empty()) && digits(whole) && digits(fraction)
        }
    }
}

fn is_suffix(suffix: &str) -> bool {
    if suffix.is_empty() || BINARY_SUFFIXES.contains(&suffix) || DECIMAL_SUFFIXES.contains(&suffix)
    {
        return true;
    }

    // Decimal exponent, e.g. `e3` or `E-2`.
    match suffix.strip_prefix(['e', 'E']) {
        Some(exponent) => {
            let exponent = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            !exponent.is_empty() && exponent.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// The outcome of resolving a per-pod override against an operator default.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    /// True when the default was used, either because no override was given or
    /// because the override could not be parsed.
    pub used_fallback: bool,
}

/// Uses `custom` when it parses, otherwise the default. Only an invalid default is an error.
pub fn resolve_with_fallback(custom: Option<&str>, default: &str) -> Result<Resolved<Quantity>> {
    if let Some(custom) = custom {
        match parse_quantity(custom) {
            Ok(value) => {
                return Ok(Resolved {
                    value,
                    used_fallback: false,
                })
            }
            Err(err) => tracing::info!("{}, using default {:?}", err, default),
        }
    }

    Ok(Resolved {
        value: parse_quantity(default)?,
        used_fallback: true,
    })
}

//! Domain types for the product catalog.

use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Display name of a product.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductName(String);

/// A product that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Display name
    pub name: ProductName,
    /// Unit price
    pub price: Decimal,
    /// Units in stock
    pub stock: u32,
}

/// Why an incoming product could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidProduct {
    /// Name was empty or too long
    #[error("invalid product name: {0}")]
    Name(String),
    /// Price was negative
    #[error("price must not be negative, got {0}")]
    NegativePrice(Decimal),
}

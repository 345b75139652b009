//! Benchmark utilities.

#![warn(missing_docs)]

use rand::Rng;
use realmkit_core::{ObjectSchema, Property, PropertyType, Schema, Value};

/// `Item { id: int, payload: data }`.
pub fn item_schema() -> Schema {
    Schema::new(vec![ObjectSchema::new(
        "Item",
        vec![
            Property::new("id", PropertyType::Int),
            Property::new("payload", PropertyType::Data),
        ],
    )])
}

/// Generate random payload bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` item rows with payloads of `payload_size` bytes.
pub fn generate_items(count: usize, payload_size: usize) -> Vec<[(&'static str, Value); 2]> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            [
                ("id", Value::Int(rng.gen())),
                ("payload", Value::Data(random_data(payload_size))),
            ]
        })
        .collect()
}

pub mod aggregate;
pub mod enrich;

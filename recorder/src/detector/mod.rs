pub mod differ;
pub mod ring;

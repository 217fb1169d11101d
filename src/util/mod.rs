pub mod asn1;
pub mod cryptoutil;

pub mod diagnoses;
pub mod measurements;

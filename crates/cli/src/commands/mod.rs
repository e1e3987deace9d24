pub mod alerts;
pub mod export;
pub mod features;
pub mod status;

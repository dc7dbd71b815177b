// Business domains
pub mod admission;
pub mod chat;

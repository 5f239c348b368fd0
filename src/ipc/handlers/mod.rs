pub mod access;
pub mod backup;
pub mod core;
pub mod custom_fields;
pub mod dashboard;
pub mod invoices;
pub mod rules;
pub mod setup;
pub mod staging;
pub mod students;
pub mod users;

pub mod constraints;
pub mod health;
pub mod tasks;
pub mod workers;

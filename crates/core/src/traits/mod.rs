pub mod broadcast;
pub mod callback;
pub mod lookup;
pub mod repository;

pub use broadcast::*;
pub use callback::*;
pub use lookup::*;
pub use repository::*;

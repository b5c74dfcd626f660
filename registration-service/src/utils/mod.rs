pub mod order_code;
pub mod validation;

pub use validation::ValidatedJson;

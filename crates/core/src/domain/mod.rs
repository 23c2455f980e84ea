pub mod escalation;
pub mod payment;
pub mod product;
pub mod quote;
pub mod session;

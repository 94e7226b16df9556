//! Routing - server selection strategies and the domain router

mod router;
mod strategy;

pub use router::{Delivery, DomainRouter, Route};
pub use strategy::{select, SelectionState, Strategy};

//! Request handlers mounted by [`crate::server::create_router`].

pub mod loops;
pub mod terminal;

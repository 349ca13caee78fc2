pub mod listener;
pub mod routes;
pub mod session;

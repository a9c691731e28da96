#![forbid(unsafe_code)]

pub mod assign;
pub mod health;
pub mod http;
pub mod ipregion;
pub mod naming;

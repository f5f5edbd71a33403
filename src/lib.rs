#![warn(rust_2018_idioms)]

#[macro_use]
extern crate slog_scope;

#[macro_use]
pub mod error;
pub mod capture;
pub mod config;
pub mod exchange;
pub mod limiter;
pub mod logging;
pub mod matcher;
pub mod query;
pub mod respond;
pub mod server;
pub mod settings;
pub mod steps;
pub mod store;
pub mod template;
pub mod web;
pub mod wsdl;

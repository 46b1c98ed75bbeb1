//! Fees Service - Invoice lifecycle and payment reconciliation for school fee billing.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

//! Shared building blocks for Parley services: domain entity types, the wire
//! error shape, password hashing and policy checks, and transcript rendering.

pub mod auth;
pub mod entities;
pub mod error;
pub mod transcript;

//! Contracts for the collaborators around the dispatch core, each with an
//! in-memory adapter.

pub mod auth;
pub mod broker;
pub mod locator;
pub mod repository;

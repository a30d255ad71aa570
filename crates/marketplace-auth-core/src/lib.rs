//! Credential lifecycle for the marketplace: per-provider token storage,
//! coalesced refresh, session validation, loop-safe redirects and sign-out.

pub mod auth;
pub mod config;

#[cfg(test)]
mod testutil;

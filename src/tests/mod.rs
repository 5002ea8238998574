//! Integration-style tests spanning more than one component, the way the
//! teacher keeps multi-tenant/service-level scenarios apart from the
//! per-module `#[cfg(test)]` blocks.

mod common;
mod ingest_search_test;

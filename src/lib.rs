#![forbid(unsafe_code)]

//! Batch tooling for archiving short-form videos found through the research
//! API: `collect_metadata` pages the search endpoint into dated tables and
//! `collect_videos` downloads and validates the media those tables point at.

pub mod collector;
pub mod config;
pub mod fetcher;
pub mod logging;
pub mod record;
pub mod research_api;
pub mod retry;
pub mod signature;
pub mod table;
pub mod visibility;

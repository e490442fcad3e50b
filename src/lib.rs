//! # sheetsense
//!
//! Reads rows from a Google Sheet, has Gemini analyze each one, and keeps
//! embeddings of the analyses in a local vector store for semantic lookup.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Google Sheets│──▶│ Protocol │──▶│    Gemini    │──▶│  SQLite  │
//! │   (source)   │   │ messages │   │ analyze+embed│   │  vectors │
//! └──────────────┘   └──────────┘   └──────────────┘   └────┬─────┘
//!                                                           │
//!                                      ┌────────────────────┤
//!                                      ▼                    ▼
//!                                 ┌──────────┐        ┌──────────┐
//!                                 │   CLI    │        │   HTTP   │
//!                                 │(sheetsense)       │  tools   │
//!                                 └──────────┘        └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`error`] | Stage-tagged error type |
//! | [`models`] | Records, cells, analysis requests and results |
//! | [`auth`] | Google OAuth token cache |
//! | [`sheets`] | Data source adapter |
//! | [`gemini`] | Analysis client (generate, embed, chat) |
//! | [`protocol`] | Fixed message schema and conversation context |
//! | [`store`] | Vector store trait and backends |
//! | [`pipeline`] | Run, insights, search |
//! | [`tools`] | Tool trait and built-in tools |
//! | [`server`] | HTTP tool server |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema creation |

pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod gemini;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod sheets;
pub mod store;
pub mod tools;

pub use error::{Error, Result};

pub mod commission;
pub mod config;
pub mod dlq;
pub mod domain;
pub mod effects;
pub mod engine;
pub mod escrow;
pub mod gateway;
pub mod ingestion;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod reconciliation;
pub mod report;
pub mod store;
pub mod tasks;
pub mod webhook;
pub mod withdrawal;

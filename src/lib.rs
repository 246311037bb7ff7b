//! Window aggregation of tagged numeric metric records.
//!
//! Records are normalized into canonical events ([`source`]), grouped per
//! tag, time bucket and segment ([`sink::aggregated`]), and written to one of
//! the configured exporters: a dictionary-encoded relational row store, a
//! push-gauge HTTP API, a key/value metrics HTTP API, or stdout.

pub mod agent;
pub mod config;
pub mod export;
pub mod sink;
pub mod source;

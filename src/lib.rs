//! Sortinghat — on-device file-organization assistant core.
//!
//! A memory-budgeted priority scheduler drives local LLM inference to
//! produce ranked rename, classification, summary, and metadata
//! suggestions for user files. The crate is organised around five
//! components: the Agent Manager ([`agent`]), the Task Generator
//! ([`generator`]), the Analysis Service ([`analysis`]), the Error
//! Recovery Manager ([`recovery`]), and the Confidence Scorer
//! ([`scoring`]), plus the external contracts they consume
//! ([`inference`], [`store`]).
#![allow(missing_docs)] // TODO: enforce once the event payload surface settles

pub mod agent;
pub mod analysis;
pub mod config;
pub mod events;
pub mod generator;
pub mod inference;
pub mod logging;
pub mod recovery;
pub mod scoring;
pub mod store;
pub mod types;

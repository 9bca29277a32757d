//! # quizsync-core
//!
//! Foundation types, errors, branded IDs, and utilities for the quizsync
//! session synchronization runtime.
//!
//! This crate provides the shared vocabulary that the other quizsync crates
//! depend on:
//!
//! - **Branded IDs**: `RequestId`, `ConnectionId`, `SubscriptionId` newtypes
//! - **Errors**: `ClientError` taxonomy via `thiserror`
//! - **Protocol**: outbound/inbound frame envelopes, command and event names
//! - **Model**: `SessionSnapshot`, `Participant`, `AnswerSubmission`
//! - **Backoff**: reconnect delay calculation
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod backoff;
pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod model;
pub mod protocol;

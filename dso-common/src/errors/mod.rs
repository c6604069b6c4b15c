//! Error catalog and definitions for the Device State Orchestrator
//!
//! This module provides an error catalog with unique error codes,
//! categorized by subsystem. Each error includes remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                               |
//! |------------|-------------|-------------------------------------------|
//! | E001-E099  | Config      | Configuration and environment errors      |
//! | E100-E199  | Session     | Device discovery, handshake and transport |
//! | E200-E299  | Detection   | Variant detection                         |
//! | E300-E399  | Snapshot    | Snapshot capture, restore and retention   |
//! | E400-E499  | Transfer    | Artifacts, writes and verification        |
//! | E500-E599  | Internal    | Internal/unexpected errors                |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

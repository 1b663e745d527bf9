// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Entry Point
//!
//! Verifies the laws the pipeline depends on: codec round-trips,
//! transform purity, and channel scheduling order, for all valid
//! inputs.

mod property;

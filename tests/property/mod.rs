// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property test modules

mod channel_laws;
mod codec_laws;
mod transform_laws;
